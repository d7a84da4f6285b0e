//! Per-CPU state and the bring-up sequence that installs it (§3, §4.4).
//!
//! Identity is resolved by reading a dedicated MSR ([`msr::IA32_KERNEL_GS_BASE`])
//! rather than walking a table, so `current()` is O(1) from any context,
//! including interrupt handlers.

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod msr;
pub mod smp;

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::sched::task::ThreadHandle;

pub const MAX_CPUS: usize = 256;
const VENDOR_LEN: usize = 12;
const MODEL_LEN: usize = 48;

/// Per-CPU descriptor (§3's "Per-CPU descriptor").
#[repr(C)]
pub struct CpuLocal {
    pub id: u32,
    pub vendor: [u8; VENDOR_LEN],
    pub model: [u8; MODEL_LEN],
    pub running: Option<ThreadHandle>,
    pub ready_head: Option<ThreadHandle>,
    pub thread_count: u32,
    stack_base: u64,
}

impl CpuLocal {
    const fn new(id: u32) -> Self {
        Self {
            id,
            vendor: [0; VENDOR_LEN],
            model: [0; MODEL_LEN],
            running: None,
            ready_head: None,
            thread_count: 0,
            stack_base: 0,
        }
    }

    pub fn vendor_str(&self) -> &str {
        str_from_bytes(&self.vendor)
    }

    pub fn model_str(&self) -> &str {
        str_from_bytes(&self.model)
    }
}

fn str_from_bytes(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..len]).unwrap_or("")
}

static NEXT_SEQ_ID: AtomicU32 = AtomicU32::new(0);

/// Lock-free table from final (LAPIC) id to descriptor, populated by
/// `cpu_init` once each CPU knows its real id. Read from any CPU, e.g. by
/// the scheduler choosing the least-loaded target for a new thread.
static CPU_TABLE: [AtomicPtr<CpuLocal>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];
static ONLINE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Install this CPU's GDT/IDT (already done by the caller for the BSP's
/// first pass) and give it a provisional sequence-number identity, stashed
/// in [`msr::IA32_KERNEL_GS_BASE`] so `current()` works before the real
/// LAPIC id is known.
pub fn cpu_early_init(_hint_id: u8) {
    let seq = NEXT_SEQ_ID.fetch_add(1, Ordering::AcqRel);
    let descriptor = alloc::boxed::Box::leak(alloc::boxed::Box::new(CpuLocal::new(seq)));
    msr::wrmsr(msr::IA32_KERNEL_GS_BASE, descriptor as *mut CpuLocal as u64);
}

/// Replace the sequence id with the real LAPIC id and fill in vendor/model
/// strings read via CPUID. Runs once per CPU, after the APIC is available.
pub fn cpu_init() {
    let lapic_id = apic::read_id().unwrap_or(0) as u32;

    let cpu = current_mut();
    cpu.id = lapic_id;

    write_str(&mut cpu.vendor, &cpuid_vendor());
    if let Some(brand) = cpuid_brand_string() {
        write_str(&mut cpu.model, &brand);
    }

    CPU_TABLE[cpu.id as usize].store(cpu as *mut CpuLocal, Ordering::Release);
    ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);

    crate::kinfo!(
        "CPU {} online: {} / {}",
        cpu.id,
        cpu.vendor_str(),
        cpu.model_str()
    );
}

/// Look up a CPU's descriptor by its LAPIC id. Panics if that CPU has not
/// reached `cpu_init` yet.
pub fn cpu_local(id: usize) -> &'static CpuLocal {
    let p = CPU_TABLE[id].load(Ordering::Acquire);
    assert!(!p.is_null(), "CPU {} not online", id);
    // SAFETY: a non-null entry was stored by that CPU's `cpu_init` and
    // points at a leaked, 'static descriptor.
    unsafe { &*p }
}

#[allow(clippy::mut_from_ref)]
pub fn cpu_local_mut(id: usize) -> &'static mut CpuLocal {
    let p = CPU_TABLE[id].load(Ordering::Acquire);
    assert!(!p.is_null(), "CPU {} not online", id);
    // SAFETY: see `cpu_local`; ready-queue fields are only touched under
    // the IRQ-lock documented in `crate::sched::queue`.
    unsafe { &mut *p }
}

/// Number of CPUs that have completed `cpu_init` so far.
pub fn online_count() -> usize {
    ONLINE_COUNT.load(Ordering::Acquire) as usize
}

/// Raw CPUID, `ebx` saved/restored around the instruction since LLVM
/// reserves it for its own use.
fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx);
    // SAFETY: CPUID is always available on the x86_64 CPUs this kernel
    // targets; it has no memory side effects.
    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            inout("eax") leaf => eax,
            ebx_out = out(reg) ebx,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
            options(preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

fn cpuid_vendor() -> alloc::string::String {
    let (_, ebx, ecx, edx) = cpuid(0, 0);
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&ebx.to_le_bytes());
    bytes[4..8].copy_from_slice(&edx.to_le_bytes());
    bytes[8..12].copy_from_slice(&ecx.to_le_bytes());
    alloc::string::String::from_utf8_lossy(&bytes).into_owned()
}

fn cpuid_brand_string() -> Option<alloc::string::String> {
    let (max_extended, _, _, _) = cpuid(0x8000_0000, 0);
    if max_extended < 0x8000_0004 {
        return None;
    }
    let mut bytes = [0u8; MODEL_LEN];
    for (i, leaf) in (0x8000_0002u32..=0x8000_0004u32).enumerate() {
        let (eax, ebx, ecx, edx) = cpuid(leaf, 0);
        let off = i * 16;
        bytes[off..off + 4].copy_from_slice(&eax.to_le_bytes());
        bytes[off + 4..off + 8].copy_from_slice(&ebx.to_le_bytes());
        bytes[off + 8..off + 12].copy_from_slice(&ecx.to_le_bytes());
        bytes[off + 12..off + 16].copy_from_slice(&edx.to_le_bytes());
    }
    Some(alloc::string::String::from_utf8_lossy(&bytes).trim_end_matches('\0').into())
}

fn write_str(dest: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(dest.len() - 1);
    dest[..len].copy_from_slice(&bytes[..len]);
    dest[len..].fill(0);
}

/// Read the calling CPU's descriptor pointer out of
/// [`msr::IA32_KERNEL_GS_BASE`]. Panics if called before `cpu_early_init`.
pub fn current() -> &'static CpuLocal {
    let ptr = msr::rdmsr(msr::IA32_KERNEL_GS_BASE) as *const CpuLocal;
    assert!(!ptr.is_null(), "current() called before cpu_early_init");
    // SAFETY: the pointer was installed by `cpu_early_init` and points at a
    // leaked, 'static `CpuLocal` that nothing else mutates without going
    // through `current`/`current_mut` on this same CPU.
    unsafe { &*ptr }
}

pub fn current_mut() -> &'static mut CpuLocal {
    let ptr = msr::rdmsr(msr::IA32_KERNEL_GS_BASE) as *mut CpuLocal;
    assert!(!ptr.is_null(), "current_mut() called before cpu_early_init");
    // SAFETY: see `current`; per-CPU state is only ever touched by the
    // owning CPU or under the IRQ-lock documented at each call site.
    unsafe { &mut *ptr }
}
