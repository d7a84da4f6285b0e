//! Application processor bring-up (§4.4).
//!
//! The boot processor (BSP) wakes every other CPU (AP) with the classic
//! INIT-SIPI-SIPI sequence: a 16-bit real-mode trampoline is placed at a
//! fixed low physical page, each AP is sent an INIT IPI followed by a
//! STARTUP IPI naming that page, and the BSP polls a per-AP ready flag
//! with a bounded timeout before giving up on that CPU.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cpu::apic::IpiMode;
use crate::mm::{PhysAddr, PAGE_SIZE};

/// Physical page the trampoline is copied to. Must be below 1 MiB and
/// page-aligned so it doubles as both a valid STARTUP vector and a valid
/// real-mode code segment base.
const TRAMPOLINE_PAGE: u64 = 0x8000;

const AP_STACK_SIZE: usize = 16 * 1024;
const MAX_CPUS: usize = 256;
const STARTUP_POLL_ITERATIONS: u32 = 100;
const STARTUP_POLL_DELAY_MS: u64 = 10;

static CPUS_READY: AtomicU32 = AtomicU32::new(1); // BSP counts as ready.
static AP_READY_FLAGS: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

// Real-mode trampoline, assembled for 16-bit real mode since the AP starts
// in that state after a STARTUP IPI: loads a minimal flat GDT, enters
// 32-bit protected mode on a small scratch stack baked into the trampoline
// page itself (APs are brought up one at a time, so sharing it is safe),
// switches on the kernel's page tables and long mode, then far-jumps into
// a 64-bit segment and on into `ap_entry64`.
core::arch::global_asm!(
    r#"
.section .trampoline, "awx"
.code16
.global ap_trampoline_start
ap_trampoline_start:
    cli
    cld
    xor ax, ax
    mov ds, ax
    mov es, ax
    mov ss, ax

    .set AP_GDT_PTR_OFF, (ap_gdt_ptr - ap_trampoline_start) + 0x8000
    lgdt [AP_GDT_PTR_OFF]

    mov eax, cr0
    or eax, 1
    mov cr0, eax

    .set AP_PROT_MODE_OFF, (ap_protected_mode - ap_trampoline_start) + 0x8000
    ljmp $0x08, $AP_PROT_MODE_OFF

.code32
ap_protected_mode:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    .set AP_STACK_TOP_OFF, (ap_temp_stack_top - ap_trampoline_start) + 0x8000
    mov esp, AP_STACK_TOP_OFF

    mov eax, cr4
    or eax, (1 << 5)
    mov cr4, eax

    .set AP_PAGEMAP_OFF, (ap_pagemap_phys - ap_trampoline_start) + 0x8000
    mov eax, [AP_PAGEMAP_OFF]
    mov cr3, eax

    mov ecx, 0xC0000080
    rdmsr
    or eax, (1 << 8)
    wrmsr

    mov eax, cr0
    or eax, (1 << 31) | (1 << 0)
    mov cr0, eax

    .set AP_LONG_MODE_OFF, (ap_long_mode - ap_trampoline_start) + 0x8000
    ljmp $0x18, $AP_LONG_MODE_OFF

.code64
ap_long_mode:
    mov ax, 0x20
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov fs, ax
    mov gs, ax

    .set AP_ENTRY64_OFF, (ap_entry64_addr - ap_trampoline_start) + 0x8000
    mov eax, dword ptr [AP_ENTRY64_OFF]
    jmp rax

.align 8
ap_gdt_start:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A0000000000
    .quad 0x00AF920000000000
ap_gdt_end:
ap_gdt_ptr:
    .word ap_gdt_end - ap_gdt_start - 1
    .long (ap_gdt_start - ap_trampoline_start) + 0x8000

.global ap_pagemap_phys
ap_pagemap_phys:
    .long 0
.global ap_entry64_addr
ap_entry64_addr:
    .long 0

.align 16
.skip 1024
ap_temp_stack_top:

.global ap_trampoline_end
ap_trampoline_end:
"#,
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
    static ap_pagemap_phys: u32;
    static ap_entry64_addr: u32;
}

/// Copy the trampoline blob to [`TRAMPOLINE_PAGE`], patch in the BSP's
/// pagemap and a pointer to [`ap_entry64`], then step every other CPU
/// through INIT-SIPI-SIPI.
///
/// `apic_ids` lists every CPU's Local APIC id as reported by ACPI's MADT,
/// with `bsp_id` identifying the caller's own id (skipped).
pub fn start_aps(apic_ids: &[u8], bsp_id: u8) {
    // SAFETY: the trampoline's HHDM virtual alias is writable identity-mapped
    // low memory, copied before any AP can observe it.
    let trampoline_virt = PhysAddr::new(TRAMPOLINE_PAGE).to_virt().as_mut_ptr::<u8>();
    let len = trampoline_len();
    unsafe {
        core::ptr::copy_nonoverlapping(&ap_trampoline_start as *const u8, trampoline_virt, len);
    }

    let pagemap_phys = crate::mm::paging::kernel_pagemap().l4_phys.as_u64() as u32;
    let entry_addr = ap_entry64 as usize as u32;
    // SAFETY: offsets computed from the link-time section layout apply
    // unchanged to the runtime copy at `trampoline_virt`, since copying
    // preserves relative offsets within the blob.
    unsafe {
        write_trampoline_field(trampoline_virt, &ap_pagemap_phys, pagemap_phys);
        write_trampoline_field(trampoline_virt, &ap_entry64_addr, entry_addr);
    }

    for &id in apic_ids {
        if id == bsp_id {
            continue;
        }
        start_one_ap(id);
    }

    crate::mm::paging::unmap_page(
        crate::mm::paging::kernel_pagemap(),
        crate::mm::VirtAddr::new(trampoline_virt as u64),
    );
    crate::mm::pmm::free(PhysAddr::new(TRAMPOLINE_PAGE), 1);
}

fn trampoline_len() -> usize {
    // SAFETY: both symbols are addresses of linker-placed labels in the
    // `.trampoline` section; their difference is the blob's length.
    unsafe {
        (&ap_trampoline_end as *const u8 as usize) - (&ap_trampoline_start as *const u8 as usize)
    }
}

/// Write `value` at the copied trampoline's image of the given link-time
/// field, by translating the field's link address into an offset from
/// `ap_trampoline_start` and applying that offset to `dest_base`.
unsafe fn write_trampoline_field(dest_base: *mut u8, field: *const u32, value: u32) {
    // SAFETY: `ap_trampoline_start` is a linker-placed label whose address
    // is never dereferenced, only used to compute an offset.
    let offset = unsafe { (field as usize) - (&ap_trampoline_start as *const u8 as usize) };
    unsafe {
        core::ptr::write_unaligned(dest_base.add(offset) as *mut u32, value);
    }
}

fn start_one_ap(apic_id: u8) {
    let _ = crate::cpu::apic::send_ipi(apic_id, IpiMode::Init, 0);
    crate::timer::busy_wait_ms(10);

    let vector = (TRAMPOLINE_PAGE / PAGE_SIZE as u64) as u8;
    let _ = crate::cpu::apic::send_ipi(apic_id, IpiMode::Startup, vector);
    crate::timer::busy_wait_ms(1);
    let _ = crate::cpu::apic::send_ipi(apic_id, IpiMode::Startup, vector);

    for _ in 0..STARTUP_POLL_ITERATIONS {
        if AP_READY_FLAGS[apic_id as usize].load(Ordering::Acquire) {
            CPUS_READY.fetch_add(1, Ordering::AcqRel);
            crate::kinfo!("CPU {} online", apic_id);
            return;
        }
        crate::timer::busy_wait_ms(STARTUP_POLL_DELAY_MS);
    }
    crate::kwarn!("CPU {} did not respond to STARTUP IPI, skipping", apic_id);
}

/// Entry point for an AP once it has reached long mode. Allocates its own
/// stack, finishes per-CPU init, announces readiness, and falls into the
/// scheduler's idle path. Never returns.
extern "C" fn ap_entry64() -> ! {
    let stack_frame = crate::mm::pmm::alloc((AP_STACK_SIZE / PAGE_SIZE) as u64)
        .expect("no frames left for AP stack");
    let stack_top = stack_frame.to_virt().as_u64() + AP_STACK_SIZE as u64;

    // SAFETY: `stack_top` is the top of a freshly allocated, HHDM-mapped
    // region at least `AP_STACK_SIZE` bytes long that nothing else
    // references; switching to it before the first call is the standard
    // "run the rest of init on a real stack" handoff.
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "call {cont}",
            stack = in(reg) stack_top,
            cont = sym ap_continue,
            options(noreturn),
        );
    }
}

/// Runs on the freshly allocated per-AP stack. Finishes per-CPU init,
/// announces readiness, and falls into the scheduler's idle path.
extern "C" fn ap_continue() -> ! {
    crate::cpu::gdt::init();
    crate::cpu::idt::init();
    let cpu_id = crate::cpu::apic::read_id().unwrap_or(0);
    crate::cpu::cpu_early_init(cpu_id);
    crate::cpu::cpu_init();

    if let Some(idx) = crate::cpu::apic::read_id() {
        AP_READY_FLAGS[idx as usize].store(true, Ordering::Release);
    }

    x86_64::instructions::interrupts::enable();
    crate::sched::idle_loop();
}

pub fn cpus_ready() -> u32 {
    CPUS_READY.load(Ordering::Acquire)
}
