//! Local APIC and I/O APIC programming (§4.4, §4.5).
//!
//! The Local APIC delivers interrupts (including IPIs) to the running CPU;
//! the I/O APIC routes external interrupt lines to a chosen vector and
//! destination. Both are accessed as volatile MMIO through the HHDM.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::PhysAddr;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

const LAPIC_ID: u32 = 0x020;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

const LVT_MASK: u32 = 1 << 16;
const SVR_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u8 = 0xFE;
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;

const IOAPIC_BASE: u64 = 0xFEC0_0000;
const IOREGSEL: u32 = 0x00;
const IOWIN: u32 = 0x10;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// Delivery mode for an IPI sent via [`send_ipi`], per the ICR's bits 10:8.
#[derive(Debug, Clone, Copy)]
pub enum IpiMode {
    Fixed,
    Init,
    Startup,
}

impl IpiMode {
    fn bits(self) -> u32 {
        match self {
            IpiMode::Fixed => 0b000 << 8,
            IpiMode::Init => 0b101 << 8,
            IpiMode::Startup => 0b110 << 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RedirectionEntry {
    raw: u64,
}

impl RedirectionEntry {
    const fn new(vector: u8) -> Self {
        Self {
            raw: (vector as u64) | (1u64 << 16),
        }
    }

    fn set_masked(&mut self, masked: bool) {
        if masked {
            self.raw |= 1 << 16;
        } else {
            self.raw &= !(1 << 16);
        }
    }

    fn set_destination(&mut self, dest: u8) {
        self.raw = (self.raw & !(0xFFu64 << 56)) | ((dest as u64) << 56);
    }

    fn low(&self) -> u32 {
        self.raw as u32
    }

    fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    fn from_parts(low: u32, high: u32) -> Self {
        Self {
            raw: (low as u64) | ((high as u64) << 32),
        }
    }
}

pub struct LocalApic {
    base: usize,
}

impl LocalApic {
    fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `offset` names a documented Local APIC register and
        // `self.base` is mapped MMIO; volatile access prevents reordering.
        unsafe { ptr::read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: see `read`.
        unsafe { ptr::write_volatile((self.base + offset as usize) as *mut u32, value) }
    }

    pub fn read_id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    fn enable(&self) {
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    pub fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    pub fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    pub fn stop_timer(&self) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
    }

    /// Send an IPI. For `Startup`, `vector` is the trampoline page number
    /// (physical address >> 12), per the STARTUP IPI's defined encoding.
    pub fn send_ipi(&self, dest: u8, mode: IpiMode, vector: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(LAPIC_ICR_LOW, mode.bits() | vector as u32);
    }
}

pub struct IoApic {
    base: usize,
}

impl IoApic {
    fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_register(&self, reg: u32) -> u32 {
        // SAFETY: indirect MMIO access via IOREGSEL/IOWIN at a mapped base.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::read_volatile((self.base + IOWIN as usize) as *const u32)
        }
    }

    fn write_register(&self, reg: u32, value: u32) {
        // SAFETY: see `read_register`.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::write_volatile((self.base + IOWIN as usize) as *mut u32, value);
        }
    }

    fn max_redirection_entries(&self) -> u8 {
        let ver = self.read_register(IOAPIC_REG_VER);
        (((ver >> 16) & 0xFF) + 1) as u8
    }

    fn read_redirection(&self, irq: u8) -> RedirectionEntry {
        let reg = IOAPIC_REDTBL_BASE + (irq as u32) * 2;
        RedirectionEntry::from_parts(self.read_register(reg), self.read_register(reg + 1))
    }

    fn write_redirection(&self, irq: u8, entry: RedirectionEntry) {
        let reg = IOAPIC_REDTBL_BASE + (irq as u32) * 2;
        self.write_register(reg + 1, entry.high());
        self.write_register(reg, entry.low());
    }

    pub fn set_irq_route(&self, irq: u8, vector: u8, dest: u8) {
        let mut entry = RedirectionEntry::new(vector);
        entry.set_destination(dest);
        entry.set_masked(false);
        self.write_redirection(irq, entry);
    }

    pub fn mask_irq(&self, irq: u8) {
        let mut entry = self.read_redirection(irq);
        entry.set_masked(true);
        self.write_redirection(irq, entry);
    }

    fn mask_all(&self) {
        for irq in 0..self.max_redirection_entries() {
            self.mask_irq(irq);
        }
    }
}

struct ApicState {
    local_apic: LocalApic,
    io_apic: IoApic,
}

// SAFETY: fields are MMIO base addresses only; all access is serialized by
// `APIC_STATE`'s mutex.
unsafe impl Send for ApicState {}

static APIC_STATE: Mutex<Option<ApicState>> = Mutex::new(None);
static APIC_INITIALIZED: AtomicBool = AtomicBool::new(false);

use super::msr::{rdmsr, wrmsr};

/// Enable the Local APIC and I/O APIC, masking every LVT entry and
/// redirection table entry until something explicitly routes to them.
pub fn init() -> KernelResult<()> {
    if APIC_INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(KernelError::AlreadyExists {
            resource: "APIC",
            id: 0,
        });
    }

    let apic_base_msr = rdmsr(IA32_APIC_BASE_MSR);
    let apic_base_phys = apic_base_msr & 0xFFFF_F000;

    if apic_base_msr & IA32_APIC_BASE_ENABLE == 0 {
        wrmsr(IA32_APIC_BASE_MSR, apic_base_msr | IA32_APIC_BASE_ENABLE);
    }

    let lapic_virt = PhysAddr::new(apic_base_phys).to_virt().as_u64() as usize;
    let ioapic_virt = PhysAddr::new(IOAPIC_BASE).to_virt().as_u64() as usize;

    let lapic = LocalApic::new(lapic_virt);
    lapic.mask_all_lvt();
    lapic.enable();
    lapic.set_task_priority(0);

    let ioapic = IoApic::new(ioapic_virt);
    ioapic.mask_all();

    crate::kinfo!(
        "Local APIC {:#x} (id {}), I/O APIC {:#x} ({} lines)",
        lapic_virt,
        lapic.read_id(),
        ioapic_virt,
        ioapic.max_redirection_entries()
    );

    *APIC_STATE.lock() = Some(ApicState { local_apic: lapic, io_apic: ioapic });
    Ok(())
}

pub fn send_eoi() {
    if let Some(s) = APIC_STATE.lock().as_ref() {
        s.local_apic.send_eoi();
    }
}

pub fn read_id() -> Option<u8> {
    APIC_STATE.lock().as_ref().map(|s| s.local_apic.read_id())
}

pub fn setup_timer(vector: u8, divide: u8, initial_count: u32) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.setup_timer(vector, divide, initial_count);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

pub fn stop_timer() -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.stop_timer();
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

pub fn set_irq_route(irq: u8, vector: u8, dest: u8) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.io_apic.set_irq_route(irq, vector, dest);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

pub fn send_ipi(dest: u8, mode: IpiMode, vector: u8) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.send_ipi(dest, mode, vector);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}
