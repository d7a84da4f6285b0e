//! Saved register frame shared by thread context switches and the
//! interrupt dispatch path (§3 "Thread (TCB)", §4.8 fault frame).

/// Full architectural register snapshot. The interrupt stubs in
/// [`crate::cpu::idt`] push GPRs onto the stack in this exact order before
/// calling into Rust, so `Frame`'s field order must not change without
/// updating them in lockstep.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Frame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// Interrupt vector number, pushed by the per-vector stub.
    pub vector: u64,
    /// CPU-pushed error code, or 0 for vectors that don't have one.
    pub error_code: u64,

    // Hardware-pushed interrupt frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Frame {
    /// Build the initial frame for a brand-new thread: all GPRs zeroed,
    /// RIP at the entry point, RSP at the top of its stack, interrupts
    /// enabled, running in ring 0 on the kernel's code/data/stack segments.
    pub fn new_thread(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            rflags: 0x202, // IF set, reserved bit 1 set
            cs: crate::cpu::gdt::selectors().code_selector.0 as u64,
            ss: crate::cpu::gdt::selectors().data_selector.0 as u64,
            ..Default::default()
        }
    }

    /// CR2 and CR3 for fault diagnostics, captured separately since they
    /// are not part of the hardware-pushed interrupt frame.
    pub fn cr2() -> u64 {
        x86_64::registers::control::Cr2::read_raw()
    }

    pub fn cr3() -> u64 {
        x86_64::registers::control::Cr3::read().0.start_address().as_u64()
    }
}
