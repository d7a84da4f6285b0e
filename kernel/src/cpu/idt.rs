//! 256-vector interrupt descriptor table (§4.5).
//!
//! Every vector funnels through a hand-written assembly stub so the
//! dispatcher sees a full [`Frame`](crate::cpu::context::Frame) — all
//! GPRs, CR2/CR3 captured separately, and the hardware-pushed
//! RIP/CS/RFLAGS/RSP/SS — rather than whatever subset the compiler's
//! `x86-interrupt` calling convention happens to preserve. The per-vector
//! stubs and the dispatch trampoline are generated once, at compile time,
//! by a GNU-assembler `.rept` loop.

use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

use crate::cpu::context::Frame;
use crate::sync::Spinlock;

// Vectors 8, 10-14, 17, 21, 29, 30 push a hardware error code per the Intel
// SDM's exception reference; every other vector's stub pushes a dummy zero
// so `Frame`'s layout is uniform. Encoded directly in the `.rept` loop below.

core::arch::global_asm!(
    r#"
.altmacro

.macro gen_stub vec
gen_stub_\vec:
.if \vec == 8 || \vec == 10 || \vec == 11 || \vec == 12 || \vec == 13 || \vec == 14 || \vec == 17 || \vec == 21 || \vec == 29 || \vec == 30
    push \vec
.else
    push 0
    push \vec
.endif
    jmp interrupt_common_stub
.endm

.set gen_i, 0
.rept 256
    gen_stub %gen_i
    .set gen_i, gen_i+1
.endr

.macro tab_entry vec
    .quad gen_stub_\vec
.endm

.section .rodata
.global interrupt_stub_table
interrupt_stub_table:
.set gen_i, 0
.rept 256
    tab_entry %gen_i
    .set gen_i, gen_i+1
.endr

.text
interrupt_common_stub:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    call {dispatch}

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax

    add rsp, 16
    iretq
"#,
    dispatch = sym dispatch_interrupt,
);

unsafe extern "C" {
    /// 256 quadwords, one code address per vector, emitted by the
    /// `.rept` loop above.
    static interrupt_stub_table: [u64; 256];
}

const MAX_VECTOR: usize = 256;

type HandlerFn = fn(&mut Frame);

static HANDLERS: Spinlock<[Option<HandlerFn>; MAX_VECTOR]> = Spinlock::new([None; MAX_VECTOR]);

/// Install a Rust-level handler for `vector`. Out-of-range vectors are
/// rejected; installing over an existing handler overwrites it and logs a
/// warning (§4.5's "out-of-range rejection, overwrite-with-warning"
/// semantics, shared with the legacy-IRQ table in `crate::irq`).
pub fn install_handler(vector: u8, handler: HandlerFn) {
    let mut handlers = HANDLERS.lock();
    if handlers[vector as usize].is_some() {
        crate::kwarn!("overwriting existing handler for vector {}", vector);
    }
    handlers[vector as usize] = Some(handler);
}

extern "C" fn dispatch_interrupt(frame: *mut Frame) {
    // SAFETY: `frame` points at the `Frame`-shaped region the common stub
    // just built on its own stack; it is valid for the duration of this
    // call.
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as u8;

    let handler = HANDLERS.lock()[vector as usize];
    match handler {
        Some(f) => f(frame),
        None => default_handler(frame),
    }

    if vector >= 0x20 {
        crate::cpu::apic::send_eoi();
    }
}

fn default_handler(frame: &mut Frame) {
    if frame.vector < 32 {
        crate::panic::kpanic_fault("unhandled CPU exception", frame);
    } else {
        crate::kwarn!(
            "unhandled interrupt vector {} (rip {:#x})",
            frame.vector,
            frame.rip
        );
    }
}

static IDT: Spinlock<Option<InterruptDescriptorTable>> = Spinlock::new(None);

/// Build the IDT from the generated stub table and load it on the running
/// CPU. Called once per CPU as part of `cpu_early_init`.
pub fn init() {
    let mut idt = InterruptDescriptorTable::new();

    // SAFETY: `interrupt_stub_table` is the linker symbol emitted by the
    // global_asm block above; it always has exactly 256 entries.
    let stubs = unsafe { &interrupt_stub_table };

    for (vector, &addr) in stubs.iter().enumerate() {
        let entry = unsafe { idt_entry_mut(&mut idt, vector) };
        // SAFETY: `addr` names a stub generated for exactly this vector by
        // the .rept loop, ending in `iretq`.
        let opts = unsafe { entry.set_handler_addr(VirtAddr::new(addr)) };
        if vector == 8 {
            // SAFETY: index comes from the kernel's own IST layout (gdt.rs).
            unsafe {
                opts.set_stack_index(crate::cpu::gdt::DOUBLE_FAULT_IST_INDEX);
            }
        }
    }

    // SAFETY: the IDT is 'static for the process lifetime once boxed-leak
    // via the lock below; `load_unsafe` is required since the table isn't
    // known to the compiler to live forever, but it does in practice.
    let mut guard = IDT.lock();
    *guard = Some(idt);
    let idt_ref: &'static InterruptDescriptorTable =
        unsafe { &*(guard.as_ref().unwrap() as *const InterruptDescriptorTable) };
    idt_ref.load();
}

/// Index helper so `init` can treat every vector uniformly; the x86_64
/// crate's `InterruptDescriptorTable` indexes exceptions and the generic
/// vector range through different accessors.
unsafe fn idt_entry_mut(
    idt: &mut InterruptDescriptorTable,
    vector: usize,
) -> &mut x86_64::structures::idt::Entry<extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame)> {
    &mut idt[vector as u8]
}
