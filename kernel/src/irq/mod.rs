//! Legacy IRQ routing and the flat handler table (§4.5).
//!
//! Vectors 0x20..0x2F are the IOAPIC's redirection targets for legacy IRQs
//! 0..15. Installing a handler here is independent of the lower-level
//! [`crate::cpu::idt`] vector table: `irq_handlers[]` is indexed by IRQ
//! number and is what device code actually calls into.

use crate::cpu::context::Frame;
use crate::sync::IrqLock;

pub const IRQ_BASE_VECTOR: u8 = 0x20;
pub const MAX_IRQS: usize = 16;

pub type IrqCallback = fn(frame: &mut Frame, context: usize);

#[derive(Clone, Copy)]
struct IrqEntry {
    callback: IrqCallback,
    context: usize,
}

static IRQ_HANDLERS: IrqLock<[Option<IrqEntry>; MAX_IRQS]> = IrqLock::new([None; MAX_IRQS]);

/// Install a handler for `irq`. Out-of-range IRQs are rejected; installing
/// over an existing handler overwrites it and logs a warning.
pub fn install_handler(irq: u8, callback: IrqCallback, context: usize) {
    if irq as usize >= MAX_IRQS {
        crate::kwarn!("rejecting handler for out-of-range IRQ {}", irq);
        return;
    }
    let mut handlers = IRQ_HANDLERS.lock();
    if handlers[irq as usize].is_some() {
        crate::kwarn!("overwriting existing handler for IRQ {}", irq);
    }
    handlers[irq as usize] = Some(IrqEntry { callback, context });
}

/// Route a legacy IRQ to `vector` on `dest` (a LAPIC id), unmasking it in
/// the IOAPIC redirection table. IRQ 0 (the timer tick) is steered to every
/// online CPU so the scheduler's tick fires everywhere; the rest go to the
/// BSP only, per §4.5.
pub fn route(irq: u8, dest: u8) {
    let vector = IRQ_BASE_VECTOR + irq;
    let _ = crate::cpu::apic::set_irq_route(irq, vector, dest);
}

/// Called by the IDT's common dispatch stub for vectors in the legacy IRQ
/// range. Looks up and invokes the installed callback, if any, passing it
/// the live interrupt frame so handlers that need to act on the interrupted
/// context (the scheduler's tick, in particular) can do so; EOI is sent by
/// the caller after this returns.
pub fn dispatch(frame: &mut Frame) {
    let irq = (frame.vector as u8).wrapping_sub(IRQ_BASE_VECTOR);
    if irq as usize >= MAX_IRQS {
        return;
    }
    let entry = *IRQ_HANDLERS.lock().get(irq as usize).unwrap();
    if let Some(entry) = entry {
        (entry.callback)(frame, entry.context);
    }
}

/// Install the dispatch shim on every IDT vector in the legacy IRQ range.
/// Called once, from the BSP, before any IOAPIC redirection is programmed.
pub fn init() {
    for vector in IRQ_BASE_VECTOR..(IRQ_BASE_VECTOR + MAX_IRQS as u8) {
        crate::cpu::idt::install_handler(vector, |frame| dispatch(frame));
    }
}
