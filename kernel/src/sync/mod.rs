//! Synchronization primitives (§5).
//!
//! [`Spinlock`] is a thin wrapper over `spin::Mutex` used where IRQ masking
//! is not required (PMM). [`IrqLock`] additionally saves and clears the
//! local interrupt-enable flag across the critical section, for structures
//! touched from both thread context and ISRs.

mod irqlock;
mod spinlock;

pub use irqlock::IrqLock;
pub use spinlock::Spinlock;
