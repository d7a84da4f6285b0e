//! Spinlock variant that also masks local interrupts across the critical
//! section, for data shared between thread context and ISRs (§5).

use core::ops::{Deref, DerefMut};

use x86_64::instructions::interrupts;

use super::spinlock::{Spinlock, SpinlockGuard};

pub struct IrqLock<T> {
    inner: Spinlock<T>,
}

pub struct IrqLockGuard<'a, T> {
    guard: SpinlockGuard<'a, T>,
    was_enabled: bool,
}

impl<T> IrqLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Spinlock::new(data),
        }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        IrqLockGuard {
            guard: self.inner.lock(),
            was_enabled,
        }
    }
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.was_enabled {
            interrupts::enable();
        }
    }
}
