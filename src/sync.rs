/*
 * Interrupt-Safe Synchronization
 *
 * The ready queue, the watchdog list and the per-CPU state table are touched
 * from task context, from the tick interrupt and from other CPUs. They are
 * protected the way every RTOS protects them: mask local interrupts for a
 * short, bounded window, and (for SMP) take a spinlock inside that window.
 *
 * - IrqMask: scoped hardware-interrupt mask. Saves the current interrupt
 *   state, masks, and restores the saved state when dropped, on every exit
 *   path including unwinding.
 * - IrqSpinLock<T>: spin::Mutex that can only be entered with an IrqMask
 *   held. The spinlock is released before the mask is restored.
 *
 * Neither primitive ever sleeps. Blocking waits are built on top of the
 * scheduler (semaphores), never on these.
 */

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch;

/// Scoped interrupt mask
///
/// Nests correctly: an inner mask restores "masked", only the outermost one
/// re-enables interrupts.
pub struct IrqMask {
    was_enabled: bool,
    // Interrupt state is per-CPU, the mask must not migrate
    _not_send: PhantomData<*const ()>,
}

impl IrqMask {
    /// Mask interrupts on the current CPU until the returned value is dropped
    pub fn new() -> Self {
        Self {
            was_enabled: arch::irq_save(),
            _not_send: PhantomData,
        }
    }

    /// Whether interrupts were enabled when this mask was taken
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Default for IrqMask {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqMask {
    fn drop(&mut self) {
        arch::irq_restore(self.was_enabled);
    }
}

/// Run a closure with interrupts masked
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _mask = IrqMask::new();
    f()
}

/// Whether interrupts are currently masked on this CPU
pub fn interrupts_masked() -> bool {
    arch::irqs_masked()
}

/// Spinlock that is only ever held with interrupts masked
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

/// Guard for IrqSpinLock
///
/// Field order matters: the spinlock guard is dropped before the mask.
pub struct IrqSpinLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _mask: IrqMask,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask interrupts, then spin until the lock is acquired
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let mask = IrqMask::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, _mask: mask }
    }

    /// Single attempt; the mask is released again if the lock is contended
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let mask = IrqMask::new();
        let guard = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { guard, _mask: mask })
    }

    /// Whether some context currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn mask_nests_and_restores() {
        assert!(!interrupts_masked());
        {
            let outer = IrqMask::new();
            assert!(outer.was_enabled());
            assert!(interrupts_masked());
            {
                let inner = IrqMask::new();
                assert!(!inner.was_enabled());
            }
            assert!(interrupts_masked());
        }
        assert!(!interrupts_masked());
    }

    #[test]
    #[serial]
    fn spinlock_guard_holds_mask() {
        let lock = IrqSpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            assert!(interrupts_masked());
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
            *guard += 1;
        }
        assert!(!interrupts_masked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    #[serial]
    fn without_interrupts_returns_value() {
        let value = without_interrupts(|| {
            assert!(interrupts_masked());
            42
        });
        assert_eq!(value, 42);
        assert!(!interrupts_masked());
    }
}
