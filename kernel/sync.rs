//! Interrupt-safe locking
//!
//! `IrqLock` is the kernel's binary semaphore: acquiring it saves the
//! caller's interrupt state and disables interrupts, so a timer ISR on
//! the same core can never spin on a lock its preempted thread already
//! holds. Dropping the guard restores the saved state.
//!
//! Lock ordering: `IrqLock` is the innermost lock. `spin::Mutex` and
//! `spin::RwLock` protect structures that are never touched from ISR
//! context and must not be acquired inside an interrupt handler.

use ::core::cell::UnsafeCell;
use ::core::ops::{Deref, DerefMut};
use ::core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock that disables interrupts while held.
pub struct IrqLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for IrqLock<T> {}
unsafe impl<T: Send> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    /// Create a new unlocked `IrqLock`.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning with interrupts disabled.
    ///
    /// The previous interrupt state is restored when the returned
    /// guard is dropped.
    #[inline]
    pub fn lock(&self) -> IrqGuard<'_, T> {
        let saved = crate::arch::irq_save_disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqGuard { lock: self, saved }
    }

    /// Single acquisition attempt, for the panic path.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqGuard<'_, T>> {
        let saved = crate::arch::irq_save_disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqGuard { lock: self, saved })
        } else {
            crate::arch::irq_restore(saved);
            None
        }
    }
}

/// RAII guard for `IrqLock`.
///
/// Intentionally neither `Clone` nor `Copy`: releasing twice or
/// restoring the interrupt flag twice would corrupt the core's state.
pub struct IrqGuard<'a, T> {
    lock: &'a IrqLock<T>,
    saved: u64,
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Holding the lock grants exclusive access
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        // Restore interrupts last, after the lock is visible as free
        crate::arch::irq_restore(self.saved);
    }
}
