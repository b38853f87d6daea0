//! Synchronization primitives for the filesystem core
//!
//! `SpinLock` is a `spin::Mutex` that also disables local interrupts for as
//! long as it is held, using the nesting discipline in [`crate::cpu`]. It is
//! the lock used for short critical sections that an interrupt handler on
//! the same CPU could otherwise deadlock against (the block cache map, the
//! allocator bitmap, the RAM disk).

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::cpu::{pop_off, push_off};

/// Interrupt-disabling spinlock
pub struct SpinLock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, spinning until it is available
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        SpinLockGuard {
            lock: self,
            guard: Some(self.inner.lock()),
        }
    }

    /// Try to acquire the lock without spinning.
    /// On failure the interrupt state is restored.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard {
                lock: self,
                guard: Some(guard),
            }),
            None => {
                pop_off();
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Mutable access without locking; `&mut self` proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard for [`SpinLock`]
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    // None only while `unlocked` has the lock released
    guard: Option<spin::MutexGuard<'a, T>>,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Release the lock while `f` runs, then reacquire it
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        if self.guard.take().is_some() {
            pop_off();
        }
        let r = f();
        push_off();
        self.guard = Some(self.lock.inner.lock());
        r
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("SpinLockGuard used while unlocked"),
        }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("SpinLockGuard used while unlocked"),
        }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            pop_off();
        }
    }
}

#[cfg(all(test, feature = "std", not(feature = "baremetal")))]
mod tests {
    use super::*;
    use crate::cpu::{interrupts_enabled, spinlock_depth};

    #[test]
    fn test_lock_disables_interrupts() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!interrupts_enabled());
            assert_eq!(spinlock_depth(), 1);
            assert!(lock.is_locked());
        }
        assert!(interrupts_enabled());
        assert_eq!(spinlock_depth(), 0);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_nested_locks_restore_on_outermost() {
        let a = SpinLock::new(());
        let b = SpinLock::new(());
        let ga = a.lock();
        {
            let _gb = b.lock();
            assert_eq!(spinlock_depth(), 2);
        }
        assert!(!interrupts_enabled());
        drop(ga);
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_try_lock_failure_restores_state() {
        let lock = SpinLock::new(0);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        assert_eq!(spinlock_depth(), 1);
        drop(guard);
        assert!(lock.try_lock().is_some());
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_unlocked_releases_temporarily() {
        let lock = SpinLock::new(1);
        let mut guard = lock.lock();
        let was_locked = guard.unlocked(|| lock.is_locked());
        assert!(!was_locked);
        assert!(lock.is_locked());
        *guard = 2;
        drop(guard);
        assert_eq!(lock.into_inner(), 2);
    }
}
