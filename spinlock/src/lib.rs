//! Implements a simple spin-lock based mutex.
//!
//! This is the only mutual exclusion primitive in the kernel. It never
//! blocks, it busy-waits, so it is only suitable for very short critical
//! sections. There is no ordering guarantee between waiters beyond eventual
//! entry. Callers in scheduler-critical sections must additionally disable
//! interrupts on the local CPU before locking, otherwise the timer interrupt
//! can re-enter the critical section on the same CPU.
//!
//! On a single-CPU target the atomic always succeeds on the first try, so the
//! same code runs unchanged on both single- and multi-processor systems.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct Mutex<T> {
    guarded_value: UnsafeCell<T>,
    locked: AtomicBool,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            guarded_value: UnsafeCell::new(value),
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> MutexGuard<T> {
        loop {
            if let Some(success) = self.try_lock() {
                return success;
            }
            core::hint::spin_loop();
        }
    }

    /// Acquire the lock if it is not currently held.
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Run `callback` with the lock held, releasing it afterwards.
    pub fn with_lock<F, R>(&self, callback: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.lock();
        callback(&mut *guard)
    }
}

unsafe impl<T> Send for Mutex<T> {}
unsafe impl<T> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.guarded_value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.guarded_value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}
