//! Address-based wait/notify on 32-bit words.
//!
//! Compute threads park on words living in shared memory (result words, the
//! control mutex, the pending counter) and are woken individually by address.
//! Wasm workers use `memory_atomic_wait32`; native targets use the
//! `atomic-wait` crate, which is futex-backed where available.

use std::sync::atomic::{AtomicU32, Ordering};

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller parked and was woken (possibly spuriously).
    Woken,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
}

#[cfg(target_arch = "wasm32")]
mod imp {
    use super::{AtomicU32, WaitResult};
    use core::arch::wasm32::{memory_atomic_notify, memory_atomic_wait32};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        // SAFETY: the word lives in shared linear memory for the program's lifetime.
        let result = unsafe {
            memory_atomic_wait32(atomic.as_ptr() as *mut i32, expected as i32, -1_i64)
        };
        match result {
            0 => WaitResult::Woken,
            _ => WaitResult::NotEqual,
        }
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        // SAFETY: same word the waiter parked on.
        unsafe {
            memory_atomic_notify(atomic.as_ptr() as *mut i32, 1);
        }
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        // SAFETY: same word the waiters parked on.
        unsafe {
            memory_atomic_notify(atomic.as_ptr() as *mut i32, u32::MAX);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    use super::{AtomicU32, Ordering, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        if atomic.load(Ordering::Acquire) != expected {
            return WaitResult::NotEqual;
        }
        atomic_wait::wait(atomic, expected);
        WaitResult::Woken
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        atomic_wait::wake_one(atomic as *const AtomicU32);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Parks the caller while `atomic` holds `expected`. May return spuriously.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32) {
    imp::wake_one(atomic)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}

/// Blocks until `atomic` no longer holds `sentinel`, returning the new value.
///
/// Absorbs spurious wakeups, so a notify without a store is never observed.
pub fn wait_while_eq(atomic: &AtomicU32, sentinel: u32) -> u32 {
    loop {
        let current = atomic.load(Ordering::Acquire);
        if current != sentinel {
            return current;
        }
        wait_u32(atomic, sentinel);
    }
}
