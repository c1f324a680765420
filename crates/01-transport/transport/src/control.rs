//! Task broker control region: a word mutex, a pending counter and a ring of
//! message pointers, all living in one fixed shared allocation.
//!
//! ```text
//! word 0      mutex (0 = unlocked, 1 = locked)
//! word 1      pending message count; the broker parks on this word
//! word 2      closed flag, set once by a broker that stopped serving
//! word 3..    message pointers, `pending` of them valid
//! ```
//!
//! Requesters append under the mutex and then wake the broker. The broker reads
//! `pending` without the mutex as a cheap hint, then takes the mutex and drains
//! every entry at once. The ring is only ever mutated with the mutex held.
//! Once closed, posts fail with [`TransportError::Closed`].

use crate::region::SharedRegion;
use crate::wait::{wait_u32, wake_all, wake_one};
use crate::{TransportError, TransportResult};
use std::sync::atomic::{AtomicU32, Ordering};

const MUTEX_WORD: usize = 0;
const PENDING_WORD: usize = 1;
const CLOSED_WORD: usize = 2;
const HEADER_WORDS: usize = 3;

const MUTEX_UNLOCKED: u32 = 0;
const MUTEX_LOCKED: u32 = 1;

/// Size in bytes of the control region used when nothing else is configured.
pub const DEFAULT_CONTROL_BYTES: usize = 10_000;

/// Shared mailbox between compute threads and the task broker.
#[derive(Debug)]
pub struct ControlRegion {
    region: SharedRegion,
    capacity: usize,
}

impl ControlRegion {
    /// Creates a region able to hold `capacity` pending message pointers.
    pub fn with_capacity(capacity: usize) -> TransportResult<Self> {
        if capacity == 0 {
            return Err(TransportError::InvalidCapacity {
                requested: capacity,
                minimum: 1,
            });
        }
        let words = HEADER_WORDS + capacity;
        let region = SharedRegion::new_zeroed(words * 4, 64)?;
        Ok(Self { region, capacity })
    }

    /// Creates a region sized to `bytes`, header included.
    pub fn with_bytes(bytes: usize) -> TransportResult<Self> {
        let capacity = (bytes / 4).saturating_sub(HEADER_WORDS);
        Self::with_capacity(capacity)
    }

    /// Number of message pointers the ring can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < HEADER_WORDS + self.capacity);
        // SAFETY: `index` is inside the zeroed region, which is 64-byte aligned and
        // lives as long as `self`.
        unsafe { &*(self.region.base_ptr().add(index * 4) as *const AtomicU32) }
    }

    /// Lock-free peek at the pending counter. Re-read under the lock before use.
    pub fn pending_hint(&self) -> u32 {
        self.word(PENDING_WORD).load(Ordering::Acquire)
    }

    /// Acquires the region mutex, parking while another context holds it.
    pub fn lock(&self) -> ControlGuard<'_> {
        let mutex = self.word(MUTEX_WORD);
        loop {
            if mutex
                .compare_exchange(
                    MUTEX_UNLOCKED,
                    MUTEX_LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return ControlGuard { control: self };
            }
            // Another context may take the mutex between our wake and the retry.
            wait_u32(mutex, MUTEX_LOCKED);
        }
    }

    /// Whether the broker has stopped serving this region.
    pub fn is_closed(&self) -> bool {
        self.word(CLOSED_WORD).load(Ordering::Acquire) != 0
    }

    /// Appends `message_ptr` and wakes the broker.
    ///
    /// Fails with [`TransportError::RingFull`] without blocking when every entry
    /// is taken; callers decide how to back off. Fails with
    /// [`TransportError::Closed`] once the region is closed.
    pub fn post(&self, message_ptr: u32) -> TransportResult<()> {
        {
            let guard = self.lock();
            guard.push(message_ptr)?;
        }
        self.notify_broker();
        Ok(())
    }

    /// Appends `message_ptr`, waiting for the broker to drain when full.
    pub fn post_blocking(&self, message_ptr: u32) -> TransportResult<()> {
        loop {
            match self.post(message_ptr) {
                Ok(()) => return Ok(()),
                Err(TransportError::RingFull { .. }) => {
                    let seen = self.pending_hint();
                    if (seen as usize) < self.capacity {
                        continue;
                    }
                    tracing::debug!(pending = seen, "control ring full, waiting for drain");
                    self.notify_broker();
                    wait_u32(self.word(PENDING_WORD), seen);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drains every pending pointer into `out`, in posting order.
    pub fn drain_into(&self, out: &mut Vec<u32>) -> usize {
        let guard = self.lock();
        let drained = guard.drain_into(out);
        drop(guard);
        if drained > 0 {
            // Requesters blocked on a full ring park on the counter.
            wake_all(self.word(PENDING_WORD));
        }
        drained
    }

    /// Marks the region closed and drains whatever was posted before that.
    ///
    /// Every later post fails, so the returned entries are the last ones the
    /// broker will ever see. Requesters parked on a full ring are woken.
    pub fn close_into(&self, out: &mut Vec<u32>) -> usize {
        let guard = self.lock();
        self.word(CLOSED_WORD).store(1, Ordering::Release);
        let drained = guard.drain_into(out);
        drop(guard);
        wake_all(self.word(PENDING_WORD));
        drained
    }

    /// Wakes a broker parked in [`ControlRegion::wait_for_messages`].
    ///
    /// Requesters waiting out a full ring park on the same word, so everyone is
    /// woken and re-checks.
    pub fn notify_broker(&self) {
        wake_all(self.word(PENDING_WORD));
    }

    /// Parks until at least one message is pending. May return spuriously.
    pub fn wait_for_messages(&self) {
        wait_u32(self.word(PENDING_WORD), 0);
    }
}

/// Exclusive access to the control ring. Unlocks on drop.
pub struct ControlGuard<'a> {
    control: &'a ControlRegion,
}

impl ControlGuard<'_> {
    /// Current number of pending entries.
    pub fn pending(&self) -> usize {
        self.control.word(PENDING_WORD).load(Ordering::Relaxed) as usize
    }

    /// Appends one entry.
    pub fn push(&self, message_ptr: u32) -> TransportResult<()> {
        if self.control.is_closed() {
            return Err(TransportError::Closed);
        }
        let pending = self.pending();
        if pending >= self.control.capacity {
            return Err(TransportError::RingFull {
                capacity: self.control.capacity,
            });
        }
        self.control
            .word(HEADER_WORDS + pending)
            .store(message_ptr, Ordering::Relaxed);
        self.control
            .word(PENDING_WORD)
            .store(pending as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Moves every entry into `out` and resets the counter to zero.
    pub fn drain_into(&self, out: &mut Vec<u32>) -> usize {
        let pending = self.pending();
        out.extend(
            (0..pending).map(|idx| {
                self.control
                    .word(HEADER_WORDS + idx)
                    .load(Ordering::Relaxed)
            }),
        );
        self.control.word(PENDING_WORD).store(0, Ordering::Release);
        pending
    }
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        let mutex = self.control.word(MUTEX_WORD);
        let prev = mutex.swap(MUTEX_UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, MUTEX_LOCKED, "control mutex released while unlocked");
        wake_one(mutex);
    }
}
