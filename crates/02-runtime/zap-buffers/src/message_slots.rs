//! Zerde slot storage living in linear memory, so a finished message can be
//! handed across the boundary as a bare pointer.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

use zerde::{SlotStorage, ZerdeError, ZerdeResult};

use crate::{BufferResult, Executor};

/// Slots allocated through an [`Executor`]. Freed on drop unless released
/// with [`MessageSlots::into_raw`].
pub struct MessageSlots {
    executor: Arc<dyn Executor>,
    ptr: u32,
    base: NonNull<u32>,
    slots: usize,
}

// SAFETY: `base` points into the executor's memory, which is Send + Sync, and
// the allocation is owned by this value alone.
unsafe impl Send for MessageSlots {}

impl MessageSlots {
    /// Allocates `slots` zeroed slots.
    pub fn new(executor: Arc<dyn Executor>, slots: usize) -> BufferResult<Self> {
        let ptr = executor.alloc(slot_bytes(slots)?)?;
        let base = match Self::zeroed(&*executor, ptr, 0, slots) {
            Ok(base) => base,
            Err(err) => {
                let _ = executor.dealloc(ptr);
                return Err(err);
            }
        };
        Ok(Self {
            executor,
            ptr,
            base,
            slots,
        })
    }

    /// Zeroes slots `from..slots` and returns the base pointer of the run.
    fn zeroed(
        executor: &dyn Executor,
        ptr: u32,
        from: usize,
        slots: usize,
    ) -> BufferResult<NonNull<u32>> {
        // SAFETY: the allocation is owned by the caller.
        let words = unsafe { executor.memory().slice_mut::<u32>(ptr, slots)? };
        words[from..].fill(0);
        Ok(NonNull::from(words).cast::<u32>())
    }

    /// Address of the message in linear memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Gives up ownership, returning the address. The receiver frees it.
    pub fn into_raw(self) -> u32 {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never touched again, so the executor handle is
        // read out exactly once.
        drop(unsafe { std::ptr::read(&this.executor) });
        this.ptr
    }
}

fn slot_bytes(slots: usize) -> BufferResult<u32> {
    slots
        .checked_mul(4)
        .and_then(|bytes| u32::try_from(bytes).ok())
        .ok_or(crate::BufferError::OutOfMemory { requested: u32::MAX })
}

impl SlotStorage for MessageSlots {
    fn slots(&self) -> &[u32] {
        // SAFETY: `base` covers `slots` words owned by `self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.slots) }
    }

    fn slots_mut(&mut self) -> &mut [u32] {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.slots) }
    }

    fn grow(&mut self, new_slots: usize) -> ZerdeResult<()> {
        let grow_err = |err: crate::BufferError| ZerdeError::Grow {
            slots: new_slots,
            reason: err.to_string(),
        };
        let bytes = slot_bytes(new_slots).map_err(grow_err)?;
        let ptr = self.executor.realloc(self.ptr, bytes).map_err(grow_err)?;
        self.ptr = ptr;
        let kept = self.slots.min(new_slots);
        self.base = Self::zeroed(&*self.executor, ptr, kept, new_slots).map_err(grow_err)?;
        self.slots = new_slots;
        Ok(())
    }
}

impl Drop for MessageSlots {
    fn drop(&mut self) {
        if let Err(err) = self.executor.dealloc(self.ptr) {
            tracing::error!("failed to free message at {}: {err}", self.ptr);
        }
    }
}
