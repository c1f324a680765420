//! Backing storage for [`crate::ZerdeBuilder`].

use crate::ZerdeResult;

/// Growable run of 4-byte slots the builder writes into.
///
/// `grow` replaces the backing region; any raw pointer or slice obtained
/// before the call is invalid afterwards.
pub trait SlotStorage {
    /// Every slot currently backed, header included.
    fn slots(&self) -> &[u32];

    /// Mutable access to every backed slot.
    fn slots_mut(&mut self) -> &mut [u32];

    /// Moves to a region of exactly `new_slots` slots, preserving existing contents.
    fn grow(&mut self, new_slots: usize) -> ZerdeResult<()>;
}

/// Heap storage for messages that never leave the process as raw memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapSlots {
    words: Vec<u32>,
}

impl HeapSlots {
    /// Allocates `slots` zeroed slots.
    pub fn with_slots(slots: usize) -> Self {
        Self {
            words: vec![0; slots],
        }
    }

    /// Consumes the storage and returns the raw words.
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}

impl SlotStorage for HeapSlots {
    fn slots(&self) -> &[u32] {
        &self.words
    }

    fn slots_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    fn grow(&mut self, new_slots: usize) -> ZerdeResult<()> {
        self.words.resize(new_slots, 0);
        Ok(())
    }
}
