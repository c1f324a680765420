//! Append-only encoder producing Zerde messages.

use crate::param::{BufferDescriptor, Ownership, WireParam};
use crate::storage::{HeapSlots, SlotStorage};
use crate::{WireMessage, ZerdeError, ZerdeResult, HEADER_SLOTS};

/// Initial slot count of a fresh heap builder.
pub const DEFAULT_SLOTS: usize = 1024;

/// Serialises values into 4-byte slots behind an 8-byte length header.
///
/// The header always holds the byte size of the backing region and is
/// rewritten whenever the region grows.
pub struct ZerdeBuilder<S: SlotStorage = HeapSlots> {
    storage: S,
    used: usize,
}

impl ZerdeBuilder<HeapSlots> {
    /// Heap-backed builder with [`DEFAULT_SLOTS`] slots.
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS)
    }

    /// Heap-backed builder with room for `slots` slots (header included).
    pub fn with_slots(slots: usize) -> Self {
        let slots = round_even(slots.max(HEADER_SLOTS));
        let mut builder = Self {
            storage: HeapSlots::with_slots(slots),
            used: HEADER_SLOTS,
        };
        builder.write_header();
        builder
    }

    /// Finishes the message, trimming nothing; the header keeps the region size.
    pub fn into_message(self) -> WireMessage {
        WireMessage::from_words_unchecked(self.storage.into_words())
    }
}

impl Default for ZerdeBuilder<HeapSlots> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SlotStorage> ZerdeBuilder<S> {
    /// Builds on top of caller-provided storage (at least two slots, even count).
    pub fn with_storage(storage: S) -> ZerdeResult<Self> {
        let slots = storage.slots().len();
        if slots < HEADER_SLOTS || slots % 2 != 0 {
            return Err(ZerdeError::InvalidHeader {
                bytes: slots as u64 * 4,
                available: slots * 4,
            });
        }
        let mut builder = Self {
            storage,
            used: HEADER_SLOTS,
        };
        builder.write_header();
        Ok(builder)
    }

    /// Slots written so far, header included.
    pub fn used_slots(&self) -> usize {
        self.used
    }

    /// Slots currently backed.
    pub fn capacity_slots(&self) -> usize {
        self.storage.slots().len()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Releases the storage holding the finished message.
    pub fn finish(self) -> S {
        self.storage
    }

    fn write_header(&mut self) {
        let bytes = self.storage.slots().len() as u64 * 4;
        let slots = self.storage.slots_mut();
        slots[0] = bytes as u32;
        slots[1] = (bytes >> 32) as u32;
    }

    /// Reserves `slots` slots, growing when needed, and returns the first index.
    fn fit(&mut self, slots: usize) -> ZerdeResult<usize> {
        let capacity = self.capacity_slots();
        let needed = self
            .used
            .checked_add(slots)
            .ok_or(ZerdeError::TooLarge { requested: usize::MAX })?;
        if needed > capacity {
            let new_slots = round_even(needed.max(capacity * 2));
            if new_slots as u64 * 4 > u32::MAX as u64 {
                return Err(ZerdeError::TooLarge {
                    requested: new_slots,
                });
            }
            self.storage.grow(new_slots)?;
            self.write_header();
        }
        let pos = self.used;
        self.used = needed;
        Ok(pos)
    }

    /// Reserves two slots at an even position, padding with one slot if needed.
    fn fit_aligned_pair(&mut self) -> ZerdeResult<usize> {
        if self.used % 2 != 0 {
            let pad = self.fit(3)?;
            self.storage.slots_mut()[pad] = 0;
            Ok(pad + 1)
        } else {
            self.fit(2)
        }
    }

    pub fn send_u32(&mut self, value: u32) -> ZerdeResult<()> {
        let pos = self.fit(1)?;
        self.storage.slots_mut()[pos] = value;
        Ok(())
    }

    pub fn send_i32(&mut self, value: i32) -> ZerdeResult<()> {
        self.send_u32(value as u32)
    }

    pub fn send_f32(&mut self, value: f32) -> ZerdeResult<()> {
        self.send_u32(value.to_bits())
    }

    pub fn send_u64(&mut self, value: u64) -> ZerdeResult<()> {
        let pos = self.fit_aligned_pair()?;
        let slots = self.storage.slots_mut();
        slots[pos] = value as u32;
        slots[pos + 1] = (value >> 32) as u32;
        Ok(())
    }

    pub fn send_f64(&mut self, value: f64) -> ZerdeResult<()> {
        self.send_u64(value.to_bits())
    }

    /// Length in UTF-16 code units, then one slot per unit.
    pub fn send_string(&mut self, value: &str) -> ZerdeResult<()> {
        let len = value.encode_utf16().count();
        let mut pos = self.fit(len + 1)?;
        let slots = self.storage.slots_mut();
        slots[pos] = len as u32;
        for unit in value.encode_utf16() {
            pos += 1;
            slots[pos] = unit as u32;
        }
        Ok(())
    }

    /// Byte length, then four bytes per slot with the first byte least significant.
    pub fn send_u8_slice(&mut self, bytes: &[u8]) -> ZerdeResult<()> {
        let words = bytes.len().div_ceil(4);
        let mut pos = self.fit(words + 1)?;
        let slots = self.storage.slots_mut();
        slots[pos] = bytes.len() as u32;
        for chunk in bytes.chunks(4) {
            pos += 1;
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            slots[pos] = u32::from_le_bytes(word);
        }
        Ok(())
    }

    /// Tag, pointer, length, then `refId` (shared) or capacity (exclusive).
    pub fn send_descriptor(&mut self, descriptor: &BufferDescriptor) -> ZerdeResult<()> {
        let last = match descriptor.ownership {
            Ownership::Shared { ref_id } => ref_id,
            Ownership::Exclusive { capacity } => capacity,
        };
        let pos = self.fit(4)?;
        let slots = self.storage.slots_mut();
        slots[pos] = descriptor.param_type().tag();
        slots[pos + 1] = descriptor.base_pointer;
        slots[pos + 2] = descriptor.byte_length;
        slots[pos + 3] = last;
        Ok(())
    }

    /// Count, then each param with its tag.
    pub fn send_params(&mut self, params: &[WireParam]) -> ZerdeResult<()> {
        self.send_u32(params.len() as u32)?;
        for param in params {
            match param {
                WireParam::String(value) => {
                    self.send_u32(crate::ParamType::String.tag())?;
                    self.send_string(value)?;
                }
                WireParam::Buffer(descriptor) => self.send_descriptor(descriptor)?,
            }
        }
        Ok(())
    }
}

fn round_even(slots: usize) -> usize {
    slots + (slots & 1)
}
