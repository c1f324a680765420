//! Cursor-based decoder mirroring [`crate::ZerdeBuilder`].

use crate::param::{BufferDescriptor, Ownership, ParamType, WireParam};
use crate::{ZerdeError, ZerdeResult, HEADER_SLOTS};

/// Reads values back out of a Zerde message, in the order they were sent.
///
/// Every read is bounds-checked against the length in the header; running
/// past it is a [`ZerdeError::Truncated`] protocol error.
#[derive(Debug, Clone)]
pub struct ZerdeParser<'a> {
    slots: &'a [u32],
    cursor: usize,
}

/// Decodes the byte length stored in the first two slots.
pub fn header_bytes(words: &[u32]) -> ZerdeResult<u64> {
    if words.len() < HEADER_SLOTS {
        return Err(ZerdeError::InvalidHeader {
            bytes: 0,
            available: words.len() * 4,
        });
    }
    Ok(words[0] as u64 | (words[1] as u64) << 32)
}

impl<'a> ZerdeParser<'a> {
    /// Starts parsing `words`, which must hold at least the header's byte count.
    pub fn new(words: &'a [u32]) -> ZerdeResult<Self> {
        let bytes = header_bytes(words)?;
        let available = words.len() * 4;
        if bytes % 4 != 0 || bytes < (HEADER_SLOTS as u64 * 4) || bytes > available as u64 {
            return Err(ZerdeError::InvalidHeader { bytes, available });
        }
        Ok(Self {
            slots: &words[..(bytes / 4) as usize],
            cursor: HEADER_SLOTS,
        })
    }

    /// Slot index of the next read.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Slots left before the end of the message.
    pub fn remaining(&self) -> usize {
        self.slots.len() - self.cursor
    }

    fn take(&mut self, wanted: usize) -> ZerdeResult<&'a [u32]> {
        let end = self.cursor.checked_add(wanted).filter(|end| *end <= self.slots.len());
        let Some(end) = end else {
            return Err(ZerdeError::Truncated {
                at: self.cursor,
                wanted,
                slots: self.slots.len(),
            });
        };
        let out = &self.slots[self.cursor..end];
        self.cursor = end;
        Ok(out)
    }

    pub fn parse_u32(&mut self) -> ZerdeResult<u32> {
        Ok(self.take(1)?[0])
    }

    pub fn parse_i32(&mut self) -> ZerdeResult<i32> {
        Ok(self.parse_u32()? as i32)
    }

    pub fn parse_f32(&mut self) -> ZerdeResult<f32> {
        Ok(f32::from_bits(self.parse_u32()?))
    }

    pub fn parse_u64(&mut self) -> ZerdeResult<u64> {
        if self.cursor % 2 != 0 {
            self.take(1)?;
        }
        let pair = self.take(2)?;
        Ok(pair[0] as u64 | (pair[1] as u64) << 32)
    }

    pub fn parse_f64(&mut self) -> ZerdeResult<f64> {
        Ok(f64::from_bits(self.parse_u64()?))
    }

    /// Raw UTF-16 code units of a string, unpaired surrogates included.
    pub fn parse_utf16(&mut self) -> ZerdeResult<Vec<u16>> {
        let len = self.parse_u32()? as usize;
        Ok(self.take(len)?.iter().map(|unit| *unit as u16).collect())
    }

    pub fn parse_string(&mut self) -> ZerdeResult<String> {
        let units = self.parse_utf16()?;
        String::from_utf16(&units).map_err(|_| ZerdeError::InvalidString)
    }

    pub fn parse_u8_slice(&mut self) -> ZerdeResult<Vec<u8>> {
        let len = self.parse_u32()? as usize;
        let words = self.take(len.div_ceil(4))?;
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    /// Reads the fields of a buffer descriptor whose tag has already been read.
    pub fn parse_descriptor(&mut self, tag: ParamType) -> ZerdeResult<BufferDescriptor> {
        let Some(element_type) = tag.element_type() else {
            return Err(ZerdeError::UnknownParamType(tag.tag()));
        };
        let fields = self.take(3)?;
        let ownership = if tag.is_shared() {
            Ownership::Shared { ref_id: fields[2] }
        } else {
            Ownership::Exclusive {
                capacity: fields[2],
            }
        };
        Ok(BufferDescriptor {
            base_pointer: fields[0],
            byte_length: fields[1],
            element_type,
            ownership,
        })
    }

    /// Count, then `count` tagged params. An unknown tag aborts the whole list.
    pub fn parse_params(&mut self) -> ZerdeResult<Vec<WireParam>> {
        let len = self.parse_u32()? as usize;
        // A param takes at least two slots; cap the reservation by what is left.
        let mut params = Vec::with_capacity(len.min(self.remaining() / 2));
        for _ in 0..len {
            let tag = ParamType::from_tag(self.parse_u32()?)?;
            let param = match tag {
                ParamType::String => WireParam::String(self.parse_string()?),
                buffer => WireParam::Buffer(self.parse_descriptor(buffer)?),
            };
            params.push(param);
        }
        Ok(params)
    }
}
