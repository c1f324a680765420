//! Typed parameters and buffer descriptors as they appear on the wire.
//!
//! Shared descriptors carry `(pointer, length, refId)`, exclusive ones
//! `(pointer, length, capacity)`; both are preceded by a [`ParamType`] tag.

use crate::{ZerdeError, ZerdeResult};

/// Element type of a buffer region. Views must use exactly this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U32,
    F32,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> u32 {
        match self {
            ElementType::U8 => 1,
            ElementType::U32 | ElementType::F32 => 4,
        }
    }
}

/// Tag preceding every entry of a parameter list.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamType {
    String = 0,
    ReadOnlyU8Buffer = 1,
    U8Buffer = 2,
    F32Buffer = 3,
    ReadOnlyF32Buffer = 4,
    U32Buffer = 5,
    ReadOnlyU32Buffer = 6,
}

impl ParamType {
    pub fn from_tag(tag: u32) -> ZerdeResult<Self> {
        Ok(match tag {
            0 => ParamType::String,
            1 => ParamType::ReadOnlyU8Buffer,
            2 => ParamType::U8Buffer,
            3 => ParamType::F32Buffer,
            4 => ParamType::ReadOnlyF32Buffer,
            5 => ParamType::U32Buffer,
            6 => ParamType::ReadOnlyU32Buffer,
            other => return Err(ZerdeError::UnknownParamType(other)),
        })
    }

    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Tag for a buffer of `element_type`; `shared` selects the read-only variant.
    pub const fn for_buffer(element_type: ElementType, shared: bool) -> Self {
        match (element_type, shared) {
            (ElementType::U8, true) => ParamType::ReadOnlyU8Buffer,
            (ElementType::U8, false) => ParamType::U8Buffer,
            (ElementType::U32, true) => ParamType::ReadOnlyU32Buffer,
            (ElementType::U32, false) => ParamType::U32Buffer,
            (ElementType::F32, true) => ParamType::ReadOnlyF32Buffer,
            (ElementType::F32, false) => ParamType::F32Buffer,
        }
    }

    /// Element type for buffer tags, `None` for strings.
    pub const fn element_type(self) -> Option<ElementType> {
        match self {
            ParamType::String => None,
            ParamType::ReadOnlyU8Buffer | ParamType::U8Buffer => Some(ElementType::U8),
            ParamType::ReadOnlyU32Buffer | ParamType::U32Buffer => Some(ElementType::U32),
            ParamType::ReadOnlyF32Buffer | ParamType::F32Buffer => Some(ElementType::F32),
        }
    }

    pub const fn is_shared(self) -> bool {
        matches!(
            self,
            ParamType::ReadOnlyU8Buffer | ParamType::ReadOnlyU32Buffer | ParamType::ReadOnlyF32Buffer
        )
    }
}

/// Ownership discipline of a described region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Exactly one live handle; `capacity` is the allocated size in bytes.
    Exclusive { capacity: u32 },
    /// Reference counted on the owning side under `ref_id`.
    Shared { ref_id: u32 },
}

/// Where a buffer lives and how it may be used, without the data itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub base_pointer: u32,
    pub byte_length: u32,
    pub element_type: ElementType,
    pub ownership: Ownership,
}

impl BufferDescriptor {
    pub fn param_type(&self) -> ParamType {
        ParamType::for_buffer(self.element_type, self.is_shared())
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.ownership, Ownership::Shared { .. })
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u64 {
        self.base_pointer as u64 + self.byte_length as u64
    }

    /// Number of whole elements in the region.
    pub fn element_count(&self) -> u32 {
        self.byte_length / self.element_type.size()
    }
}

/// One decoded entry of a parameter list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireParam {
    String(String),
    Buffer(BufferDescriptor),
}

impl From<String> for WireParam {
    fn from(value: String) -> Self {
        WireParam::String(value)
    }
}

impl From<&str> for WireParam {
    fn from(value: &str) -> Self {
        WireParam::String(value.to_owned())
    }
}

impl From<BufferDescriptor> for WireParam {
    fn from(value: BufferDescriptor) -> Self {
        WireParam::Buffer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_wire_values() {
        for tag in 0..=6 {
            assert_eq!(ParamType::from_tag(tag).expect("known tag").tag(), tag);
        }
        assert_eq!(
            ParamType::from_tag(7),
            Err(ZerdeError::UnknownParamType(7))
        );
    }

    #[test]
    fn buffer_tags_carry_element_and_ownership() {
        let tag = ParamType::for_buffer(ElementType::F32, true);
        assert_eq!(tag, ParamType::ReadOnlyF32Buffer);
        assert!(tag.is_shared());
        assert_eq!(tag.element_type(), Some(ElementType::F32));
        assert!(!ParamType::U32Buffer.is_shared());
        assert_eq!(ParamType::String.element_type(), None);
    }
}
