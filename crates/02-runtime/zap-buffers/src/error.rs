use std::fmt;

use thiserror::Error;
use transport::TransportError;
use zerde::{ElementType, ZerdeError};

pub type BufferResult<T> = Result<T, BufferError>;

/// Which side of the ownership protocol a buffer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnershipKind {
    Exclusive,
    Shared,
}

impl fmt::Display for OwnershipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipKind::Exclusive => f.write_str("exclusive"),
            OwnershipKind::Shared => f.write_str("shared"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error(
        "view at byte offset {byte_offset} with byte length {byte_length} lies outside \
         buffer [{base}, {base}+{len})"
    )]
    OutOfBounds {
        byte_offset: u64,
        byte_length: u64,
        base: u32,
        len: u32,
    },

    #[error("buffer at {base_pointer} was already transferred or unregistered")]
    UseAfterTransfer { base_pointer: u32 },

    #[error("pointer {ptr} is not a live allocation (double free?)")]
    DoubleFree { ptr: u32 },

    #[error("shared reference {ref_id} is not live")]
    UnknownRef { ref_id: u32 },

    #[error("element type mismatch: expected {expected:?}, buffer holds {actual:?}")]
    TypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },

    #[error(
        "view covers [{view_offset}, {view_offset}+{view_length}) but buffer spans \
         [{base}, {base}+{len})"
    )]
    ExtentMismatch {
        view_offset: u32,
        view_length: u32,
        base: u32,
        len: u32,
    },

    #[error("expected a {expected} buffer, got a {actual} one")]
    OwnershipMismatch {
        expected: OwnershipKind,
        actual: OwnershipKind,
    },

    #[error("shared reference {ref_id} is cached for a different region")]
    DescriptorConflict { ref_id: u32 },

    #[error("out of linear memory: {requested} bytes requested")]
    OutOfMemory { requested: u32 },

    #[error("no call handler installed on the executor")]
    NoCallHandler,

    #[error("executor call failed: {0}")]
    Call(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] ZerdeError),
}

impl BufferError {
    pub fn call(msg: impl Into<String>) -> Self {
        BufferError::Call(msg.into())
    }

    /// Errors that mean a party broke the ownership protocol.
    pub fn is_ownership_violation(&self) -> bool {
        matches!(
            self,
            BufferError::UseAfterTransfer { .. }
                | BufferError::DoubleFree { .. }
                | BufferError::UnknownRef { .. }
                | BufferError::TypeMismatch { .. }
                | BufferError::ExtentMismatch { .. }
                | BufferError::OwnershipMismatch { .. }
                | BufferError::DescriptorConflict { .. }
        )
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, BufferError::Wire(_))
    }
}
