//! Error surface for the shared-memory primitives.
//!
//! Allocation and addressing failures only. Higher layers translate these into
//! their own protocol or ownership errors.

use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by low-level transport helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Requested region or ring size is below the minimum or not properly aligned.
    #[error("capacity {requested} must be at least {minimum} and properly aligned")]
    InvalidCapacity { requested: usize, minimum: usize },

    /// Allocation of a shared region failed for the given size/alignment pair.
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// An address range does not lie inside the linear memory.
    #[error("address range {addr:#x}+{len} exceeds linear memory of {size} bytes")]
    OutOfRange { addr: u32, len: usize, size: usize },

    /// An address is not aligned for the requested access.
    #[error("address {addr:#x} is not aligned to {alignment} bytes")]
    Misaligned { addr: u32, alignment: usize },

    /// The control ring has no free entry.
    #[error("control ring is full ({capacity} entries)")]
    RingFull { capacity: usize },

    /// The control region was closed by its broker.
    #[error("control region is closed")]
    Closed,
}
