//! Zerde: the schema-less binary codec used for every cross-boundary message.
//!
//! A message is a run of 4-byte slots behind an 8-byte little-endian header
//! holding the message's byte length. Values are pushed by a
//! [`ZerdeBuilder`] and read back in the same order by a [`ZerdeParser`]:
//!
//! * `u32` / `f32` – one slot.
//! * `u64` / `f64` – two slots at an even slot index; one zero padding slot is
//!   inserted when the cursor is odd.
//! * string – a length slot, then one slot per UTF-16 code unit.
//! * byte slice – a byte-length slot, then four bytes per slot, first byte
//!   least significant; the last slot may be partially filled.
//! * params – a count, then tagged strings or buffer descriptors.
//!
//! There is no schema: both sides must agree on the sequence of calls.

mod builder;
mod error;
mod message;
mod param;
mod parser;
mod storage;

pub use builder::{ZerdeBuilder, DEFAULT_SLOTS};
pub use error::{ZerdeError, ZerdeResult};
pub use message::WireMessage;
pub use param::{BufferDescriptor, ElementType, Ownership, ParamType, WireParam};
pub use parser::{header_bytes, ZerdeParser};
pub use storage::{HeapSlots, SlotStorage};

/// Slots occupied by the length header.
pub const HEADER_SLOTS: usize = 2;
