//! Buffer ownership across the compute/host boundary.
//!
//! Buffers live in the executor's linear memory and are described by a
//! [`zerde::BufferDescriptor`]. The host wraps descriptors into handles:
//!
//! * [`ExclusiveBuffer`] – one owner, mutable, freed on drop unless it was
//!   transferred back first;
//! * [`SharedBuffer`] – read-only and reference counted by the executor;
//!   wrapping the same `ref_id` again yields the same cached handle.
//!
//! Views ([`BufferView`], [`BufferViewMut`]) are typed and bounds-checked
//! against the descriptor.

mod error;
mod executor;
mod handle;
mod message_slots;
mod registry;
mod view;

pub use error::{BufferError, BufferResult, OwnershipKind};
pub use executor::{CallHandler, Executor, NativeExecutor, DEFAULT_MEMORY_BYTES};
pub use handle::{BufferHandle, ExclusiveBuffer, SharedBuffer};
pub use message_slots::MessageSlots;
pub use registry::BufferRegistry;
pub use view::{BufferView, BufferViewMut, Element};
