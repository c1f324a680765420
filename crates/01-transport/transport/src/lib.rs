#![cfg_attr(target_arch = "wasm32", feature(stdarch_wasm_atomic_wait))]
//! Shared-memory primitives for the compute/host bridge.
//!
//! * [`SharedRegion`] – fixed, zeroed, aligned backing memory.
//! * [`LinearMemory`] – the `u32`-addressed memory every buffer and message lives in.
//! * [`ControlRegion`] – the task broker's mutex-guarded mailbox of message pointers.
//! * [`wait`] – address-based wait/notify on 32-bit words.
//! * [`TransportError`] – allocation and addressing failures.

mod control;
mod error;
mod memory;
mod region;
pub mod wait;

pub use control::{ControlGuard, ControlRegion, DEFAULT_CONTROL_BYTES};
pub use error::{TransportError, TransportResult};
pub use memory::{LinearMemory, MEMORY_ALIGNMENT};
pub use region::SharedRegion;
