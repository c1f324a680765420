//! Bidirectional request/response messaging over a channel.
//!
//! A [`Bus`] is bound to one end of a [`Channel`]. Either side can
//! [`Bus::send`] a request on a [`Topic`] and await the correlated response,
//! and register one handler per topic with [`Bus::receive`]. Handler failures,
//! panics included, come back to the caller as a [`RemoteError`].

mod bus;
mod channel;
mod envelope;
mod error;
mod protocol;

pub use bus::Bus;
pub use channel::{linked_pair, Channel, ChannelPort};
pub use envelope::{Envelope, Message, ERROR_KEY, RESPONSE_TOPIC};
pub use error::{RemoteError, RpcError, RpcResult, HANDLER_NOT_FOUND, PANIC};
pub use protocol::{Payload, Protocol, Topic};
