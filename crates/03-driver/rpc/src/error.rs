use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Name used for responses to requests nobody handles.
pub const HANDLER_NOT_FOUND: &str = "HandlerNotFound";

/// Name used when a handler panics.
pub const PANIC: &str = "Panic";

/// A handler failure as it travels back to the caller.
///
/// Only the strings survive the boundary; the original error type does not.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn handler_not_found(topic: &str) -> Self {
        Self::new(
            HANDLER_NOT_FOUND,
            format!("no receiver registered for {topic}"),
        )
    }

    /// A `RemoteError` inside the chain is passed through untouched; anything
    /// else is named `Error` with its causes as the stack.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return remote.clone();
        }
        Self {
            name: "Error".to_owned(),
            message: err.to_string(),
            stack: err
                .chain()
                .skip(1)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|msg| (*msg).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_owned());
        Self::new(PANIC, message)
    }

    pub fn is_handler_not_found(&self) -> bool {
        self.name == HANDLER_NOT_FOUND
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("channel already has a bus bound to it")]
    AlreadyBound,

    #[error("bus is already being served")]
    AlreadyServing,

    #[error("a receiver is already registered for {topic}")]
    DuplicateHandler { topic: &'static str },

    #[error("remote handler failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("channel closed before a response arrived")]
    ChannelClosed,

    #[error("unknown topic {name} (request {id})")]
    UnknownTopic { name: String, id: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RpcError::Protocol(msg.into())
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_) | RpcError::Json(_) | RpcError::UnknownTopic { .. }
        )
    }

    pub fn is_handler_not_found(&self) -> bool {
        matches!(self, RpcError::Remote(remote) if remote.is_handler_not_found())
    }

    /// The remote failure, if this error carries one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_context_becomes_stack() {
        let err = anyhow::anyhow!("root cause").context("while reading");
        let remote = RemoteError::from_anyhow(&err);
        assert_eq!(remote.name, "Error");
        assert_eq!(remote.message, "while reading");
        assert_eq!(remote.stack, "root cause");

        let passthrough = anyhow::Error::new(RemoteError::new("Custom", "kept"));
        assert_eq!(RemoteError::from_anyhow(&passthrough).name, "Custom");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(RemoteError::from_panic(&*payload).message, "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(RemoteError::from_panic(&*payload).message, "owned boom");
    }
}
