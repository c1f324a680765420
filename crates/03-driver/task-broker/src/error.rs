use thiserror::Error;
use transport::TransportError;
use zap_buffers::BufferError;
use zerde::ZerdeError;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failure of host-side I/O (opening or reading a stream).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerIoError(String);

impl BrokerIoError {
    pub fn new(msg: impl Into<String>) -> Self {
        BrokerIoError(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker i/o error: {0}")]
    Io(#[from] BrokerIoError),

    #[error("a read is already pending on this stream")]
    MultiplePendingReads,

    #[error("unknown or closed stream")]
    UnknownStream,

    #[error("broker has shut down")]
    ShutDown,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] ZerdeError),

    #[error("failed to start broker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("broker thread panicked")]
    Panicked,
}

impl BrokerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        BrokerError::Protocol(msg.into())
    }

    pub fn is_ownership_violation(&self) -> bool {
        match self {
            BrokerError::MultiplePendingReads => true,
            BrokerError::Buffer(err) => err.is_ownership_violation(),
            _ => false,
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, BrokerError::Protocol(_) | BrokerError::Wire(_))
    }
}

impl From<BrokerError> for std::io::Error {
    fn from(err: BrokerError) -> Self {
        std::io::Error::other(err)
    }
}
