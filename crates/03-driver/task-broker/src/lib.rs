//! Blocking host I/O for compute threads.
//!
//! A compute thread cannot await the host's async APIs, so it writes a request
//! into linear memory, posts its address to a [`transport::ControlRegion`] and
//! parks on a result word. The [`TaskBroker`] runs on the host thread, drains
//! the region, performs the work asynchronously through a [`Fetcher`] and wakes
//! the requester by storing the outcome.
//!
//! HTTP responses are streamed: the broker keeps reading each open stream
//! ahead of demand and answers a read as soon as it has bytes, EOF or an error.
//! [`TaskClient`] wraps the protocol for compute threads; [`HttpStream`]
//! implements [`std::io::Read`].

mod broker;
mod client;
pub mod completion;
mod config;
mod error;
mod fetcher;
mod request;
mod stream;

pub use broker::{BrokerHandle, TaskBroker};
pub use client::{HttpStream, PendingRead, TaskClient};
pub use completion::{
    RESULT_IO_ERROR, RESULT_MULTIPLE_PENDING_READS, RESULT_PENDING, RESULT_UNKNOWN_STREAM,
};
pub use config::{BrokerConfig, SchedulerMode, DEFAULT_POLL_INTERVAL};
pub use error::{BrokerError, BrokerIoError, BrokerResult};
pub use fetcher::{ChunkStream, FetchResponse, Fetcher};
pub use request::{
    HttpRequest, TaskRequest, TAG_HTTP_STREAM_CLOSE, TAG_HTTP_STREAM_NEW, TAG_HTTP_STREAM_READ,
    TAG_SHUTDOWN,
};
pub use stream::{ReadOutcome, ReadRequest, StreamState};
