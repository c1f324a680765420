//! Host I/O seam: whatever actually performs the HTTP request.

use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;

use crate::{BrokerIoError, HttpRequest};

/// Body of a response, delivered in chunks as the host receives them.
pub type ChunkStream = LocalBoxStream<'static, Result<Vec<u8>, BrokerIoError>>;

pub struct FetchResponse {
    pub status: u16,
    pub body: ChunkStream,
}

impl FetchResponse {
    pub fn new(status: u16, body: ChunkStream) -> Self {
        Self { status, body }
    }

    /// A 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues requests on the broker thread. Futures need not be `Send`.
pub trait Fetcher {
    fn fetch(
        &self,
        request: HttpRequest,
    ) -> LocalBoxFuture<'static, Result<FetchResponse, BrokerIoError>>;
}
