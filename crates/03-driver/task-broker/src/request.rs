//! Messages a compute thread posts to the broker.
//!
//! Every message starts with a type tag and the address of the requester's
//! result word:
//!
//! ```text
//! 1 http stream new    result_ptr, url, method, body (u8 slice), n, (name, value) * n
//! 2 http stream read   result_ptr, stream_id, buf_ptr, buf_len
//! 3 http stream close  result_ptr, stream_id
//! 4 shutdown           result_ptr
//! ```

use zerde::{SlotStorage, ZerdeBuilder, ZerdeParser, ZerdeResult};

use crate::{BrokerError, BrokerResult};

pub const TAG_HTTP_STREAM_NEW: u32 = 1;
pub const TAG_HTTP_STREAM_READ: u32 = 2;
pub const TAG_HTTP_STREAM_CLOSE: u32 = 3;
pub const TAG_SHUTDOWN: u32 = 4;

/// An HTTP request as the host should issue it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskRequest {
    HttpStreamNew {
        result_ptr: u32,
        request: HttpRequest,
    },
    HttpStreamRead {
        result_ptr: u32,
        stream_id: u32,
        buf_ptr: u32,
        buf_len: u32,
    },
    HttpStreamClose {
        result_ptr: u32,
        stream_id: u32,
    },
    Shutdown {
        result_ptr: u32,
    },
}

impl TaskRequest {
    pub fn tag(&self) -> u32 {
        match self {
            TaskRequest::HttpStreamNew { .. } => TAG_HTTP_STREAM_NEW,
            TaskRequest::HttpStreamRead { .. } => TAG_HTTP_STREAM_READ,
            TaskRequest::HttpStreamClose { .. } => TAG_HTTP_STREAM_CLOSE,
            TaskRequest::Shutdown { .. } => TAG_SHUTDOWN,
        }
    }

    pub fn result_ptr(&self) -> u32 {
        match *self {
            TaskRequest::HttpStreamNew { result_ptr, .. }
            | TaskRequest::HttpStreamRead { result_ptr, .. }
            | TaskRequest::HttpStreamClose { result_ptr, .. }
            | TaskRequest::Shutdown { result_ptr } => result_ptr,
        }
    }

    pub fn encode<S: SlotStorage>(&self, builder: &mut ZerdeBuilder<S>) -> ZerdeResult<()> {
        builder.send_u32(self.tag())?;
        builder.send_u32(self.result_ptr())?;
        match self {
            TaskRequest::HttpStreamNew { request, .. } => {
                builder.send_string(&request.url)?;
                builder.send_string(&request.method)?;
                builder.send_u8_slice(&request.body)?;
                builder.send_u32(request.headers.len() as u32)?;
                for (name, value) in &request.headers {
                    builder.send_string(name)?;
                    builder.send_string(value)?;
                }
            }
            TaskRequest::HttpStreamRead {
                stream_id,
                buf_ptr,
                buf_len,
                ..
            } => {
                builder.send_u32(*stream_id)?;
                builder.send_u32(*buf_ptr)?;
                builder.send_u32(*buf_len)?;
            }
            TaskRequest::HttpStreamClose { stream_id, .. } => builder.send_u32(*stream_id)?,
            TaskRequest::Shutdown { .. } => {}
        }
        Ok(())
    }

    /// Reads the tag and result word address, the part every message shares.
    pub fn decode_head(parser: &mut ZerdeParser<'_>) -> BrokerResult<(u32, u32)> {
        Ok((parser.parse_u32()?, parser.parse_u32()?))
    }

    /// Reads the rest of a message whose head was already decoded.
    pub fn decode_body(
        tag: u32,
        result_ptr: u32,
        parser: &mut ZerdeParser<'_>,
    ) -> BrokerResult<Self> {
        Ok(match tag {
            TAG_HTTP_STREAM_NEW => {
                let url = parser.parse_string()?;
                let method = parser.parse_string()?;
                let body = parser.parse_u8_slice()?;
                let count = parser.parse_u32()? as usize;
                let mut headers = Vec::with_capacity(count.min(parser.remaining() / 2));
                for _ in 0..count {
                    headers.push((parser.parse_string()?, parser.parse_string()?));
                }
                TaskRequest::HttpStreamNew {
                    result_ptr,
                    request: HttpRequest {
                        url,
                        method,
                        body,
                        headers,
                    },
                }
            }
            TAG_HTTP_STREAM_READ => TaskRequest::HttpStreamRead {
                result_ptr,
                stream_id: parser.parse_u32()?,
                buf_ptr: parser.parse_u32()?,
                buf_len: parser.parse_u32()?,
            },
            TAG_HTTP_STREAM_CLOSE => TaskRequest::HttpStreamClose {
                result_ptr,
                stream_id: parser.parse_u32()?,
            },
            TAG_SHUTDOWN => TaskRequest::Shutdown { result_ptr },
            other => {
                return Err(BrokerError::protocol(format!(
                    "unknown task message type {other}"
                )))
            }
        })
    }

    pub fn decode(parser: &mut ZerdeParser<'_>) -> BrokerResult<Self> {
        let (tag, result_ptr) = Self::decode_head(parser)?;
        Self::decode_body(tag, result_ptr, parser)
    }
}
