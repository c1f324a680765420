//! Compute-side API: encode a request into linear memory, post it, block on
//! the result word.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use transport::{ControlRegion, TransportError};
use zap_buffers::{Executor, MessageSlots};
use zerde::ZerdeBuilder;

use crate::completion::{decode_result, reset, wait_result};
use crate::{BrokerError, BrokerResult, HttpRequest, TaskRequest};

/// Slots a request message starts with; the builder grows past it.
const INITIAL_MESSAGE_SLOTS: usize = 16;
const RESULT_WORD_BYTES: u32 = 4;

struct ClientInner {
    executor: Arc<dyn Executor>,
    control: Arc<ControlRegion>,
    shut_down: AtomicBool,
}

/// Posts requests to one broker. Cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct TaskClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TaskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClient")
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl TaskClient {
    pub fn new(executor: Arc<dyn Executor>, control: Arc<ControlRegion>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                executor,
                control,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Message pointers the control ring holds before requesters wait.
    pub fn control_capacity(&self) -> usize {
        self.inner.control.capacity()
    }

    /// Opens an HTTP stream. Fails with an I/O error when the request fails
    /// or answers with a non-2xx status.
    pub fn open_stream(&self, request: &HttpRequest) -> BrokerResult<HttpStream> {
        let request = request.clone();
        let mut submission = self.submit(|result_ptr| TaskRequest::HttpStreamNew {
            result_ptr,
            request,
        })?;
        let stream_id = decode_result(submission.wait()?)?;
        tracing::trace!(stream_id, "stream opened");
        Ok(HttpStream {
            client: self.clone(),
            stream_id,
            closed: false,
        })
    }

    /// Issues a read of up to `len` bytes without waiting for it.
    ///
    /// Only one read per stream may be pending; a second one fails with
    /// [`BrokerError::MultiplePendingReads`] when waited on.
    pub fn begin_read(&self, stream_id: u32, len: usize) -> BrokerResult<PendingRead> {
        let buf_len = u32::try_from(len)
            .map_err(|_| BrokerError::protocol(format!("read of {len} bytes")))?;
        let executor = &self.inner.executor;
        let buf_ptr = executor.alloc(buf_len)?;
        let submission = self.submit(|result_ptr| TaskRequest::HttpStreamRead {
            result_ptr,
            stream_id,
            buf_ptr,
            buf_len,
        });
        match submission {
            Ok(submission) => Ok(PendingRead {
                submission,
                buf_ptr,
                buf_len,
            }),
            Err(err) => {
                free(&**executor, buf_ptr);
                Err(err)
            }
        }
    }

    /// Blocks until at least one byte, EOF (`Ok(0)`) or an error.
    pub fn read(&self, stream_id: u32, buf: &mut [u8]) -> BrokerResult<usize> {
        let bytes = self.begin_read(stream_id, buf.len())?.wait()?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn close_stream(&self, stream_id: u32) -> BrokerResult<()> {
        let mut submission = self.submit(|result_ptr| TaskRequest::HttpStreamClose {
            result_ptr,
            stream_id,
        })?;
        decode_result(submission.wait()?)?;
        Ok(())
    }

    /// Stops the broker. Every later request from any clone fails with
    /// [`BrokerError::ShutDown`].
    pub fn shutdown(&self) -> BrokerResult<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::ShutDown);
        }
        let mut submission = self.post(|result_ptr| TaskRequest::Shutdown { result_ptr })?;
        decode_result(submission.wait()?)?;
        Ok(())
    }

    fn submit(&self, build: impl FnOnce(u32) -> TaskRequest) -> BrokerResult<Submission> {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        self.post(build)
    }

    /// Allocates the result word, writes the message and posts it. A region
    /// closed by its broker fails with [`BrokerError::ShutDown`].
    fn post(&self, build: impl FnOnce(u32) -> TaskRequest) -> BrokerResult<Submission> {
        let executor = &self.inner.executor;
        let result_ptr = executor.alloc(RESULT_WORD_BYTES)?;
        let message_ptr = match self.encode(result_ptr, build) {
            Ok(ptr) => ptr,
            Err(err) => {
                free(&**executor, result_ptr);
                return Err(err);
            }
        };
        if let Err(err) = self.inner.control.post_blocking(message_ptr) {
            free(&**executor, message_ptr);
            free(&**executor, result_ptr);
            return Err(match err {
                TransportError::Closed => {
                    self.inner.shut_down.store(true, Ordering::Release);
                    BrokerError::ShutDown
                }
                other => other.into(),
            });
        }
        Ok(Submission {
            inner: Arc::clone(&self.inner),
            message_ptr,
            result_ptr,
            outcome: None,
        })
    }

    fn encode(&self, result_ptr: u32, build: impl FnOnce(u32) -> TaskRequest) -> BrokerResult<u32> {
        let executor = &self.inner.executor;
        reset(executor.memory(), result_ptr)?;
        let slots = MessageSlots::new(Arc::clone(executor), INITIAL_MESSAGE_SLOTS)?;
        let mut builder = ZerdeBuilder::with_storage(slots)?;
        build(result_ptr).encode(&mut builder)?;
        Ok(builder.finish().into_raw())
    }
}

fn free(executor: &dyn Executor, ptr: u32) {
    if let Err(err) = executor.dealloc(ptr) {
        tracing::error!("failed to free {ptr}: {err}");
    }
}

/// A posted request. Frees its message and result word once answered; if
/// dropped unanswered it blocks until the broker replies.
struct Submission {
    inner: Arc<ClientInner>,
    message_ptr: u32,
    result_ptr: u32,
    outcome: Option<i32>,
}

impl Submission {
    fn wait(&mut self) -> BrokerResult<i32> {
        if let Some(code) = self.outcome {
            return Ok(code);
        }
        let code = wait_result(self.inner.executor.memory(), self.result_ptr)?;
        self.outcome = Some(code);
        let executor = &*self.inner.executor;
        free(executor, self.message_ptr);
        free(executor, self.result_ptr);
        Ok(code)
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if let Err(err) = self.wait() {
            tracing::error!("abandoned task request at {}: {err}", self.message_ptr);
        }
    }
}

/// A read in flight. The broker writes into a scratch buffer owned by this
/// value; dropping it waits for the answer before freeing the buffer.
pub struct PendingRead {
    submission: Submission,
    buf_ptr: u32,
    buf_len: u32,
}

impl PendingRead {
    /// Blocks until the read is answered. An empty result means EOF.
    pub fn wait(mut self) -> BrokerResult<Vec<u8>> {
        let len = decode_result(self.submission.wait()?)?;
        if len > self.buf_len {
            return Err(BrokerError::protocol(format!(
                "read answered {len} bytes into a {} byte buffer",
                self.buf_len
            )));
        }
        let mut bytes = vec![0; len as usize];
        // SAFETY: the broker signalled, so it no longer writes the buffer.
        unsafe {
            self.submission
                .inner
                .executor
                .memory()
                .copy_out(self.buf_ptr, &mut bytes)?;
        }
        Ok(bytes)
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if let Err(err) = self.submission.wait() {
            tracing::error!("abandoned read into {}: {err}", self.buf_ptr);
        }
        free(&*self.submission.inner.executor, self.buf_ptr);
    }
}

/// An open HTTP response body. Closed on drop.
pub struct HttpStream {
    client: TaskClient,
    stream_id: u32,
    closed: bool,
}

impl HttpStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn begin_read(&self, len: usize) -> BrokerResult<PendingRead> {
        self.client.begin_read(self.stream_id, len)
    }

    pub fn close(mut self) -> BrokerResult<()> {
        self.closed = true;
        self.client.close_stream(self.stream_id)
    }
}

impl std::fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStream")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl io::Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.client.read(self.stream_id, buf)?)
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        if self.closed || self.client.is_shut_down() {
            return;
        }
        if let Err(err) = self.client.close_stream(self.stream_id) {
            tracing::debug!(stream_id = self.stream_id, "close on drop failed: {err}");
        }
    }
}
