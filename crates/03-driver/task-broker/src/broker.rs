//! The broker loop: runs on the host thread and turns messages posted by
//! compute threads into async host work.
//!
//! Each round drains the control region, dispatches every message, then lets
//! spawned work run until it stalls. With nothing outstanding the broker parks
//! on the region's counter; otherwise it sleeps for the poll interval (or until
//! a waker unparks it) so in-flight streams keep moving.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::{AbortHandle, Abortable};
use futures::task::{LocalSpawnExt, SpawnError};
use futures::StreamExt;
use transport::ControlRegion;
use zap_buffers::Executor;
use zerde::ZerdeParser;

use crate::completion::{
    signal, RESULT_IO_ERROR, RESULT_MULTIPLE_PENDING_READS, RESULT_UNKNOWN_STREAM,
};
use crate::stream::{ReadOutcome, ReadRequest, StreamState};
use crate::{
    BrokerConfig, BrokerError, BrokerResult, ChunkStream, Fetcher, HttpRequest, SchedulerMode,
    TaskClient, TaskRequest,
};

/// First id handed out to an opened stream.
const FIRST_STREAM_ID: u32 = 1;
/// Ids are reported through an `i32` result word.
const MAX_STREAM_ID: u32 = i32::MAX as u32;

const THREAD_NAME: &str = "task-broker";

struct StreamEntry {
    state: StreamState,
    abort: AbortHandle,
    /// Result word of the open request, until the response arrives.
    opening: Option<u32>,
}

type Streams = Rc<RefCell<HashMap<u32, StreamEntry>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Counts one unit of outstanding async work for as long as it lives.
struct Outstanding(Rc<Cell<usize>>);

impl Outstanding {
    fn new(counter: &Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self(Rc::clone(counter))
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// State shared by the loop and the tasks it spawns. Lives on one thread.
#[derive(Clone)]
struct Host {
    executor: Arc<dyn Executor>,
    streams: Streams,
}

impl Host {
    fn signal(&self, result_ptr: u32, value: i32) {
        if let Err(err) = signal(self.executor.memory(), result_ptr, value) {
            tracing::error!("failed to complete result word {result_ptr}: {err}");
        }
    }

    /// Answers the pending read of `stream_id` if its stream can.
    fn complete_read(&self, stream_id: u32) {
        let completed = self
            .streams
            .borrow_mut()
            .get_mut(&stream_id)
            .and_then(|entry| entry.state.try_complete());
        if let Some((request, outcome)) = completed {
            self.answer_read(request, outcome);
        }
    }

    fn answer_read(&self, request: ReadRequest, outcome: ReadOutcome) {
        let value = match outcome {
            ReadOutcome::Data(bytes) => {
                // SAFETY: the requester lends `buf_ptr..buf_ptr + buf_len` to
                // the broker until the result word is signalled, and `bytes`
                // never exceeds `buf_len`.
                match unsafe { self.executor.memory().copy_in(request.buf_ptr, &bytes) } {
                    Ok(()) => bytes.len() as i32,
                    Err(err) => {
                        tracing::error!("read buffer at {} rejected: {err}", request.buf_ptr);
                        RESULT_IO_ERROR
                    }
                }
            }
            ReadOutcome::Eof => 0,
            ReadOutcome::Error => RESULT_IO_ERROR,
        };
        self.signal(request.result_ptr, value);
    }

    /// Claims the open request's result word once the response is in.
    fn take_opening(&self, stream_id: u32) -> Option<u32> {
        self.streams
            .borrow_mut()
            .get_mut(&stream_id)
            .and_then(|entry| entry.opening.take())
    }

    /// Drops a stream whose open failed and reports the failure.
    fn fail_open(&self, stream_id: u32) {
        let removed = self.streams.borrow_mut().remove(&stream_id);
        if let Some(result_ptr) = removed.and_then(|entry| entry.opening) {
            self.signal(result_ptr, RESULT_IO_ERROR);
        }
    }

    /// Runs with the stream's state, or returns `None` once it was closed.
    fn with_stream<R>(&self, stream_id: u32, f: impl FnOnce(&mut StreamState) -> R) -> Option<R> {
        self.streams
            .borrow_mut()
            .get_mut(&stream_id)
            .map(|entry| f(&mut entry.state))
    }

    /// Reads `body` to the end, buffering ahead of demand.
    async fn pump(self, stream_id: u32, mut body: ChunkStream) {
        while let Some(item) = body.next().await {
            let failed = item.is_err();
            let still_open = self.with_stream(stream_id, |state| match item {
                Ok(chunk) => state.push_chunk(chunk),
                Err(err) => {
                    tracing::debug!(stream_id, "stream body failed: {err}");
                    state.fail();
                }
            });
            if still_open.is_none() {
                return;
            }
            self.complete_read(stream_id);
            if failed {
                return;
            }
        }
        self.with_stream(stream_id, StreamState::finish);
        self.complete_read(stream_id);
    }
}

/// Owns the host side of one control region.
pub struct TaskBroker {
    host: Host,
    control: Arc<ControlRegion>,
    fetcher: Rc<dyn Fetcher>,
    config: BrokerConfig,
    pool: LocalPool,
    spawner: LocalSpawner,
    outstanding: Rc<Cell<usize>>,
    next_stream_id: u32,
}

impl TaskBroker {
    pub fn new(
        executor: Arc<dyn Executor>,
        control: Arc<ControlRegion>,
        fetcher: Rc<dyn Fetcher>,
        config: BrokerConfig,
    ) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            host: Host {
                executor,
                streams: Rc::new(RefCell::new(HashMap::new())),
            },
            control,
            fetcher,
            config,
            pool,
            spawner,
            outstanding: Rc::new(Cell::new(0)),
            next_stream_id: FIRST_STREAM_ID,
        }
    }

    /// Starts a broker on its own thread and returns a handle with a client
    /// for compute threads.
    ///
    /// The fetcher is built on the broker thread, so it need not be `Send`.
    pub fn spawn<M, F>(
        executor: Arc<dyn Executor>,
        config: BrokerConfig,
        make_fetcher: M,
    ) -> BrokerResult<BrokerHandle>
    where
        M: FnOnce() -> F + Send + 'static,
        F: Fetcher + 'static,
    {
        let control = Arc::new(ControlRegion::with_bytes(config.control_bytes)?);
        let client = TaskClient::new(Arc::clone(&executor), Arc::clone(&control));
        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                let fetcher: Rc<dyn Fetcher> = Rc::new(make_fetcher());
                TaskBroker::new(executor, control, fetcher, config).run();
            })
            .map_err(BrokerError::Spawn)?;
        tracing::debug!(capacity = client.control_capacity(), "task broker started");
        Ok(BrokerHandle {
            thread: Some(thread),
            client,
        })
    }

    /// Async work currently in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Serves the control region until a shutdown request arrives, then
    /// closes it and refuses whatever was posted in the meantime.
    pub fn run(mut self) {
        let mut batch = Vec::new();
        loop {
            let flow = self.run_once(&mut batch);
            if flow == Flow::Shutdown {
                break;
            }
            match SchedulerMode::for_outstanding(self.outstanding()) {
                SchedulerMode::Blocking => self.control.wait_for_messages(),
                SchedulerMode::Cooperative => thread::park_timeout(self.config.poll_interval),
            }
        }
        // Requests that followed the shutdown in its batch.
        self.abandon_streams();
        batch.clear();
        self.control.close_into(&mut batch);
        for &message_ptr in batch.iter() {
            self.refuse_message(message_ptr);
        }
        tracing::debug!(refused = batch.len(), "task broker stopped");
    }

    /// Answers a message that arrived after shutdown with an I/O error.
    fn refuse_message(&self, message_ptr: u32) {
        let mut result_ptr = None;
        if let Err(err) = self.decode(message_ptr, &mut result_ptr) {
            tracing::error!("bad task message at {message_ptr}: {err}");
        }
        if let Some(result_ptr) = result_ptr {
            self.host.signal(result_ptr, RESULT_IO_ERROR);
        }
    }

    /// One round: drain, dispatch, then run spawned work until it stalls.
    fn run_once(&mut self, batch: &mut Vec<u32>) -> Flow {
        let mut flow = Flow::Continue;
        if self.control.pending_hint() > 0 {
            batch.clear();
            self.control.drain_into(batch);
            tracing::trace!(count = batch.len(), "drained");
            for &message_ptr in batch.iter() {
                if self.handle_message(message_ptr) == Flow::Shutdown {
                    flow = Flow::Shutdown;
                }
            }
        }
        self.pool.run_until_stalled();
        flow
    }

    fn handle_message(&mut self, message_ptr: u32) -> Flow {
        let mut result_ptr = None;
        let decoded = self.decode(message_ptr, &mut result_ptr);
        match decoded {
            Ok(request) => self.dispatch(request),
            Err(err) => {
                tracing::error!("bad task message at {message_ptr}: {err}");
                if let Some(result_ptr) = result_ptr {
                    self.host.signal(result_ptr, RESULT_IO_ERROR);
                }
                Flow::Continue
            }
        }
    }

    /// Decodes the message into an owned request. The requester frees the
    /// message once signalled, so nothing may point into it afterwards.
    fn decode(&self, message_ptr: u32, result_ptr: &mut Option<u32>) -> BrokerResult<TaskRequest> {
        let memory = self.host.executor.memory();
        // SAFETY: the requester keeps the message alive and unmodified until
        // its result word is signalled.
        let byte_len = unsafe { memory.read_u64_le(message_ptr)? };
        let slots = usize::try_from(byte_len / 4)
            .map_err(|_| BrokerError::protocol(format!("message length {byte_len}")))?;
        // SAFETY: as above; the range is bounds-checked by `slice`.
        let words = unsafe { memory.slice::<u32>(message_ptr, slots)? };
        let mut parser = ZerdeParser::new(words)?;
        let (tag, ptr) = TaskRequest::decode_head(&mut parser)?;
        *result_ptr = Some(ptr);
        TaskRequest::decode_body(tag, ptr, &mut parser)
    }

    fn dispatch(&mut self, request: TaskRequest) -> Flow {
        tracing::trace!(tag = request.tag(), "dispatch");
        match request {
            TaskRequest::HttpStreamNew {
                result_ptr,
                request,
            } => self.open_stream(result_ptr, request),
            TaskRequest::HttpStreamRead {
                result_ptr,
                stream_id,
                buf_ptr,
                buf_len,
            } => self.read_stream(
                stream_id,
                ReadRequest {
                    result_ptr,
                    buf_ptr,
                    buf_len,
                },
            ),
            TaskRequest::HttpStreamClose {
                result_ptr,
                stream_id,
            } => self.close_stream(result_ptr, stream_id),
            TaskRequest::Shutdown { result_ptr } => {
                self.shutdown(result_ptr);
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    fn open_stream(&mut self, result_ptr: u32, request: HttpRequest) {
        let stream_id = self.next_stream_id;
        self.next_stream_id = if stream_id >= MAX_STREAM_ID {
            FIRST_STREAM_ID
        } else {
            stream_id + 1
        };
        tracing::debug!(stream_id, url = %request.url, method = %request.method, "open stream");

        let (abort, registration) = AbortHandle::new_pair();
        self.host.streams.borrow_mut().insert(
            stream_id,
            StreamEntry {
                state: StreamState::new(),
                abort,
                opening: Some(result_ptr),
            },
        );
        let host = self.host.clone();
        let fetch = self.fetcher.fetch(request);
        let task = async move {
            match fetch.await {
                Ok(response) if response.is_ok() => {
                    let Some(result_ptr) = host.take_opening(stream_id) else {
                        return;
                    };
                    host.signal(result_ptr, stream_id as i32);
                    host.pump(stream_id, response.body).await;
                }
                Ok(response) => {
                    tracing::warn!(
                        stream_id,
                        status = response.status,
                        "fetch returned an error status"
                    );
                    host.fail_open(stream_id);
                }
                Err(err) => {
                    tracing::warn!(stream_id, "fetch failed: {err}");
                    host.fail_open(stream_id);
                }
            }
        };
        if let Err(err) = self.spawn_task(Abortable::new(task, registration)) {
            tracing::error!("failed to spawn stream {stream_id}: {err}");
            self.host.fail_open(stream_id);
        }
    }

    fn spawn_task<T: Future + 'static>(&self, task: T) -> Result<(), SpawnError> {
        let outstanding = Outstanding::new(&self.outstanding);
        self.spawner.spawn_local(async move {
            let _outstanding = outstanding;
            task.await;
        })
    }

    fn read_stream(&mut self, stream_id: u32, request: ReadRequest) {
        let begun = self.host.with_stream(stream_id, |state| state.begin_read(request));
        match begun {
            None => self.host.signal(request.result_ptr, RESULT_UNKNOWN_STREAM),
            Some(Err(refused)) => {
                tracing::debug!(stream_id, "read refused, another is pending");
                self.host
                    .signal(refused.result_ptr, RESULT_MULTIPLE_PENDING_READS);
            }
            Some(Ok(())) => self.host.complete_read(stream_id),
        }
    }

    fn close_stream(&mut self, result_ptr: u32, stream_id: u32) {
        let removed = self.host.streams.borrow_mut().remove(&stream_id);
        let Some(mut entry) = removed else {
            self.host.signal(result_ptr, RESULT_UNKNOWN_STREAM);
            return;
        };
        tracing::debug!(stream_id, "close stream");
        entry.abort.abort();
        if let Some(opening) = entry.opening {
            self.host.signal(opening, RESULT_IO_ERROR);
        }
        if let Some(pending) = entry.state.take_pending() {
            self.host.signal(pending.result_ptr, RESULT_UNKNOWN_STREAM);
        }
        self.host.signal(result_ptr, 0);
    }

    fn shutdown(&mut self, result_ptr: u32) {
        self.abandon_streams();
        self.host.signal(result_ptr, 0);
    }

    /// Aborts every stream and fails whoever still waits on one.
    fn abandon_streams(&mut self) {
        let streams: Vec<_> = self.host.streams.borrow_mut().drain().collect();
        if !streams.is_empty() {
            tracing::debug!(open = streams.len(), "abandoning streams");
        }
        for (_, mut entry) in streams {
            entry.abort.abort();
            if let Some(opening) = entry.opening {
                self.host.signal(opening, RESULT_IO_ERROR);
            }
            if let Some(pending) = entry.state.take_pending() {
                self.host.signal(pending.result_ptr, RESULT_IO_ERROR);
            }
        }
    }
}

/// A running broker thread.
pub struct BrokerHandle {
    thread: Option<JoinHandle<()>>,
    client: TaskClient,
}

impl BrokerHandle {
    /// A client for compute threads. Clone freely.
    pub fn client(&self) -> TaskClient {
        self.client.clone()
    }

    /// Asks the broker to stop and waits for its thread.
    pub fn shutdown(mut self) -> BrokerResult<()> {
        self.client.shutdown()?;
        self.join_thread()
    }

    /// Waits for the broker thread, which only ends after a shutdown request.
    pub fn join(mut self) -> BrokerResult<()> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> BrokerResult<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| BrokerError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        let Some(thread) = self.thread.as_ref() else {
            return;
        };
        if !thread.is_finished() && !self.client.is_shut_down() {
            if let Err(err) = self.client.shutdown() {
                tracing::warn!("broker shutdown on drop failed: {err}");
            }
        }
        if let Err(err) = self.join_thread() {
            tracing::error!("{err}");
        }
    }
}
