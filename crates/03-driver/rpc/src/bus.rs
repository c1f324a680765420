//! Request/response bus over any [`Channel`].
//!
//! Both ends run the same bus: each can `send` requests and `receive` them.
//! Responses are matched to callers by id, so handlers may finish in any
//! order; handlers themselves start in arrival order.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::envelope::{Envelope, Message};
use crate::protocol::{Payload, Protocol, Topic};
use crate::{RemoteError, RpcError, RpcResult};

type HandlerFuture<P> = BoxFuture<'static, anyhow::Result<Payload<P>>>;
type Handler<P> = Arc<dyn Fn(Payload<P>) -> HandlerFuture<P> + Send + Sync>;
type PendingCall<P> = oneshot::Sender<RpcResult<Payload<P>>>;

struct BusInner<P: Protocol> {
    channel: Arc<dyn Channel<P>>,
    inbound: Mutex<Option<BoxStream<'static, Envelope<P>>>>,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingCall<P>>>,
    handlers: Mutex<HashMap<P::Topic, Handler<P>>>,
}

/// One side of an RPC connection. Cheap to clone.
pub struct Bus<P: Protocol> {
    inner: Arc<BusInner<P>>,
}

impl<P: Protocol> Clone for Bus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Protocol> Bus<P> {
    /// Binds a bus to `channel`. A channel serves exactly one bus.
    pub fn bind<C: Channel<P>>(channel: C) -> RpcResult<Self> {
        Self::bind_shared(Arc::new(channel))
    }

    pub fn bind_shared(channel: Arc<dyn Channel<P>>) -> RpcResult<Self> {
        let inbound = channel.take_inbound().ok_or(RpcError::AlreadyBound)?;
        Ok(Self {
            inner: Arc::new(BusInner {
                channel,
                inbound: Mutex::new(Some(inbound)),
                next_id: AtomicU32::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Calls across the channel. Resolves with the handler's payload, or fails
    /// with [`RpcError::Remote`] when the handler failed (or was missing).
    ///
    /// A post failure is logged, not returned; the call then resolves with
    /// [`RpcError::ChannelClosed`].
    pub fn send(
        &self,
        topic: P::Topic,
        payload: Payload<P>,
    ) -> impl Future<Output = RpcResult<Payload<P>>> + Send + 'static {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if self.inner.pending.lock().insert(id, tx).is_some() {
            tracing::warn!(
                "request id {id} wrapped onto a call still pending; dropping the older call"
            );
        }
        tracing::trace!(id, topic = topic.name(), "send");
        if let Err(err) = self.inner.channel.post(Envelope::request(topic, id, payload)) {
            tracing::warn!("failed to post {} request {id}: {err}", topic.name());
            if let Some(call) = self.inner.pending.lock().remove(&id) {
                let _ = call.send(Err(RpcError::ChannelClosed));
            }
        }
        async move { rx.await.unwrap_or(Err(RpcError::ChannelClosed)) }
    }

    /// Registers the handler for `topic`. A second registration fails and
    /// leaves the first one active.
    pub fn receive<F, Fut>(&self, topic: P::Topic, handler: F) -> RpcResult<()>
    where
        F: Fn(Payload<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload<P>>> + Send + 'static,
    {
        match self.inner.handlers.lock().entry(topic) {
            Entry::Occupied(_) => Err(RpcError::DuplicateHandler {
                topic: topic.name(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(move |payload| handler(payload).boxed()));
                Ok(())
            }
        }
    }

    /// Answers a request whose topic name did not decode, as returned in
    /// [`RpcError::UnknownTopic`] by [`crate::Envelope::from_json`].
    pub fn reject_unknown(&self, name: &str, id: u32) {
        self.respond(id, Err(RemoteError::handler_not_found(name)));
    }

    /// Pumps the inbound side until it closes.
    ///
    /// Requests start their handler immediately, in arrival order; handler
    /// futures run concurrently inside this future. Once inbound closes, the
    /// running handlers are finished and every call still waiting for a
    /// response is rejected with [`RpcError::ChannelClosed`].
    pub async fn serve(&self) -> RpcResult<()> {
        let inbound = self
            .inner
            .inbound
            .lock()
            .take()
            .ok_or(RpcError::AlreadyServing)?;
        let mut inbound = inbound.fuse();
        let mut in_flight = FuturesUnordered::new();

        loop {
            futures::select! {
                envelope = inbound.next() => match envelope {
                    Some(envelope) => {
                        if let Some(task) = self.dispatch(envelope) {
                            in_flight.push(task);
                        }
                    }
                    None => break,
                },
                () = in_flight.select_next_some() => {}
            }
        }
        while in_flight.next().await.is_some() {}

        let abandoned: Vec<_> = self.inner.pending.lock().drain().collect();
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "channel closed with calls pending");
        }
        for (_, call) in abandoned {
            let _ = call.send(Err(RpcError::ChannelClosed));
        }
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope<P>) -> Option<BoxFuture<'static, ()>> {
        match envelope.message {
            Message::Response { id, result } => {
                let call = self.inner.pending.lock().remove(&id);
                let Some(call) = call else {
                    tracing::warn!("response {id} matches no pending call");
                    return None;
                };
                let result = result
                    .map(|data| Payload {
                        data,
                        transfer: envelope.transfer,
                    })
                    .map_err(RpcError::Remote);
                // The caller may have dropped its future.
                let _ = call.send(result);
                None
            }
            Message::Request { topic, id, data } => {
                let handler = self.inner.handlers.lock().get(&topic).cloned();
                let Some(handler) = handler else {
                    tracing::debug!(id, topic = topic.name(), "no handler");
                    self.respond(id, Err(RemoteError::handler_not_found(topic.name())));
                    return None;
                };
                let payload = Payload {
                    data,
                    transfer: envelope.transfer,
                };
                let started = catch_unwind(AssertUnwindSafe(|| handler(payload)));
                let bus = self.clone();
                Some(
                    async move {
                        let outcome = match started {
                            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                            Err(panic) => Err(panic),
                        };
                        let result = match outcome {
                            Ok(Ok(payload)) => Ok(payload),
                            Ok(Err(err)) => Err(RemoteError::from_anyhow(&err)),
                            Err(panic) => {
                                tracing::error!("handler for {} panicked", topic.name());
                                Err(RemoteError::from_panic(&*panic))
                            }
                        };
                        bus.respond(id, result);
                    }
                    .boxed(),
                )
            }
        }
    }

    fn respond(&self, id: u32, result: Result<Payload<P>, RemoteError>) {
        if let Err(err) = self.inner.channel.post(Envelope::response(id, result)) {
            tracing::warn!("failed to post response {id}: {err}");
        }
    }

    /// Closes the outbound side. The peer's `serve` ends once it has drained
    /// everything already posted.
    pub fn close(&self) {
        self.inner.channel.close();
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
