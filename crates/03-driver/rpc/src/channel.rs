use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::protocol::Protocol;
use crate::{RpcError, RpcResult};

/// One end of a bidirectional message channel.
pub trait Channel<P: Protocol>: Send + Sync + 'static {
    /// Sends an envelope to the other end.
    fn post(&self, envelope: Envelope<P>) -> RpcResult<()>;

    /// Hands out the inbound side. Only the first caller gets it.
    fn take_inbound(&self) -> Option<BoxStream<'static, Envelope<P>>>;

    /// Stops outbound traffic; the other end's inbound side ends once drained.
    fn close(&self);
}

/// In-process channel end; see [`linked_pair`].
pub struct ChannelPort<P: Protocol> {
    outbound: mpsc::UnboundedSender<Envelope<P>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Envelope<P>>>>,
}

/// Two connected ends: whatever one posts, the other receives, in order.
pub fn linked_pair<P: Protocol>() -> (ChannelPort<P>, ChannelPort<P>) {
    let (to_remote, from_local) = mpsc::unbounded();
    let (to_local, from_remote) = mpsc::unbounded();
    let local = ChannelPort {
        outbound: to_remote,
        inbound: Mutex::new(Some(from_remote)),
    };
    let remote = ChannelPort {
        outbound: to_local,
        inbound: Mutex::new(Some(from_local)),
    };
    (local, remote)
}

impl<P: Protocol> Channel<P> for ChannelPort<P> {
    fn post(&self, envelope: Envelope<P>) -> RpcResult<()> {
        self.outbound
            .unbounded_send(envelope)
            .map_err(|_| RpcError::ChannelClosed)
    }

    fn take_inbound(&self) -> Option<BoxStream<'static, Envelope<P>>> {
        self.inbound.lock().take().map(StreamExt::boxed)
    }

    fn close(&self) {
        self.outbound.close_channel();
    }
}
