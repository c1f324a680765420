use std::fmt::Debug;
use std::hash::Hash;

use zerde::BufferDescriptor;

/// Closed set of request kinds understood by one protocol.
///
/// Names only matter at the JSON boundary; dispatch is keyed by the enum.
pub trait Topic: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self>;
}

/// Ties a topic enum to the payload type carried by requests and responses.
pub trait Protocol: Send + Sync + 'static {
    type Topic: Topic;
    type Data: Debug + Send + 'static;
}

/// Request or response body plus the buffers moving along with it.
pub struct Payload<P: Protocol> {
    pub data: Option<P::Data>,
    pub transfer: Vec<BufferDescriptor>,
}

impl<P: Protocol> Payload<P> {
    pub fn new(data: P::Data) -> Self {
        Self {
            data: Some(data),
            transfer: Vec::new(),
        }
    }

    /// A body-less payload (a bare acknowledgement).
    pub fn empty() -> Self {
        Self {
            data: None,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(mut self, descriptor: BufferDescriptor) -> Self {
        self.transfer.push(descriptor);
        self
    }

    pub fn into_data(self) -> Option<P::Data> {
        self.data
    }
}

impl<P: Protocol> Debug for Payload<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("data", &self.data)
            .field("transfer", &self.transfer)
            .finish()
    }
}

impl<P: Protocol> Default for Payload<P> {
    fn default() -> Self {
        Self::empty()
    }
}
