//! Message queue abstraction
//!
//! Deliveries must be acknowledged exactly once; [`Delivery::ack`] consumes the
//! delivery so a second acknowledgement cannot be expressed.

use async_trait::async_trait;

use crate::errors::WorkerError;

/// Queue carrying deployment job messages
pub const APP_DEPLOY_QUEUE: &str = "application.deploy";

/// Publishes payloads to a named queue
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), WorkerError>;
}

/// Acknowledges one delivered message to the broker
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), WorkerError>;
}

/// A message received from a queue together with its acknowledgement handle
pub struct Delivery {
    payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self { payload, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) -> Result<(), WorkerError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries from a consumed queue
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the subscription is closed
    async fn next_delivery(&mut self) -> Option<Delivery>;
}
