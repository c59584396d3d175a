//! Broker connection layer.
//!
//! This module contains:
//! - `Broker` trait: durable subscribe/unsubscribe/publish primitives
//! - `MessageHandler` trait: per-message delivery callback
//! - Implementations: NATS JetStream, in-memory
//!
//! Acknowledgment is driven by the handler's returned [`Disposition`]: the
//! broker acks only when the handler reports a terminal outcome, so an
//! unacknowledged message is redelivered after a crash (at-least-once).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
///
/// `Connection` is fatal to the whole dispatcher until reconnection
/// succeeds; `Subscribe` is isolated to a single subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// A message delivered from the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Correlation identifier, taken from the broker message id when
    /// present, else generated at receipt.
    pub correlation_id: String,
}

/// What to do with a message after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal outcome reached, remove the message from the broker.
    Ack,
    /// Not terminal, leave unacked so the broker redelivers.
    Redeliver,
}

/// Handler invoked for each message delivered on a subscription.
///
/// Multiple messages may be in flight concurrently; a handler must not
/// assume ordering across messages, only that a single message runs to its
/// returned disposition before acknowledgment.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: BrokerMessage) -> BoxFuture<'static, Disposition>;
}

/// Identifies one live broker subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    durable_name: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(durable_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            durable_name: durable_name.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }
}

/// Durable pub/sub broker.
///
/// One connection is shared across all channels; implementations guard
/// reconnection internally so callers never race on the connection handle.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a durable subscription on `subject`.
    ///
    /// The durable name is stable across restarts so the broker resumes
    /// delivery from the last acknowledged position. The handler is called
    /// for every delivered message; its [`Disposition`] decides the ack.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        durable_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle>;

    /// Close a subscription. Idempotent: closing an already-closed handle
    /// is a no-op.
    ///
    /// With `forget_durable` the broker-side durable state is deleted as
    /// well; without it the delivery position is kept so a later subscribe
    /// under the same durable name resumes.
    async fn unsubscribe(&self, handle: &SubscriptionHandle, forget_durable: bool) -> Result<()>;

    /// Publish a payload to a subject. Used for reply and dead-letter
    /// forwarding onto broker subjects.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}
