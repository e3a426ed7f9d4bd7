//! Broker transport seam.
//!
//! The messenger core is broker-agnostic: it publishes, consumes, and
//! answers through a [`Transport`] trait object. Implementations own the
//! connection-level concerns (sockets, channels, acks); nothing on this
//! stack retries, so transport failures surface to callers as-is.
//!
//! Backends:
//! - `memory` (default feature): in-process topic broker for standalone use
//!   and tests
//! - `amqp` (feature): RabbitMQ via lapin

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod topic;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "memory")]
pub mod memory;

/// Per-consumer delivery buffer. Publishing to a consumer whose buffer is
/// full waits; a dropped consumer fails the send and unbinds it.
pub const DELIVERY_BUFFER: usize = 1024;

/// Errors from the broker boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Cancel failed: {0}")]
    Cancel(String),
}

/// Identifies one live consumer on a transport, for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Fresh collision-free tag.
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque address of a private reply queue, carried in delivery metadata so
/// a responder can answer without knowing the requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyAddress(String);

impl ReplyAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message handed over by the transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing key the publisher used.
    pub routing_key: String,
    /// Raw payload bytes (JSON on this stack).
    pub payload: Bytes,
    /// Where to send a reply, when the publisher expects one.
    pub reply_to: Option<ReplyAddress>,
}

/// Ordered stream of deliveries for one consumer.
///
/// `next` yields in the order the transport handed messages over and returns
/// `None` once the transport side is gone (cancelled or closed).
pub struct Consumer {
    tag: ConsumerTag,
    reply_address: Option<ReplyAddress>,
    deliveries: mpsc::Receiver<Delivery>,
}

impl Consumer {
    /// Consumer for a pattern binding.
    pub fn new(tag: ConsumerTag, deliveries: mpsc::Receiver<Delivery>) -> Self {
        Self {
            tag,
            reply_address: None,
            deliveries,
        }
    }

    /// Consumer attached to a private reply queue.
    pub fn for_reply_queue(
        tag: ConsumerTag,
        address: ReplyAddress,
        deliveries: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            tag,
            reply_address: Some(address),
            deliveries,
        }
    }

    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    /// The queue address replies should target. `Some` only for consumers
    /// created by [`Transport::reply_queue`].
    pub fn reply_address(&self) -> Option<&ReplyAddress> {
        self.reply_address.as_ref()
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("reply_address", &self.reply_address)
            .finish()
    }
}

/// Broker abstraction the messenger runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `payload` to the broker on `exchange` under `routing_key`.
    /// Resolves on broker acceptance, never waits for consumers.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        reply_to: Option<ReplyAddress>,
    ) -> Result<(), TransportError>;

    /// Bind an anonymous queue to `exchange` with a topic `pattern` and
    /// start consuming it.
    async fn consume(&self, exchange: &str, pattern: &str) -> Result<Consumer, TransportError>;

    /// Open a private, uniquely named reply queue and consume it. The
    /// returned consumer carries the queue's [`ReplyAddress`].
    async fn reply_queue(&self) -> Result<Consumer, TransportError>;

    /// Deliver `payload` straight to a reply queue. Replies to a queue that
    /// no longer exists are dropped silently, matching broker behavior for
    /// deleted exclusive queues.
    async fn send_reply(&self, to: &ReplyAddress, payload: Bytes) -> Result<(), TransportError>;

    /// Stop the consumer identified by `tag` and drop its binding.
    /// Idempotent: cancelling an unknown tag is not an error.
    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), TransportError>;
}
