//! In-process topic broker.
//!
//! A complete [`Transport`] living entirely inside the process: topic
//! bindings with real `*`/`#` matching, private reply queues, idempotent
//! cancellation. This is the standalone and test backend; no external broker
//! required.
//!
//! `close()` severs the simulated connection: consumers see end-of-stream
//! and every later call fails with [`TransportError::Connection`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::topic::topic_matches;
use super::{
    Consumer, ConsumerTag, Delivery, ReplyAddress, Transport, TransportError, DELIVERY_BUFFER,
};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    closed: bool,
    bindings: HashMap<ConsumerTag, Binding>,
    reply_queues: HashMap<ReplyAddress, mpsc::Sender<Delivery>>,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    pattern: String,
    deliveries: mpsc::Sender<Delivery>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sever the connection. Every binding and reply queue is dropped, so
    /// live consumers observe end-of-stream; later calls fail with
    /// [`TransportError::Connection`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.bindings.clear();
        state.reply_queues.clear();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of live pattern bindings. Test observability.
    pub async fn binding_count(&self) -> usize {
        self.state.lock().await.bindings.len()
    }

    /// Number of open reply queues. Test observability.
    pub async fn reply_queue_count(&self) -> usize {
        self.state.lock().await.reply_queues.len()
    }

    fn closed_err() -> TransportError {
        TransportError::Connection("Transport is closed".to_string())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        reply_to: Option<ReplyAddress>,
    ) -> Result<(), TransportError> {
        // Snapshot matching senders, then deliver without holding the lock.
        let targets: Vec<(ConsumerTag, mpsc::Sender<Delivery>)> = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(Self::closed_err());
            }
            state
                .bindings
                .iter()
                .filter(|(_, binding)| {
                    binding.exchange == exchange && topic_matches(&binding.pattern, routing_key)
                })
                .map(|(tag, binding)| (tag.clone(), binding.deliveries.clone()))
                .collect()
        };

        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            payload,
            reply_to,
        };

        let mut dropped = Vec::new();
        for (tag, sender) in targets {
            if sender.send(delivery.clone()).await.is_err() {
                dropped.push(tag);
            }
        }

        // A failed send means the consumer was dropped without cancelling;
        // prune its binding like a broker auto-deleting an orphaned queue.
        if !dropped.is_empty() {
            let mut state = self.state.lock().await;
            for tag in dropped {
                debug!(consumer = %tag, "Pruning dropped consumer");
                state.bindings.remove(&tag);
            }
        }

        Ok(())
    }

    async fn consume(&self, exchange: &str, pattern: &str) -> Result<Consumer, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Self::closed_err());
        }

        let tag = ConsumerTag::unique();
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        state.bindings.insert(
            tag.clone(),
            Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                deliveries: tx,
            },
        );
        Ok(Consumer::new(tag, rx))
    }

    async fn reply_queue(&self) -> Result<Consumer, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Self::closed_err());
        }

        let address = ReplyAddress::new(format!("reply.{}", uuid::Uuid::new_v4()));
        let tag = ConsumerTag::new(address.as_str());
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        state.reply_queues.insert(address.clone(), tx);
        Ok(Consumer::for_reply_queue(tag, address, rx))
    }

    async fn send_reply(&self, to: &ReplyAddress, payload: Bytes) -> Result<(), TransportError> {
        let sender = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(Self::closed_err());
            }
            state.reply_queues.get(to).cloned()
        };

        match sender {
            Some(sender) => {
                let delivery = Delivery {
                    routing_key: to.as_str().to_string(),
                    payload,
                    reply_to: None,
                };
                if sender.send(delivery).await.is_err() {
                    debug!(reply_to = %to, "Reply queue consumer gone, dropping reply");
                }
            }
            // Late reply after the requester tore its queue down.
            None => debug!(reply_to = %to, "Unknown reply queue, dropping reply"),
        }
        Ok(())
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.bindings.remove(tag);
        state.reply_queues.remove(&ReplyAddress::new(tag.as_str()));
        Ok(())
    }
}
