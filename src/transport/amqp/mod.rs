//! AMQP (RabbitMQ) transport.
//!
//! Maps the transport contract onto broker primitives: topic exchanges,
//! server-named exclusive queues for pattern bindings and reply queues, the
//! `reply_to` message property for reply addressing, and the default
//! exchange for direct-to-queue replies.
//!
//! Deliberately no reconnect or publish retry: connection trouble surfaces
//! as [`TransportError`] and retry policy stays with the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{
    Consumer, ConsumerTag, Delivery, ReplyAddress, Transport, TransportError, DELIVERY_BUFFER,
};
use crate::config::AmqpSettings;

/// One live broker consumer: the channel it runs on plus the task pumping
/// broker deliveries into the local buffer.
struct ConsumerEntry {
    channel: Channel,
    forwarder: JoinHandle<()>,
}

pub struct AmqpTransport {
    pool: Pool,
    /// Exchanges declared this session; declaration is idempotent but one
    /// round trip per publish would be wasteful.
    declared: Arc<RwLock<HashSet<String>>>,
    consumers: Arc<Mutex<HashMap<ConsumerTag, ConsumerEntry>>>,
}

impl AmqpTransport {
    /// Connect to the broker and verify the connection.
    pub async fn new(settings: &AmqpSettings) -> Result<Self, TransportError> {
        let manager = Manager::new(settings.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create pool: {e}")))?;

        // Fail now, not on first use.
        pool.get()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect: {e}")))?;

        info!(url = %settings.url, "Connected to AMQP broker");

        Ok(Self {
            pool,
            declared: Arc::new(RwLock::new(HashSet::new())),
            consumers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            TransportError::Connection(format!("Failed to get connection from pool: {e}"))
        })?;
        conn.create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {e}")))
    }

    async fn ensure_exchange(
        &self,
        channel: &Channel,
        exchange: &str,
    ) -> Result<(), TransportError> {
        {
            let declared = self.declared.read().await;
            if declared.contains(exchange) {
                return Ok(());
            }
        }

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to declare exchange '{exchange}': {e}"))
            })?;

        self.declared.write().await.insert(exchange.to_string());
        Ok(())
    }

    /// Declare a server-named exclusive queue and start consuming it under
    /// `tag`, pumping deliveries into a local buffer.
    async fn consume_queue(
        &self,
        channel: Channel,
        queue: &str,
        tag: ConsumerTag,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let mut broker_consumer = channel
            .basic_consume(
                queue,
                tag.as_str(),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to start consumer: {e}")))?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let task_tag = tag.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = broker_consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if tx.send(map_delivery(delivery)).await.is_err() {
                            // Local consumer dropped without cancelling.
                            break;
                        }
                    }
                    Err(e) => {
                        error!(consumer = %task_tag, error = %e, "Consumer stream error");
                        break;
                    }
                }
            }
            debug!(consumer = %task_tag, "Consumer stream ended");
        });

        self.consumers
            .lock()
            .await
            .insert(tag, ConsumerEntry { channel, forwarder });
        Ok(rx)
    }
}

/// Map a broker delivery onto the transport contract.
fn map_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|queue| ReplyAddress::new(queue.as_str()));
    Delivery {
        routing_key: delivery.routing_key.as_str().to_string(),
        payload: Bytes::from(delivery.data),
        reply_to,
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        reply_to: Option<ReplyAddress>,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;
        self.ensure_exchange(&channel, exchange).await?;

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(reply_to) = &reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {e}")))?;
        confirm
            .await
            .map_err(|e| TransportError::Publish(format!("Publish confirmation failed: {e}")))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published");
        Ok(())
    }

    async fn consume(&self, exchange: &str, pattern: &str) -> Result<Consumer, TransportError> {
        let channel = self.channel().await?;
        self.ensure_exchange(&channel, exchange).await?;

        // Server-named exclusive queue per consumer, auto-deleted with it.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to declare queue: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to bind queue: {e}")))?;

        debug!(queue = %queue_name, exchange = %exchange, pattern = %pattern, "Bound queue");

        let tag = ConsumerTag::unique();
        let rx = self.consume_queue(channel, &queue_name, tag.clone()).await?;
        Ok(Consumer::new(tag, rx))
    }

    async fn reply_queue(&self) -> Result<Consumer, TransportError> {
        let channel = self.channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to declare reply queue: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        let tag = ConsumerTag::new(&queue_name);
        let rx = self.consume_queue(channel, &queue_name, tag.clone()).await?;
        Ok(Consumer::for_reply_queue(
            tag,
            ReplyAddress::new(queue_name),
            rx,
        ))
    }

    async fn send_reply(&self, to: &ReplyAddress, payload: Bytes) -> Result<(), TransportError> {
        // Default exchange routes straight to the named queue. A deleted
        // reply queue drops the message, which is the contract.
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                to.as_str(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to send reply: {e}")))?;
        confirm
            .await
            .map_err(|e| TransportError::Publish(format!("Reply confirmation failed: {e}")))?;
        Ok(())
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), TransportError> {
        let entry = self.consumers.lock().await.remove(tag);
        let Some(entry) = entry else {
            return Ok(());
        };

        let result = entry
            .channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Cancel(format!("Failed to cancel consumer: {e}")));
        entry.forwarder.abort();
        result
    }
}
