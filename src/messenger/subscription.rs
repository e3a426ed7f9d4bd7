//! Live consumer handle.
//!
//! A [`Subscription`] owns one transport consumer. User subscriptions run a
//! dispatch task that decodes deliveries, applies the optional payload
//! schema, and invokes the handler one delivery at a time, so callbacks for
//! one subscription never interleave. The request coordinator uses the same
//! type for its ephemeral reply queues, just without a dispatch task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::envelope::Envelope;
use super::{DeliveryHandler, MessengerError};
use crate::payload::PayloadSchema;
use crate::transport::{Consumer, ConsumerTag, Delivery, Transport};

struct SubscriptionInner {
    tag: ConsumerTag,
    exchange: String,
    pattern: String,
    transport: Arc<dyn Transport>,
    disposed: AtomicBool,
    shutdown: Notify,
}

/// Handle to a bound consumer. Dispose to unbind; dropping without
/// disposing aborts dispatch and leaves the unbind to the transport's
/// orphan cleanup.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Start dispatching `consumer` to `handler`.
    pub(crate) fn spawn(
        consumer: Consumer,
        exchange: &str,
        pattern: &str,
        transport: Arc<dyn Transport>,
        handler: Box<dyn DeliveryHandler>,
        expect: Option<PayloadSchema>,
    ) -> Self {
        let inner = Arc::new(SubscriptionInner {
            tag: consumer.tag().clone(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            transport: transport.clone(),
            disposed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let task = tokio::spawn(dispatch_loop(
            consumer,
            inner.clone(),
            handler,
            expect,
            transport,
        ));

        Self {
            inner,
            task: Some(task),
        }
    }

    /// Wrap a reply-queue consumer tag. No dispatch task: the request
    /// coordinator reads the consumer itself.
    pub(crate) fn for_reply(tag: ConsumerTag, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(SubscriptionInner {
            exchange: String::new(),
            pattern: tag.as_str().to_string(),
            tag,
            transport,
            disposed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        Self { inner, task: None }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn pattern(&self) -> &str {
        &self.inner.pattern
    }

    pub fn tag(&self) -> &ConsumerTag {
        &self.inner.tag
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Unbind the consumer. Idempotent: the first call cancels the
    /// transport consumer, every later call returns `Ok(())` untouched.
    pub async fn dispose(&self) -> Result<(), MessengerError> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wake the dispatch loop; it also exits on its own once the cancel
        // below ends the delivery stream.
        self.inner.shutdown.notify_waiters();
        self.inner.transport.cancel(&self.inner.tag).await?;
        debug!(
            consumer = %self.inner.tag,
            exchange = %self.inner.exchange,
            pattern = %self.inner.pattern,
            "Subscription disposed"
        );
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("tag", &self.inner.tag)
            .field("exchange", &self.inner.exchange)
            .field("pattern", &self.inner.pattern)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Sequential dispatch: one delivery fully handled before the next is read.
async fn dispatch_loop(
    mut consumer: Consumer,
    inner: Arc<SubscriptionInner>,
    handler: Box<dyn DeliveryHandler>,
    expect: Option<PayloadSchema>,
    transport: Arc<dyn Transport>,
) {
    loop {
        if inner.disposed.load(Ordering::SeqCst) {
            break;
        }
        let delivery = tokio::select! {
            biased;
            _ = inner.shutdown.notified() => continue,
            delivery = consumer.next() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        handle_delivery(delivery, handler.as_ref(), expect.as_ref(), &transport).await;
    }
    debug!(consumer = %inner.tag, "Dispatch loop ended");
}

async fn handle_delivery(
    delivery: Delivery,
    handler: &dyn DeliveryHandler,
    expect: Option<&PayloadSchema>,
    transport: &Arc<dyn Transport>,
) {
    let payload: Value = match serde_json::from_slice(&delivery.payload) {
        Ok(value) => value,
        Err(e) => {
            error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Dropping undecodable delivery"
            );
            return;
        }
    };

    let envelope = Envelope::new(delivery.routing_key, delivery.reply_to, transport.clone());

    // Schema rejection answers the sender without ever invoking the handler.
    if let Some(schema) = expect {
        if let Err(validation) = schema.check(&payload) {
            warn!(
                schema = %schema.name(),
                routing_key = %envelope.routing_key(),
                "Delivery failed schema check, rejecting"
            );
            if let Err(e) = envelope.reject(validation.into()).await {
                error!(error = %e, "Failed to send schema rejection");
            }
            return;
        }
    }

    if let Err(e) = handler.handle(payload, envelope).await {
        error!(error = %e, "Handler failed");
    }
}
