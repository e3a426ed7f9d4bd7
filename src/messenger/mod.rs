//! Structured messaging over a topic exchange transport.
//!
//! [`Messenger`] is the single entry point: it checks exchange names
//! against an immutable [`ExchangeRegistry`] before touching the broker,
//! publishes JSON payloads with optional webhook mirroring, dispatches
//! subscriptions in delivery order, and emulates request/reply over
//! ephemeral reply queues.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use courier::config::{CourierConfig, SharedSettings};
//! use courier::messenger::{handler_fn, Messenger};
//! use courier::transport::memory::MemoryTransport;
//!
//! let config = CourierConfig::load(None)?;
//! let messenger = Messenger::new(
//!     Arc::new(MemoryTransport::new()),
//!     config.registry(),
//!     SharedSettings::new(config.messenger.clone()),
//! )?;
//!
//! // Serve requests on "node.fetch".
//! let subscription = messenger
//!     .subscribe(
//!         "graph",
//!         "node.fetch",
//!         handler_fn(|payload, envelope| async move {
//!             envelope.resolve(payload).await
//!         }),
//!     )
//!     .await?;
//!
//! // Call and await the reply.
//! let reply = messenger.request("graph", "node.fetch", &query).await?;
//!
//! subscription.dispose().await?;
//! ```

mod envelope;
mod request;
mod subscription;
mod webhook;


pub use envelope::Envelope;
pub use request::{CancelToken, RequestOptions};
pub use subscription::Subscription;
pub use webhook::{HttpWebhookSink, WebhookError, WebhookMirror, WebhookSink};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::SharedSettings;
use crate::payload::{ErrorEvent, PayloadSchema, Publishable, ValidationError};
use crate::registry::{ExchangeDef, ExchangeRegistry, RoutingSyntax};
use crate::transport::{Transport, TransportError};

/// Errors surfaced by messenger operations.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    /// Exchange name is absent from the registry.
    #[error("Exchange '{0}' is not registered")]
    ExchangeNotFound(String),

    /// A payload or reply failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No reply arrived before the deadline.
    #[error("Request timed out after {timeout:?}")]
    RequestTimedOut { timeout: Duration },

    /// The caller abandoned the request.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The responder rejected the request.
    #[error("Request rejected by responder: {0}")]
    Remote(ErrorEvent),

    /// Broker communication failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload could not be encoded as JSON.
    #[error("JSON encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Webhook sink could not be constructed.
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Handler invoked for each delivery a subscription receives.
pub trait DeliveryHandler: Send + Sync {
    /// Process one decoded payload. The envelope carries the reply path
    /// for request deliveries.
    fn handle(
        &self,
        payload: Value,
        envelope: Envelope,
    ) -> BoxFuture<'static, Result<(), MessengerError>>;
}

/// [`DeliveryHandler`] built from an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Value, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessengerError>> + Send + 'static,
{
    fn handle(
        &self,
        payload: Value,
        envelope: Envelope,
    ) -> BoxFuture<'static, Result<(), MessengerError>> {
        Box::pin((self.f)(payload, envelope))
    }
}

/// Wrap an async closure as a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessengerError>> + Send + 'static,
{
    FnHandler { f }
}

/// Per-publish knobs.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Mirror the published body to the configured webhook targets.
    pub mirror_to_webhooks: bool,
}

impl PublishOptions {
    /// Options with webhook mirroring enabled.
    pub fn mirrored() -> Self {
        Self {
            mirror_to_webhooks: true,
        }
    }
}

/// Entry point for publish, subscribe and request/reply.
///
/// Cloning is cheap; clones share the transport, registry and settings.
#[derive(Clone)]
pub struct Messenger {
    transport: Arc<dyn Transport>,
    registry: Arc<ExchangeRegistry>,
    settings: SharedSettings,
    mirror: WebhookMirror,
}

impl Messenger {
    /// Build a messenger over `transport` with an HTTP webhook sink.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: ExchangeRegistry,
        settings: SharedSettings,
    ) -> Result<Self, MessengerError> {
        let sink = HttpWebhookSink::new()?;
        Ok(Self::with_webhook_sink(
            transport,
            registry,
            settings,
            Arc::new(sink),
        ))
    }

    /// Build a messenger with a caller-supplied webhook sink.
    pub fn with_webhook_sink(
        transport: Arc<dyn Transport>,
        registry: ExchangeRegistry,
        settings: SharedSettings,
        sink: Arc<dyn WebhookSink>,
    ) -> Self {
        Self {
            transport,
            registry: Arc::new(registry),
            settings,
            mirror: WebhookMirror::new(sink),
        }
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Publish a payload without mirroring.
    pub async fn publish<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
    ) -> Result<(), MessengerError>
    where
        P: Publishable,
    {
        self.publish_with(exchange, routing_key, payload, PublishOptions::default())
            .await
    }

    /// Publish a payload to a registered exchange.
    ///
    /// The exchange is checked and the payload validated before anything
    /// reaches the transport. With mirroring enabled the body is POSTed to
    /// the currently configured webhook targets in a detached task, so a
    /// slow or failing target cannot delay or fail the publish.
    #[tracing::instrument(
        name = "messenger.publish",
        skip_all,
        fields(%exchange, %routing_key)
    )]
    pub async fn publish_with<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
        options: PublishOptions,
    ) -> Result<(), MessengerError>
    where
        P: Publishable,
    {
        self.ensure_known(exchange)?;
        payload.validate()?;

        let value = serde_json::to_value(payload)?;
        let bytes = Bytes::from(serde_json::to_vec(&value)?);

        self.transport
            .publish(exchange, routing_key, bytes, None)
            .await?;

        if options.mirror_to_webhooks {
            let targets = self.settings.webhook_targets();
            if !targets.is_empty() {
                let mirror = self.mirror.clone();
                let key = routing_key.to_string();
                tokio::spawn(async move { mirror.dispatch(&key, &value, &targets).await });
            }
        }

        Ok(())
    }

    /// Subscribe a handler to a routing pattern.
    ///
    /// Patterns are exact routing keys or `#` segments matching any run of
    /// words. Deliveries are handed to `handler` one at a time in arrival
    /// order; a handler error is logged and the subscription keeps going.
    pub async fn subscribe<H>(
        &self,
        exchange: &str,
        pattern: &str,
        handler: H,
    ) -> Result<Subscription, MessengerError>
    where
        H: DeliveryHandler + 'static,
    {
        self.subscribe_inner(exchange, pattern, Box::new(handler), None)
            .await
    }

    /// Subscribe with a payload schema guard.
    ///
    /// Deliveries that fail `schema` are rejected back to the sender (when
    /// a reply path exists) without invoking `handler`.
    pub async fn subscribe_expecting<H>(
        &self,
        exchange: &str,
        pattern: &str,
        schema: PayloadSchema,
        handler: H,
    ) -> Result<Subscription, MessengerError>
    where
        H: DeliveryHandler + 'static,
    {
        self.subscribe_inner(exchange, pattern, Box::new(handler), Some(schema))
            .await
    }

    #[tracing::instrument(
        name = "messenger.subscribe",
        skip_all,
        fields(%exchange, %pattern)
    )]
    async fn subscribe_inner(
        &self,
        exchange: &str,
        pattern: &str,
        handler: Box<dyn DeliveryHandler>,
        expect: Option<PayloadSchema>,
    ) -> Result<Subscription, MessengerError> {
        let def = self.ensure_known(exchange)?;
        if def.syntax == RoutingSyntax::Direct && has_wildcards(pattern) {
            return Err(MessengerError::Validation(ValidationError::new(format!(
                "exchange '{exchange}' routes direct, pattern '{pattern}' uses wildcards"
            ))));
        }

        let consumer = self.transport.consume(exchange, pattern).await?;
        info!(consumer = %consumer.tag(), "Subscribed");

        Ok(Subscription::spawn(
            consumer,
            exchange,
            pattern,
            self.transport.clone(),
            handler,
            expect,
        ))
    }

    /// Send a request and await its reply with default options.
    pub async fn request<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
    ) -> Result<Value, MessengerError>
    where
        P: Publishable,
    {
        self.request_with(exchange, routing_key, payload, RequestOptions::default())
            .await
    }

    /// Send a request and await its reply.
    ///
    /// A fresh reply queue is consumed before the request is published, so
    /// even an immediate reply cannot be lost. The reply races the deadline
    /// and the optional cancel token in a detached task; whichever settles
    /// the request, the reply queue is torn down first, exactly once, and
    /// teardown still runs when the caller drops this future early.
    #[tracing::instrument(
        name = "messenger.request",
        skip_all,
        fields(%exchange, %routing_key)
    )]
    pub async fn request_with<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
        options: RequestOptions,
    ) -> Result<Value, MessengerError>
    where
        P: Publishable,
    {
        self.ensure_known(exchange)?;
        payload.validate()?;
        let bytes = Bytes::from(serde_json::to_vec(payload)?);

        let consumer = self.transport.reply_queue().await?;
        let reply_to = consumer.reply_address().cloned().ok_or_else(|| {
            MessengerError::Transport(TransportError::Consume(
                "reply queue has no address".to_string(),
            ))
        })?;

        let subscription = Arc::new(Subscription::for_reply(
            consumer.tag().clone(),
            self.transport.clone(),
        ));

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.request_timeout());

        let (settle_tx, settle_rx) = oneshot::channel();
        tokio::spawn(request::run_race(
            consumer,
            subscription.clone(),
            options.expect,
            timeout,
            options.cancel,
            settle_tx,
        ));

        if let Err(e) = self
            .transport
            .publish(exchange, routing_key, bytes, Some(reply_to))
            .await
        {
            if let Err(dispose_err) = subscription.dispose().await {
                warn!(error = %dispose_err, "Failed to drop reply queue after publish error");
            }
            return Err(e.into());
        }

        match settle_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(MessengerError::Transport(TransportError::Connection(
                "request settlement channel closed".to_string(),
            ))),
        }
    }

    fn ensure_known(&self, exchange: &str) -> Result<&ExchangeDef, MessengerError> {
        self.registry
            .get(exchange)
            .ok_or_else(|| MessengerError::ExchangeNotFound(exchange.to_string()))
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn has_wildcards(pattern: &str) -> bool {
    pattern.split('.').any(|word| word == "*" || word == "#")
}
