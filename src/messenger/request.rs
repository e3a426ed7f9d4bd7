//! Request/reply coordination.
//!
//! A request arms a race in a detached task: first of {reply arrives,
//! deadline fires, caller cancels} wins. The single post-race path disposes
//! the ephemeral reply subscription and only then settles the caller's
//! future, so observers can rely on teardown having finished. The detached
//! task keeps that guarantee even when the caller drops the request future
//! early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::{error, warn};

use super::envelope::ReplyFrame;
use super::subscription::Subscription;
use super::MessengerError;
use crate::payload::PayloadSchema;
use crate::transport::{Consumer, TransportError};

/// Per-call request knobs.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Schema the reply value must satisfy. A mismatching reply settles the
    /// request as a validation failure.
    pub expect: Option<PayloadSchema>,
    /// Deadline override for this call; the configured default applies when
    /// unset. Zero fails on the first poll.
    pub timeout: Option<Duration>,
    /// Token to abandon the request before the deadline.
    pub cancel: Option<CancelToken>,
}

impl RequestOptions {
    pub fn expecting(schema: PayloadSchema) -> Self {
        Self {
            expect: Some(schema),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Clonable early-abandon switch for pending requests.
///
/// All clones share state; firing is permanent. A request racing a fired
/// token settles as [`MessengerError::RequestCancelled`] after the usual
/// reply-queue teardown.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the token fires; immediately when it already has.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a concurrent cancel cannot slip
            // between the check and the await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Race reply vs deadline vs cancellation, tear down, then settle.
pub(crate) async fn run_race(
    mut consumer: Consumer,
    subscription: Arc<Subscription>,
    expect: Option<PayloadSchema>,
    timeout: Duration,
    cancel: Option<CancelToken>,
    settle: oneshot::Sender<Result<Value, MessengerError>>,
) {
    let outcome = tokio::select! {
        outcome = await_reply(&mut consumer, expect.as_ref()) => outcome,
        _ = tokio::time::sleep(timeout) => Err(MessengerError::RequestTimedOut { timeout }),
        _ = fired(cancel) => Err(MessengerError::RequestCancelled),
    };

    // Dispose strictly before the caller can observe the outcome.
    if let Err(e) = subscription.dispose().await {
        warn!(error = %e, "Failed to dispose reply subscription");
    }
    let _ = settle.send(outcome);
}

async fn fired(cancel: Option<CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Wait for the first well-formed reply frame and map it to an outcome.
async fn await_reply(
    consumer: &mut Consumer,
    expect: Option<&PayloadSchema>,
) -> Result<Value, MessengerError> {
    loop {
        let Some(delivery) = consumer.next().await else {
            return Err(MessengerError::Transport(TransportError::Connection(
                "Reply queue closed".to_string(),
            )));
        };

        let frame: ReplyFrame = match serde_json::from_slice(&delivery.payload) {
            Ok(frame) => frame,
            Err(e) => {
                // The deadline still bounds the request.
                error!(error = %e, "Dropping undecodable reply");
                continue;
            }
        };

        return match frame {
            ReplyFrame::Resolved(value) => match expect {
                Some(schema) => schema
                    .check(&value)
                    .map(|()| value)
                    .map_err(MessengerError::from),
                None => Ok(value),
            },
            ReplyFrame::Rejected(event) => Err(MessengerError::Remote(event)),
        };
    }
}
