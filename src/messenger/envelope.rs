//! Per-delivery reply surface.
//!
//! Every inbound delivery gets one [`Envelope`]. For request deliveries it
//! carries the reply address and enforces the at-most-one-answer rule; for
//! plain events the answer operations are logged no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::MessengerError;
use crate::payload::ErrorEvent;
use crate::transport::{ReplyAddress, Transport};

/// Wire frame for replies, externally tagged:
/// `{"resolved": <value>}` or `{"rejected": {"name": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum ReplyFrame {
    #[serde(rename = "resolved")]
    Resolved(Value),
    #[serde(rename = "rejected")]
    Rejected(ErrorEvent),
}

/// Reply surface for one delivery. Not reused, not cloned.
///
/// `resolve`/`respond` and `reject` each send exactly one reply frame; any
/// later call on the same envelope is a logged no-op. On a delivery without
/// a reply address all three do nothing.
pub struct Envelope {
    routing_key: String,
    reply_to: Option<ReplyAddress>,
    responded: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl Envelope {
    pub(crate) fn new(
        routing_key: String,
        reply_to: Option<ReplyAddress>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            routing_key,
            reply_to,
            responded: AtomicBool::new(false),
            transport,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the publisher attached a reply destination.
    pub fn is_request(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Whether a reply has already been sent.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    /// Settle the request successfully with `value`.
    pub async fn resolve(&self, value: Value) -> Result<(), MessengerError> {
        self.send_frame(ReplyFrame::Resolved(value)).await
    }

    /// Alias for [`resolve`](Self::resolve), phrased for responder code.
    pub async fn respond(&self, value: Value) -> Result<(), MessengerError> {
        self.resolve(value).await
    }

    /// Settle the request with a structured error. The requester receives
    /// the event verbatim.
    pub async fn reject(&self, error: ErrorEvent) -> Result<(), MessengerError> {
        self.send_frame(ReplyFrame::Rejected(error)).await
    }

    async fn send_frame(&self, frame: ReplyFrame) -> Result<(), MessengerError> {
        let Some(reply_to) = &self.reply_to else {
            debug!(
                routing_key = %self.routing_key,
                "No reply destination on delivery, dropping answer"
            );
            return Ok(());
        };

        if self.responded.swap(true, Ordering::SeqCst) {
            warn!(
                routing_key = %self.routing_key,
                reply_to = %reply_to,
                "Delivery already answered, dropping extra answer"
            );
            return Ok(());
        }

        let payload = serde_json::to_vec(&frame)?;
        self.transport
            .send_reply(reply_to, Bytes::from(payload))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("routing_key", &self.routing_key)
            .field("reply_to", &self.reply_to)
            .field("responded", &self.responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_frame_wire_shape() {
        let resolved = ReplyFrame::Resolved(json!({ "hello": "world" }));
        let wire = serde_json::to_string(&resolved).unwrap();
        assert_eq!(wire, r#"{"resolved":{"hello":"world"}}"#);

        let rejected = ReplyFrame::Rejected(ErrorEvent::new("RemoteFault", "boom"));
        let wire = serde_json::to_string(&rejected).unwrap();
        assert_eq!(wire, r#"{"rejected":{"name":"RemoteFault","message":"boom"}}"#);
    }

    #[test]
    fn test_reply_frame_round_trip() {
        let frame = ReplyFrame::Rejected(
            ErrorEvent::new("ValidationError", "bad payload").with_context(json!({ "field": "x" })),
        );
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back: ReplyFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, frame);
    }
}
