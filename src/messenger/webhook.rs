//! Webhook mirroring for published payloads.
//!
//! A successful publish can be mirrored to HTTP endpoints as a JSON
//! `{"routingKey": ..., "data": ...}` body. Mirroring is strictly
//! fire-and-forget: each target is attempted exactly once, and endpoint
//! failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Errors raised by a webhook sink.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Target is not an absolute http(s) URL.
    #[error("Invalid webhook URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Sink is not available.
    #[error("Webhook sink unavailable: {0}")]
    Unavailable(String),
}

/// Output destination for mirrored payloads.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    /// POST the JSON body to the target URL, returning the response status.
    async fn post(&self, url: &str, body: &Value) -> Result<u16, WebhookError>;
}

/// Request timeout for mirror POSTs.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Webhook sink backed by a shared reqwest client.
///
/// Serves both http and https targets from the same client; TLS comes
/// from the client's rustls backend.
pub struct HttpWebhookSink {
    client: Client,
}

impl HttpWebhookSink {
    pub fn new() -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .map_err(WebhookError::Http)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn post(&self, url: &str, body: &Value) -> Result<u16, WebhookError> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Body sent to each configured target.
#[derive(Debug, Serialize)]
struct MirrorBody<'a> {
    #[serde(rename = "routingKey")]
    routing_key: &'a str,
    data: &'a Value,
}

/// Fans a published payload out to the configured webhook targets.
#[derive(Clone)]
pub struct WebhookMirror {
    sink: Arc<dyn WebhookSink>,
}

impl WebhookMirror {
    pub fn new(sink: Arc<dyn WebhookSink>) -> Self {
        Self { sink }
    }

    /// POST the mirror body to every target once.
    ///
    /// Unparseable and non-http(s) targets are skipped with a warning,
    /// failed POSTs are logged and dropped. Nothing here reaches the
    /// publishing caller.
    pub async fn dispatch(&self, routing_key: &str, data: &Value, targets: &[String]) {
        if targets.is_empty() {
            return;
        }

        let body = match serde_json::to_value(MirrorBody { routing_key, data }) {
            Ok(body) => body,
            Err(e) => {
                warn!(routing_key, error = %e, "Failed to encode webhook body");
                return;
            }
        };

        let posts = targets.iter().filter_map(|target| {
            if let Err(e) = check_scheme(target) {
                warn!(url = %target, error = %e, "Skipping webhook target");
                return None;
            }
            Some(self.post_one(target, &body, routing_key))
        });

        join_all(posts).await;
    }

    async fn post_one(&self, url: &str, body: &Value, routing_key: &str) {
        match self.sink.post(url, body).await {
            Ok(status) if (200..300).contains(&status) => {
                debug!(url = %url, routing_key, status, "Payload mirrored to webhook");
            }
            Ok(status) => {
                warn!(
                    url = %url,
                    routing_key,
                    status,
                    "Webhook target returned non-success status"
                );
            }
            Err(e) => {
                warn!(url = %url, routing_key, error = %e, "Webhook POST failed");
            }
        }
    }
}

/// Reject anything that is not an absolute http or https URL.
fn check_scheme(target: &str) -> Result<(), WebhookError> {
    let url = Url::parse(target).map_err(|e| WebhookError::InvalidUrl {
        url: target.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(WebhookError::InvalidUrl {
            url: target.to_string(),
            reason: format!("Unsupported scheme '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        posts: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                posts: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn posts(&self) -> Vec<(String, Value)> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookSink for RecordingSink {
        async fn post(&self, url: &str, body: &Value) -> Result<u16, WebhookError> {
            self.posts
                .lock()
                .unwrap()
                .push((url.to_string(), body.clone()));
            if self.fail {
                return Err(WebhookError::Unavailable("Sink offline".to_string()));
            }
            Ok(200)
        }
    }

    #[tokio::test]
    async fn test_posts_once_per_target() {
        let sink = Arc::new(RecordingSink::default());
        let mirror = WebhookMirror::new(sink.clone());

        let targets = vec![
            "http://audit.example.com/hook".to_string(),
            "https://audit.example.com/hook".to_string(),
        ];
        mirror
            .dispatch("node.create", &json!({"name": "a"}), &targets)
            .await;

        let posts = sink.posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].0, "http://audit.example.com/hook");
        assert_eq!(posts[1].0, "https://audit.example.com/hook");
    }

    #[tokio::test]
    async fn test_body_shape() {
        let sink = Arc::new(RecordingSink::default());
        let mirror = WebhookMirror::new(sink.clone());

        let targets = vec!["https://audit.example.com/hook".to_string()];
        mirror
            .dispatch("node.create", &json!({"flag": true}), &targets)
            .await;

        let posts = sink.posts();
        assert_eq!(
            posts[0].1,
            json!({"routingKey": "node.create", "data": {"flag": true}})
        );
    }

    #[tokio::test]
    async fn test_empty_targets_post_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mirror = WebhookMirror::new(sink.clone());

        mirror.dispatch("node.create", &json!({}), &[]).await;

        assert!(sink.posts().is_empty());
    }

    #[tokio::test]
    async fn test_skips_non_http_targets() {
        let sink = Arc::new(RecordingSink::default());
        let mirror = WebhookMirror::new(sink.clone());

        let targets = vec![
            "ftp://files.example.com/hook".to_string(),
            "not a url".to_string(),
            "https://audit.example.com/hook".to_string(),
        ];
        mirror.dispatch("node.create", &json!({}), &targets).await;

        let posts = sink.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "https://audit.example.com/hook");
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink::failing());
        let mirror = WebhookMirror::new(sink.clone());

        let targets = vec!["https://audit.example.com/hook".to_string()];
        mirror.dispatch("node.create", &json!({}), &targets).await;

        // The POST was attempted once and its failure went nowhere.
        assert_eq!(sink.posts().len(), 1);
    }

    #[test]
    fn test_check_scheme() {
        assert!(check_scheme("http://example.com/hook").is_ok());
        assert!(check_scheme("https://example.com/hook").is_ok());
        assert!(check_scheme("ftp://example.com/hook").is_err());
        assert!(check_scheme("example.com/hook").is_err());
        assert!(check_scheme("").is_err());
    }
}
