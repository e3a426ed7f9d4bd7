//! Library configuration.
//!
//! Settings load from YAML files and environment variables into plain serde
//! structs. The messenger never caches behavior knobs at construction: it
//! reads them through a [`SharedSettings`] handle at call time, so the
//! webhook target list and the default request timeout can be swapped at
//! runtime.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::registry::{ExchangeDef, ExchangeRegistry};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Messenger behavior knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessengerSettings {
    /// Default deadline for `request()` in milliseconds. A per-call override
    /// wins; zero fails pending requests on the first poll.
    pub request_timeout_ms: u64,
    /// Webhook mirror targets (http or https URLs). An empty list means no
    /// mirroring even when a publish asks for it.
    pub webhook_targets: Vec<String>,
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            webhook_targets: Vec::new(),
        }
    }
}

impl MessengerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// AMQP connection settings, used by the `amqp` transport feature.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// Broker URL, e.g. `amqp://localhost:5672`.
    pub url: String,
    /// Connection pool size.
    pub pool_size: usize,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Exchanges this process may talk to.
    pub exchanges: Vec<ExchangeDef>,
    /// Messenger knobs.
    pub messenger: MessengerSettings,
    /// AMQP connection settings.
    pub amqp: AmqpSettings,
}

impl CourierConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by the `path` argument (if provided)
    /// 3. File named by [`CONFIG_ENV_VAR`] (if set)
    /// 4. Environment variables prefixed with [`CONFIG_ENV_PREFIX`]
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Registry of the configured exchanges.
    pub fn registry(&self) -> ExchangeRegistry {
        ExchangeRegistry::new(self.exchanges.iter().cloned())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            exchanges: vec![ExchangeDef::topic("events")],
            ..Self::default()
        }
    }
}

/// Hot-reloadable view of [`MessengerSettings`].
///
/// Cheap to clone; all clones see updates. Readers take a short lock and
/// copy out what they need, so no lock is ever held across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<MessengerSettings>>,
}

impl SharedSettings {
    pub fn new(settings: MessengerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.read().request_timeout()
    }

    /// Snapshot of the webhook target list as of this call.
    pub fn webhook_targets(&self) -> Vec<String> {
        self.read().webhook_targets.clone()
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.write().request_timeout_ms = timeout.as_millis() as u64;
    }

    pub fn set_webhook_targets(&self, targets: Vec<String>) {
        self.write().webhook_targets = targets;
    }

    pub fn snapshot(&self) -> MessengerSettings {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MessengerSettings> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MessengerSettings> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoutingSyntax;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert!(config.exchanges.is_empty());
        assert_eq!(config.messenger.request_timeout_ms, 10_000);
        assert!(config.messenger.webhook_targets.is_empty());
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.amqp.pool_size, 10);
    }

    #[test]
    fn test_parse_yaml() {
        use ::config::{Config, File, FileFormat};

        let yaml = r#"
exchanges:
  - name: events
  - name: rpc
    syntax: direct
messenger:
  request_timeout_ms: 2500
  webhook_targets:
    - http://hooks.local/a
    - https://hooks.local/b
amqp:
  url: amqp://broker:5672
"#;
        let config: CourierConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.messenger.request_timeout_ms, 2500);
        assert_eq!(config.messenger.webhook_targets.len(), 2);
        assert_eq!(config.amqp.url, "amqp://broker:5672");
        // Pool size falls back to the default.
        assert_eq!(config.amqp.pool_size, 10);

        let registry = config.registry();
        assert!(registry.is_known("events"));
        assert_eq!(registry.get("rpc").unwrap().syntax, RoutingSyntax::Direct);
        assert!(!registry.is_known("other"));
    }

    #[test]
    fn test_shared_settings_hot_swap() {
        let settings = SharedSettings::new(MessengerSettings::default());
        let view = settings.clone();

        assert_eq!(view.request_timeout(), Duration::from_millis(10_000));
        assert!(view.webhook_targets().is_empty());

        settings.set_request_timeout(Duration::from_millis(250));
        settings.set_webhook_targets(vec!["http://hooks.local/x".to_string()]);

        // All clones observe the update.
        assert_eq!(view.request_timeout(), Duration::from_millis(250));
        assert_eq!(view.webhook_targets(), vec!["http://hooks.local/x"]);
    }
}
