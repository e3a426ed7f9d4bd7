//! Payload typing for messages crossing the broker.
//!
//! Outbound: anything [`Publishable`] can be published; its `validate` hook
//! runs before serialization so invalid values never reach the transport.
//! Inbound: a [`PayloadSchema`] is an explicit predicate over decoded JSON
//! values, attached at subscribe/request time. Schema rejection on the
//! responder side turns into a structured [`ErrorEvent`] for the requester.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload failed outbound validation or inbound schema matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// A decoded value did not satisfy the named schema.
    pub fn schema_mismatch(schema: &str) -> Self {
        Self::new(format!("Payload does not match schema '{schema}'"))
    }
}

/// Structured error carried across the broker when a responder rejects a
/// request. Round-trips verbatim through the reply frame, so the requester
/// sees exactly what the responder raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Machine-readable kind, e.g. `"ValidationError"`.
    pub name: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured details (null when absent).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl ErrorEvent {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorEvent {}

impl From<ValidationError> for ErrorEvent {
    fn from(err: ValidationError) -> Self {
        Self::new("ValidationError", err.message)
    }
}

/// Capability to travel as a message payload.
///
/// `validate` runs before every publish and request; the default accepts
/// everything, so plain data types only need the trait marker. Value objects
/// with invariants override it:
///
/// ```
/// use courier::payload::{Publishable, ValidationError};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct HostPort {
///     host: String,
///     port: u16,
/// }
///
/// impl Publishable for HostPort {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.host.is_empty() {
///             return Err(ValidationError::new("host cannot be empty"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Publishable: Serialize + Send + Sync {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Untyped JSON is always publishable.
impl Publishable for Value {}

/// Named predicate over decoded payloads.
///
/// Attached to a subscription to guard deliveries, or to a request to guard
/// the reply. Cheap to clone; the predicate is shared.
#[derive(Clone)]
pub struct PayloadSchema {
    name: Arc<str>,
    accepts: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl PayloadSchema {
    /// Schema from an explicit predicate. The name appears in logs and in
    /// rejection error events.
    pub fn new(
        name: impl Into<String>,
        accepts: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            accepts: Arc::new(accepts),
        }
    }

    /// Schema derived from a type: a value matches when it deserializes into
    /// `T` and passes `T`'s own validation.
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Publishable,
    {
        Self::new(std::any::type_name::<T>(), |value| {
            serde_json::from_value::<T>(value.clone())
                .map(|payload| payload.validate().is_ok())
                .unwrap_or(false)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepts(&self, value: &Value) -> bool {
        (self.accepts)(value)
    }

    /// `accepts` with a ready-made error for the rejection path.
    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        if self.accepts(value) {
            Ok(())
        } else {
            Err(ValidationError::schema_mismatch(&self.name))
        }
    }
}

impl fmt::Debug for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSchema")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct HostPort {
        host: String,
        port: u16,
    }

    impl Publishable for HostPort {
        fn validate(&self) -> Result<(), ValidationError> {
            if self.host.is_empty() {
                return Err(ValidationError::new("host cannot be empty"));
            }
            if self.port == 0 {
                return Err(ValidationError::new("port cannot be zero"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_default_validate_accepts_plain_values() {
        assert!(json!({ "hello": "world" }).validate().is_ok());
        assert!(Value::Null.validate().is_ok());
    }

    #[test]
    fn test_typed_validate_enforces_invariants() {
        let good = HostPort {
            host: "10.1.1.1".into(),
            port: 8080,
        };
        assert!(good.validate().is_ok());

        let bad = HostPort {
            host: String::new(),
            port: 8080,
        };
        let err = bad.validate().unwrap_err();
        assert!(err.message.contains("host"));
    }

    #[test]
    fn test_schema_of_type_checks_shape_and_invariants() {
        let schema = PayloadSchema::of::<HostPort>();

        assert!(schema.accepts(&json!({ "host": "10.1.1.1", "port": 8080 })));
        // Wrong shape.
        assert!(!schema.accepts(&json!({ "hello": "world" })));
        // Right shape, failed invariant.
        assert!(!schema.accepts(&json!({ "host": "", "port": 8080 })));
        assert!(!schema.accepts(&json!({ "host": "10.1.1.1", "port": 0 })));
    }

    #[test]
    fn test_schema_check_names_the_schema() {
        let schema = PayloadSchema::new("non_empty_object", |v| {
            v.as_object().map(|m| !m.is_empty()).unwrap_or(false)
        });

        assert!(schema.check(&json!({ "k": 1 })).is_ok());
        let err = schema.check(&json!({})).unwrap_err();
        assert!(err.message.contains("non_empty_object"));
    }

    #[test]
    fn test_error_event_round_trip() {
        let event = ErrorEvent::new("RemoteFault", "device unreachable")
            .with_context(json!({ "node": "n17" }));

        let bytes = serde_json::to_vec(&event).unwrap();
        let back: ErrorEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_error_event_context_defaults_to_null() {
        let event: ErrorEvent =
            serde_json::from_str(r#"{ "name": "X", "message": "y" }"#).unwrap();
        assert!(event.context.is_null());
        // Null context is omitted on the wire.
        let wire = serde_json::to_string(&event).unwrap();
        assert!(!wire.contains("context"));
    }

    #[test]
    fn test_validation_error_becomes_error_event() {
        let event: ErrorEvent = ValidationError::schema_mismatch("host_port").into();
        assert_eq!(event.name, "ValidationError");
        assert!(event.message.contains("host_port"));
    }
}
