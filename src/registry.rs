//! Exchange registry: the catalog of broker destinations this process may
//! talk to.
//!
//! The registry is built once at startup from configuration and never mutated
//! afterwards. Every publish, subscribe, and request call checks its exchange
//! name here first, so an unknown destination fails before any broker I/O
//! happens.

use std::collections::HashMap;

use serde::Deserialize;

/// Routing-key interpretation for an exchange.
///
/// `Topic` exchanges route on dot-separated words with `*`/`#` wildcard
/// support in binding patterns. `Direct` exchanges match routing keys
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingSyntax {
    #[default]
    Topic,
    Direct,
}

/// Static description of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeDef {
    /// Broker-side exchange name, e.g. `"events"`.
    pub name: String,
    /// How routing keys are interpreted. Defaults to topic semantics.
    #[serde(default)]
    pub syntax: RoutingSyntax,
}

impl ExchangeDef {
    /// Topic exchange with the given name.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            syntax: RoutingSyntax::Topic,
        }
    }

    /// Direct exchange with the given name.
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            syntax: RoutingSyntax::Direct,
        }
    }
}

/// Immutable catalog of known exchanges.
///
/// Shared by reference (`Arc`) between the messenger and anything else that
/// needs to answer "may we talk to this exchange?". Lookup is by exact name;
/// there is no registration after construction.
#[derive(Debug, Default, Clone)]
pub struct ExchangeRegistry {
    exchanges: HashMap<String, ExchangeDef>,
}

impl ExchangeRegistry {
    /// Build a registry from exchange definitions.
    ///
    /// Later definitions with a duplicate name replace earlier ones.
    pub fn new(defs: impl IntoIterator<Item = ExchangeDef>) -> Self {
        let exchanges = defs
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self { exchanges }
    }

    /// Whether `name` refers to a registered exchange.
    ///
    /// This is the fast-fail gate: callers must check it (or go through the
    /// messenger, which does) before issuing any transport call.
    pub fn is_known(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    /// Descriptor for a registered exchange, if any.
    pub fn get(&self, name: &str) -> Option<&ExchangeDef> {
        self.exchanges.get(name)
    }

    /// Names of all registered exchanges, in unspecified order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exchanges.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
