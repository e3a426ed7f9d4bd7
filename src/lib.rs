//! Courier - structured messaging over topic exchanges
//!
//! Publish/subscribe with topic routing, payload validation, and
//! emulated request/reply over ephemeral reply queues, backed by an
//! in-process broker or AMQP.

pub mod config;
pub mod messenger;
pub mod payload;
pub mod registry;
pub mod transport;
