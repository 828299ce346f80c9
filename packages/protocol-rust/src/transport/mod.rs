//! Transport implementations shipped with the crate.
//!
//! Production deployments plug an MQTT client session in behind
//! [`courier_core::PubSubTransport`]; the in-memory broker serves tests and the
//! loopback demo.

pub mod memory;

pub use memory::{BrokerConfig, MemoryBroker, MemoryClient, SubscriptionId};
