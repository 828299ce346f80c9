//! One-way telemetry over publish/subscribe.
//!
//! A [`TelemetrySender`] publishes typed messages on a topic pattern, optionally
//! wrapped in a [`CloudEvent`] envelope; a [`TelemetryReceiver`] subscribes to
//! the same pattern and yields decoded [`TelemetryDelivery`] values.

pub mod cloud_event;
pub mod receiver;
pub mod sender;

pub use cloud_event::{CloudEvent, CLOUD_EVENT_SPEC_VERSION, DEFAULT_EVENT_TYPE};
pub use receiver::{TelemetryDelivery, TelemetryReceiver};
pub use sender::{TelemetryMessage, TelemetrySender, DEFAULT_TELEMETRY_EXPIRY};
