//! Option structs for every protocol component.
//!
//! Each struct has a `Default` and derives `Deserialize`, so applications can
//! load them from JSON. Values are validated when the component is built.

use std::collections::HashMap;
use std::time::Duration;

use courier_core::topic::{custom_tokens, tokens};
use courier_core::{ProtocolError, TopicTokens};
use serde::{Deserialize, Serialize};

/// Default response topic prefix; the invoker's own client id keeps replies private.
pub const DEFAULT_RESPONSE_TOPIC_PREFIX: &str = "clients/{invokerClientId}";

/// What the executor does with a request once every handler slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for a free slot, bounded by the request's remaining expiry.
    #[default]
    Queue,
    /// Answer immediately with `StateInvalid`.
    Reject,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Configuration for a `CommandInvoker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerOptions {
    /// Name of the command, substituted for `{commandName}`.
    pub command_name: String,
    /// Pattern the request topic is resolved from.
    pub request_topic_pattern: String,
    /// Prefix of the response topic. `None` publishes replies directly under the request topic.
    pub response_topic_prefix: Option<String>,
    /// Optional trailing level(s) appended to the response topic.
    pub response_topic_suffix: Option<String>,
    /// Substituted for `{modelId}`.
    pub model_id: Option<String>,
    /// Custom tokens, referenced in patterns as `{ex:name}`.
    pub topic_token_map: HashMap<String, String>,
}

impl Default for InvokerOptions {
    fn default() -> Self {
        Self {
            command_name: String::new(),
            request_topic_pattern: String::new(),
            response_topic_prefix: Some(DEFAULT_RESPONSE_TOPIC_PREFIX.to_string()),
            response_topic_suffix: None,
            model_id: None,
            topic_token_map: HashMap::new(),
        }
    }
}

impl InvokerOptions {
    /// Tokens bound when the invoker is built.
    pub(crate) fn construction_tokens(&self, client_id: &str) -> TopicTokens {
        let mut map = base_tokens(
            tokens::COMMAND_NAME,
            &self.command_name,
            self.model_id.as_deref(),
            &self.topic_token_map,
        );
        map.insert(tokens::INVOKER_CLIENT_ID.to_string(), client_id.to_string());
        map
    }

    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        require_non_empty("command_name", &self.command_name)
    }
}

/// Configuration for a `CommandExecutor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    pub command_name: String,
    pub request_topic_pattern: String,
    pub model_id: Option<String>,
    pub topic_token_map: HashMap<String, String>,
    /// When set, the executor joins shared subscription `$share/{group}/...`.
    pub service_group_id: Option<String>,
    /// Maximum number of handlers running at once.
    pub max_concurrent_handlers: u32,
    pub overflow_policy: OverflowPolicy,
    /// How long an idempotent response stays cached past its request's expiry.
    pub idempotent_cache_ttl_ms: u64,
    /// Interval between sweeps of expired cache entries.
    pub cache_sweep_interval_ms: u64,
    /// Upper bound on waiting for in-flight handlers during shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command_name: String::new(),
            request_topic_pattern: String::new(),
            model_id: None,
            topic_token_map: HashMap::new(),
            service_group_id: None,
            max_concurrent_handlers: 128,
            overflow_policy: OverflowPolicy::Queue,
            idempotent_cache_ttl_ms: 60_000,
            cache_sweep_interval_ms: 5_000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl ExecutorOptions {
    pub(crate) fn construction_tokens(&self, client_id: &str) -> TopicTokens {
        let mut map = base_tokens(
            tokens::COMMAND_NAME,
            &self.command_name,
            self.model_id.as_deref(),
            &self.topic_token_map,
        );
        map.insert(tokens::EXECUTOR_ID.to_string(), client_id.to_string());
        map
    }

    #[must_use]
    pub fn idempotent_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotent_cache_ttl_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        require_non_empty("command_name", &self.command_name)?;
        if self.max_concurrent_handlers == 0 {
            return Err(ProtocolError::configuration_invalid(
                "max_concurrent_handlers",
                Some("0".to_string()),
                "executor needs at least one handler slot",
            ));
        }
        if self.cache_sweep_interval_ms == 0 {
            return Err(ProtocolError::configuration_invalid(
                "cache_sweep_interval_ms",
                Some("0".to_string()),
                "cache sweep interval must be positive",
            ));
        }
        validate_group("service_group_id", self.service_group_id.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Configuration for a `TelemetrySender`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderOptions {
    pub telemetry_name: String,
    pub topic_pattern: String,
    pub model_id: Option<String>,
    pub topic_token_map: HashMap<String, String>,
}

impl SenderOptions {
    pub(crate) fn construction_tokens(&self, client_id: &str) -> TopicTokens {
        let mut map = base_tokens(
            tokens::TELEMETRY_NAME,
            &self.telemetry_name,
            self.model_id.as_deref(),
            &self.topic_token_map,
        );
        map.insert(tokens::SENDER_ID.to_string(), client_id.to_string());
        map
    }

    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        require_non_empty("telemetry_name", &self.telemetry_name)
    }
}

/// Configuration for a `TelemetryReceiver`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    pub telemetry_name: String,
    pub topic_pattern: String,
    pub model_id: Option<String>,
    pub topic_token_map: HashMap<String, String>,
    pub service_group_id: Option<String>,
    /// Acknowledge each message once it has been handed to the application.
    pub auto_ack: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            telemetry_name: String::new(),
            topic_pattern: String::new(),
            model_id: None,
            topic_token_map: HashMap::new(),
            service_group_id: None,
            auto_ack: true,
        }
    }
}

impl ReceiverOptions {
    pub(crate) fn construction_tokens(&self) -> TopicTokens {
        base_tokens(
            tokens::TELEMETRY_NAME,
            &self.telemetry_name,
            self.model_id.as_deref(),
            &self.topic_token_map,
        )
    }

    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        validate_group("service_group_id", self.service_group_id.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn base_tokens(
    name_token: &str,
    name: &str,
    model_id: Option<&str>,
    custom: &HashMap<String, String>,
) -> TopicTokens {
    let mut map = custom_tokens(custom);
    if !name.is_empty() {
        map.insert(name_token.to_string(), name.to_string());
    }
    if let Some(model_id) = model_id {
        map.insert(tokens::MODEL_ID.to_string(), model_id.to_string());
    }
    map
}

fn require_non_empty(property: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::configuration_invalid(
            property,
            Some(value.to_string()),
            format!("{property} must not be empty"),
        ));
    }
    Ok(())
}

fn validate_group(property: &str, group: Option<&str>) -> Result<(), ProtocolError> {
    match group {
        Some(group) if !courier_core::topic::is_valid_replacement(group) => {
            Err(ProtocolError::configuration_invalid(
                property,
                Some(group.to_string()),
                "shared subscription group must be a single topic level",
            ))
        }
        _ => Ok(()),
    }
}

/// Prepends `$share/{group}/` to `filter` when a group is configured.
pub(crate) fn shared_filter(group: Option<&str>, filter: String) -> String {
    match group {
        Some(group) => format!("$share/{group}/{filter}"),
        None => filter,
    }
}
