//! Hybrid Logical Clock (HLC) for distributed causality tracking.
//!
//! Provides monotonically increasing timestamps that combine physical wall-clock
//! time with a logical counter, ensuring total ordering of events across
//! processes. Timestamps stamp every request, response and telemetry message,
//! and double as fencing tokens for downstream coordination primitives.
//!
//! # Wire format
//!
//! Timestamps serialize to the string format `"millis:counter:nodeId"` when
//! carried in message headers. Node IDs must not contain the `:` character.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp combining physical time, logical counter, and node identity.
///
/// Ordering is defined as: millis first, then counter, then `node_id` (lexicographic byte order).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Physical wall-clock milliseconds since Unix epoch.
    pub millis: u64,
    /// Logical counter for events within the same millisecond.
    pub counter: u32,
    /// Unique identifier of the node that generated this timestamp.
    pub node_id: String,
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.millis, self.counter, self.node_id)
    }
}

impl FromStr for Timestamp {
    type Err = HlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(millis), Some(counter), Some(node_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HlcError::Malformed { value: s.to_string() });
        };
        let millis = millis
            .parse::<u64>()
            .map_err(|_| HlcError::Malformed { value: s.to_string() })?;
        let counter = counter
            .parse::<u32>()
            .map_err(|_| HlcError::Malformed { value: s.to_string() })?;
        if node_id.is_empty() {
            return Err(HlcError::Malformed { value: s.to_string() });
        }
        Ok(Self {
            millis,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

/// Errors raised by the clock when parsing or merging remote timestamps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HlcError {
    #[error("malformed HLC timestamp: {value:?}")]
    Malformed { value: String },
    #[error("remote clock is {drift_ms}ms ahead of local time (limit {max_drift_ms}ms)")]
    ClockDrift { drift_ms: u64, max_drift_ms: u64 },
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a virtual one.
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // A clock before the epoch reads as zero; the logical counter keeps ordering intact.
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let millis = elapsed.as_millis() as u64;
        millis
    }
}

/// Manually driven clock source. Cloned handles share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a manual clock reading `millis`.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Moves the clock to an absolute instant (may go backwards).
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, AtomicOrdering::SeqCst);
    }

    /// Advances the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(AtomicOrdering::SeqCst)
    }
}

/// Drift policy for a clock instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlcConfig {
    /// Reject remote timestamps that run too far ahead instead of logging.
    pub strict_mode: bool,
    /// Largest tolerated lead of a remote timestamp over local wall time.
    pub max_drift_ms: u64,
}

impl Default for HlcConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            max_drift_ms: 60_000,
        }
    }
}

/// Hybrid Logical Clock implementation.
///
/// Generates monotonically increasing [`Timestamp`]s by combining wall-clock time
/// with a logical counter. When the system clock advances, the counter resets to 0.
/// When the system clock is unchanged or behind, the counter increments.
///
/// # Drift detection
///
/// When merging a remote timestamp via [`HLC::update`], the clock detects if the
/// remote time exceeds the local time by more than `max_drift_ms`. In strict mode
/// this returns an error; otherwise a warning is logged via the `tracing` crate.
pub struct HLC {
    last_millis: u64,
    last_counter: u32,
    node_id: String,
    strict_mode: bool,
    max_drift_ms: u64,
    clock_source: Box<dyn ClockSource>,
}

impl HLC {
    /// Creates a clock reading the system time with the default drift policy.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_clock_source(node_id, HlcConfig::default(), Box::new(SystemClock))
    }

    /// Creates a clock with an explicit drift policy and clock source.
    #[must_use]
    pub fn with_clock_source(
        node_id: impl Into<String>,
        config: HlcConfig,
        clock_source: Box<dyn ClockSource>,
    ) -> Self {
        Self {
            last_millis: 0,
            last_counter: 0,
            node_id: node_id.into(),
            strict_mode: config.strict_mode,
            max_drift_ms: config.max_drift_ms,
            clock_source,
        }
    }

    /// Identity stamped into every timestamp this clock emits.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The injected wall-clock source.
    #[must_use]
    pub fn clock_source(&self) -> &dyn ClockSource {
        self.clock_source.as_ref()
    }

    /// Produces a timestamp strictly greater than anything emitted or observed so far.
    pub fn now(&mut self) -> Timestamp {
        let system = self.clock_source.now();
        if system > self.last_millis {
            self.last_millis = system;
            self.last_counter = 0;
        } else {
            self.bump_counter();
        }
        self.current()
    }

    /// Merges a remote timestamp into local state.
    ///
    /// The returned timestamp dominates both the local history and `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`HlcError::ClockDrift`] in strict mode when `remote` leads local
    /// wall time by more than `max_drift_ms`; local state is left untouched.
    pub fn update(&mut self, remote: &Timestamp) -> Result<Timestamp, HlcError> {
        let system = self.clock_source.now();

        if remote.millis > system.saturating_add(self.max_drift_ms) {
            let drift_ms = remote.millis - system;
            if self.strict_mode {
                return Err(HlcError::ClockDrift {
                    drift_ms,
                    max_drift_ms: self.max_drift_ms,
                });
            }
            tracing::warn!(
                node_id = %self.node_id,
                remote_node = %remote.node_id,
                drift_ms,
                "remote clock drift exceeds limit"
            );
        }

        let max_millis = self.last_millis.max(system).max(remote.millis);
        let local_matches = max_millis == self.last_millis;
        let remote_matches = max_millis == remote.millis;

        let base_counter = match (local_matches, remote_matches) {
            (true, true) => Some(self.last_counter.max(remote.counter)),
            (true, false) => Some(self.last_counter),
            (false, true) => Some(remote.counter),
            (false, false) => None,
        };

        self.last_millis = max_millis;
        match base_counter {
            Some(counter) => {
                self.last_counter = counter;
                self.bump_counter();
            }
            None => self.last_counter = 0,
        }
        Ok(self.current())
    }

    /// Total order over timestamps.
    #[must_use]
    pub fn compare(a: &Timestamp, b: &Timestamp) -> Ordering {
        a.cmp(b)
    }

    fn bump_counter(&mut self) {
        match self.last_counter.checked_add(1) {
            Some(next) => self.last_counter = next,
            None => {
                // Counter space for this millisecond is exhausted; borrow the next one.
                self.last_millis = self.last_millis.saturating_add(1);
                self.last_counter = 0;
            }
        }
    }

    fn current(&self) -> Timestamp {
        Timestamp {
            millis: self.last_millis,
            counter: self.last_counter,
            node_id: self.node_id.clone(),
        }
    }
}

impl fmt::Debug for HLC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HLC")
            .field("last_millis", &self.last_millis)
            .field("last_counter", &self.last_counter)
            .field("node_id", &self.node_id)
            .field("strict_mode", &self.strict_mode)
            .field("max_drift_ms", &self.max_drift_ms)
            .finish_non_exhaustive()
    }
}
