//! Process-wide handle to one Hybrid Logical Clock.
//!
//! Every invoker, executor, sender and receiver built from the same
//! [`SharedHlc`] stamps and merges through a single guarded clock, so all of
//! them observe one consistent total order.

use std::cmp::Ordering;
use std::sync::Arc;

use courier_core::headers;
use courier_core::{ClockSource, HlcConfig, HlcError, ProtocolError, Timestamp, HLC};
use parking_lot::Mutex;

use crate::fencing::FencingToken;

/// Cloneable, thread-safe handle to a [`HLC`].
#[derive(Debug, Clone)]
pub struct SharedHlc {
    inner: Arc<Mutex<HLC>>,
}

impl SharedHlc {
    /// Clock on system time with the default drift policy.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::from_hlc(HLC::new(node_id))
    }

    /// Clock on an injected time source, e.g. a `ManualClock` in tests.
    #[must_use]
    pub fn with_clock_source(
        node_id: impl Into<String>,
        config: HlcConfig,
        clock_source: Box<dyn ClockSource>,
    ) -> Self {
        Self::from_hlc(HLC::with_clock_source(node_id, config, clock_source))
    }

    #[must_use]
    pub fn from_hlc(hlc: HLC) -> Self {
        Self {
            inner: Arc::new(Mutex::new(hlc)),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> String {
        self.inner.lock().node_id().to_string()
    }

    /// Next local timestamp.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.inner.lock().now()
    }

    /// Merges a remote timestamp; see [`HLC::update`].
    ///
    /// # Errors
    ///
    /// Propagates drift rejections from a strict clock.
    pub fn observe(&self, remote: &Timestamp) -> Result<Timestamp, HlcError> {
        self.inner.lock().update(remote)
    }

    /// Parses a `__ts` header value and merges it into the clock.
    ///
    /// # Errors
    ///
    /// `HeaderInvalid` if the value is not a timestamp; `StateInvalid` if a
    /// strict clock rejects it for drift.
    pub fn observe_header(&self, raw: &str) -> Result<Timestamp, ProtocolError> {
        let remote: Timestamp = raw.parse().map_err(|err: HlcError| {
            ProtocolError::header_invalid(headers::TIMESTAMP, raw).with_source(err)
        })?;
        self.observe(&remote).map_err(|err| {
            ProtocolError::state_invalid(Some(headers::TIMESTAMP.to_string()), err.to_string())
                .with_source(err)
        })?;
        Ok(remote)
    }

    #[must_use]
    pub fn compare(a: &Timestamp, b: &Timestamp) -> Ordering {
        HLC::compare(a, b)
    }

    /// Hands out a fresh timestamp as an opaque fencing token.
    #[must_use]
    pub fn fencing_token(&self) -> FencingToken {
        FencingToken::new(self.now())
    }

    /// Wall-clock milliseconds of the underlying clock source.
    #[must_use]
    pub fn wall_millis(&self) -> u64 {
        self.inner.lock().clock_source().now()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use courier_core::ManualClock;

    use super::*;

    #[test]
    fn clones_share_one_clock() {
        let clock = ManualClock::new(500);
        let a = SharedHlc::with_clock_source("n1", HlcConfig::default(), Box::new(clock));
        let b = a.clone();

        let t1 = a.now();
        let t2 = b.now();
        assert!(t2 > t1);
        assert_eq!(t2.counter, 1);
    }

    #[test]
    fn concurrent_callers_never_see_duplicates() {
        let hlc = SharedHlc::new("n1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hlc = hlc.clone();
                std::thread::spawn(move || (0..500).map(|_| hlc.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts), "duplicate timestamp emitted");
            }
        }
        assert_eq!(seen.len(), 4_000);
    }

    #[test]
    fn observe_then_now_orders_after_remote() {
        let hlc = SharedHlc::with_clock_source(
            "local",
            HlcConfig::default(),
            Box::new(ManualClock::new(1_000)),
        );
        let remote = Timestamp { millis: 1_050, counter: 3, node_id: "remote".into() };
        hlc.observe(&remote).unwrap();
        assert_eq!(SharedHlc::compare(&hlc.now(), &remote), Ordering::Greater);
    }

    #[test]
    fn observe_header_classifies_failures() {
        use courier_core::ErrorKind;

        let strict = SharedHlc::with_clock_source(
            "local",
            HlcConfig { strict_mode: true, max_drift_ms: 1_000 },
            Box::new(ManualClock::new(10_000)),
        );
        assert_eq!(
            strict.observe_header("garbage").unwrap_err().kind(),
            ErrorKind::HeaderInvalid
        );
        let drift = strict.observe_header("99999:0:remote").unwrap_err();
        assert_eq!(drift.kind(), ErrorKind::StateInvalid);
        assert_eq!(drift.property_name(), Some("__ts"));

        let ok = strict.observe_header("10500:2:remote").unwrap();
        assert_eq!(ok.counter, 2);
    }
}
