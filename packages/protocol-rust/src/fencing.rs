//! Fencing tokens for downstream coordination primitives.
//!
//! A lock or leader-election primitive hands its holder an HLC timestamp as a
//! fencing token. A store guarding a key with [`FencingValidator`] accepts a
//! write only if its token is strictly greater than the last token it accepted
//! for that key, which rejects writers holding a stale lease without the store
//! having to understand the clock.

use std::fmt;
use std::str::FromStr;

use courier_core::{HlcError, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Opaque, totally ordered token presented alongside a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FencingToken(Timestamp);

impl FencingToken {
    #[must_use]
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    #[must_use]
    pub fn timestamp(&self) -> &Timestamp {
        &self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FencingToken {
    type Err = HlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Rejection raised when a write presents a stale token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fencing token {presented} for key {key:?} is not newer than accepted token {current}")]
pub struct StaleFencingToken {
    pub key: String,
    pub presented: FencingToken,
    pub current: FencingToken,
}

/// Tracks the highest accepted fencing token per key.
#[derive(Debug, Default)]
pub struct FencingValidator {
    accepted: DashMap<String, FencingToken>,
}

impl FencingValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `token` for `key` if it is strictly newer than the last accepted one.
    ///
    /// # Errors
    ///
    /// Returns [`StaleFencingToken`] and leaves state unchanged otherwise.
    pub fn check_and_advance(&self, key: &str, token: &FencingToken) -> Result<(), StaleFencingToken> {
        match self.accepted.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if token <= entry.get() {
                    return Err(StaleFencingToken {
                        key: key.to_string(),
                        presented: token.clone(),
                        current: entry.get().clone(),
                    });
                }
                entry.insert(token.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(token.clone());
            }
        }
        Ok(())
    }

    /// Last accepted token for `key`.
    #[must_use]
    pub fn current(&self, key: &str) -> Option<FencingToken> {
        self.accepted.get(key).map(|entry| entry.value().clone())
    }

    /// Forgets a key, e.g. when it is deleted.
    pub fn forget(&self, key: &str) {
        self.accepted.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{HlcConfig, ManualClock};
    use proptest::prelude::*;

    use super::*;
    use crate::clock::SharedHlc;

    #[test]
    fn rejects_stale_and_equal_tokens() {
        let clock = SharedHlc::with_clock_source(
            "lock-service",
            HlcConfig::default(),
            Box::new(ManualClock::new(10)),
        );
        let validator = FencingValidator::new();

        let old = clock.fencing_token();
        let new = clock.fencing_token();

        validator.check_and_advance("k", &new).unwrap();
        let err = validator.check_and_advance("k", &old).unwrap_err();
        assert_eq!(err.current, new);
        assert!(validator.check_and_advance("k", &new).is_err());
        assert_eq!(validator.current("k"), Some(new));
    }

    #[test]
    fn keys_are_fenced_independently() {
        let clock = SharedHlc::new("lock-service");
        let validator = FencingValidator::new();
        let token = clock.fencing_token();

        validator.check_and_advance("a", &token).unwrap();
        validator.check_and_advance("b", &token).unwrap();
        validator.forget("a");
        validator.check_and_advance("a", &token).unwrap();
    }

    #[test]
    fn wire_form_round_trips() {
        let token = FencingToken::new(Timestamp { millis: 7, counter: 1, node_id: "n".into() });
        assert_eq!(token.to_string().parse::<FencingToken>().unwrap(), token);
    }

    proptest! {
        #[test]
        fn accepts_exactly_the_running_maxima(
            stamps in prop::collection::vec((0u64..50, 0u32..4), 1..40),
        ) {
            let validator = FencingValidator::new();
            let mut highest: Option<FencingToken> = None;
            for (millis, counter) in stamps {
                let token = FencingToken::new(Timestamp { millis, counter, node_id: "n".into() });
                let newer = highest.as_ref().map_or(true, |h| token > *h);
                prop_assert_eq!(validator.check_and_advance("k", &token).is_ok(), newer);
                if newer {
                    highest = Some(token);
                }
                prop_assert_eq!(validator.current("k"), highest.clone());
            }
        }
    }
}
