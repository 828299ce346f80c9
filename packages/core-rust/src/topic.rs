//! Topic patterns and token substitution.
//!
//! A pattern such as `rpc/{modelId}/{executorId}/{commandName}` is a sequence of
//! `/`-separated levels, each either a literal or a `{token}` placeholder that
//! occupies the whole level. Protocol components pre-bind the tokens known at
//! construction, fill the rest per call with [`TopicPattern::resolve`], and run
//! the inverse with [`TopicPattern::match_topic`] on inbound topics.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ProtocolError;

/// Token name to replacement value.
pub type TopicTokens = HashMap<String, String>;

/// Prefix reserved for user-supplied tokens, e.g. `{ex:region}`.
pub const CUSTOM_TOKEN_PREFIX: &str = "ex:";

/// Token names filled in by the framework.
pub mod tokens {
    pub const COMMAND_NAME: &str = "commandName";
    pub const TELEMETRY_NAME: &str = "telemetryName";
    pub const MODEL_ID: &str = "modelId";
    pub const INVOKER_CLIENT_ID: &str = "invokerClientId";
    pub const EXECUTOR_ID: &str = "executorId";
    pub const SENDER_ID: &str = "senderId";
}

static TOKEN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ex:)?[A-Za-z][A-Za-z0-9_]*$").expect("token name regex is valid")
});

static LITERAL_LEVEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s+#{}/]+$").expect("literal level regex is valid"));

/// Returns `true` if `value` may be substituted into a topic level.
#[must_use]
pub fn is_valid_replacement(value: &str) -> bool {
    LITERAL_LEVEL.is_match(value)
}

/// Qualifies user tokens with [`CUSTOM_TOKEN_PREFIX`].
#[must_use]
pub fn custom_tokens(user: &HashMap<String, String>) -> TopicTokens {
    user.iter()
        .map(|(k, v)| (format!("{CUSTOM_TOKEN_PREFIX}{k}"), v.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Token(String),
}

/// Validated topic pattern, possibly with some tokens already bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    levels: Vec<Level>,
}

impl TopicPattern {
    /// Parses `pattern` and binds every token present in `bound`.
    ///
    /// `property_name` names the configuration field in error reports.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationInvalid` if the pattern is malformed or a bound
    /// value is not a valid topic level.
    pub fn new(
        property_name: &str,
        pattern: &str,
        bound: &TopicTokens,
    ) -> Result<Self, ProtocolError> {
        let invalid = |message: String| {
            ProtocolError::configuration_invalid(property_name, Some(pattern.to_string()), message)
        };

        if pattern.trim().is_empty() {
            return Err(invalid("topic pattern is empty".to_string()));
        }
        if pattern.starts_with('/') || pattern.ends_with('/') {
            return Err(invalid("topic pattern must not start or end with '/'".to_string()));
        }

        let mut levels = Vec::new();
        for raw in pattern.split('/') {
            if raw.is_empty() {
                return Err(invalid("topic pattern contains an empty level".to_string()));
            }
            if let Some(name) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
                if !TOKEN_NAME.is_match(name) {
                    return Err(invalid(format!("invalid token name {name:?}")));
                }
                match bound.get(name) {
                    Some(value) if is_valid_replacement(value) => {
                        levels.push(Level::Literal(value.clone()));
                    }
                    Some(value) => {
                        return Err(ProtocolError::configuration_invalid(
                            name,
                            Some(value.clone()),
                            format!("value {value:?} for token {name:?} is not a valid topic level"),
                        ));
                    }
                    None => levels.push(Level::Token(name.to_string())),
                }
            } else if LITERAL_LEVEL.is_match(raw) {
                levels.push(Level::Literal(raw.to_string()));
            } else {
                return Err(invalid(format!("invalid topic level {raw:?}")));
            }
        }
        Ok(Self { levels })
    }

    /// Placeholders still awaiting a value.
    pub fn unresolved_tokens(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().filter_map(|level| match level {
            Level::Token(name) => Some(name.as_str()),
            Level::Literal(_) => None,
        })
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.unresolved_tokens().next().is_none()
    }

    /// Substitutes every remaining placeholder from `tokens`.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` naming the first placeholder without a value;
    /// `ArgumentInvalid` if a supplied value is not a valid topic level.
    pub fn resolve(&self, tokens: &TopicTokens) -> Result<String, ProtocolError> {
        let mut parts = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            match level {
                Level::Literal(text) => parts.push(text.as_str()),
                Level::Token(name) => match tokens.get(name) {
                    Some(value) if is_valid_replacement(value) => parts.push(value.as_str()),
                    Some(value) => {
                        return Err(ProtocolError::argument_invalid(
                            name.clone(),
                            Some(value.clone()),
                            format!("value {value:?} for token {name:?} is not a valid topic level"),
                        ));
                    }
                    None => {
                        return Err(ProtocolError::configuration_invalid(
                            name.clone(),
                            None,
                            format!("topic token {name:?} has no replacement"),
                        ));
                    }
                },
            }
        }
        Ok(parts.join("/"))
    }

    /// Binds each placeholder to the matching level of `topic`.
    ///
    /// Returns `None` when literal levels differ or the level counts disagree.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> Option<TopicTokens> {
        let mut found = TopicTokens::new();
        let mut observed = topic.split('/');
        for level in &self.levels {
            let value = observed.next()?;
            match level {
                Level::Literal(text) if text == value => {}
                Level::Literal(_) => return None,
                Level::Token(_) if value.is_empty() => return None,
                Level::Token(name) => match found.get(name) {
                    // A token repeated in a pattern must bind the same value everywhere.
                    Some(previous) if previous != value => return None,
                    _ => {
                        found.insert(name.clone(), value.to_string());
                    }
                },
            }
        }
        if observed.next().is_some() {
            return None;
        }
        Some(found)
    }

    /// Subscription filter with every unresolved placeholder replaced by `+`.
    #[must_use]
    pub fn as_subscribe_topic(&self) -> String {
        self.levels
            .iter()
            .map(|level| match level {
                Level::Literal(text) => text.as_str(),
                Level::Token(_) => "+",
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match level {
                Level::Literal(text) => f.write_str(text)?,
                Level::Token(name) => write!(f, "{{{name}}}")?,
            }
        }
        Ok(())
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the rest,
/// and `$share/{group}/` prefixes are stripped before matching.
#[must_use]
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let filter = strip_share_prefix(filter).map_or(filter, |(_, rest)| rest);
    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        match filter_level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

/// Splits `$share/{group}/{filter}` into `(group, filter)`.
#[must_use]
pub fn strip_share_prefix(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, inner) = rest.split_once('/')?;
    if group.is_empty() || inner.is_empty() {
        return None;
    }
    Some((group, inner))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    fn tokens(pairs: &[(&str, &str)]) -> TopicTokens {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn binds_construction_time_tokens() {
        let pattern = TopicPattern::new(
            "request_topic_pattern",
            "rpc/{modelId}/{executorId}/{commandName}",
            &tokens(&[("modelId", "thermostat"), ("commandName", "setpoint")]),
        )
        .unwrap();
        assert_eq!(pattern.to_string(), "rpc/thermostat/{executorId}/setpoint");
        assert_eq!(pattern.unresolved_tokens().collect::<Vec<_>>(), vec!["executorId"]);
        assert_eq!(pattern.as_subscribe_topic(), "rpc/thermostat/+/setpoint");
    }

    #[test]
    fn resolve_reports_first_unresolved_token() {
        let pattern =
            TopicPattern::new("p", "a/{executorId}/{ex:region}", &TopicTokens::new()).unwrap();
        let err = pattern.resolve(&tokens(&[("executorId", "e1")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name(), Some("ex:region"));

        let topic = pattern
            .resolve(&tokens(&[("executorId", "e1"), ("ex:region", "west")]))
            .unwrap();
        assert_eq!(topic, "a/e1/west");
    }

    #[test]
    fn resolve_rejects_values_with_separators() {
        let pattern = TopicPattern::new("p", "a/{executorId}", &TopicTokens::new()).unwrap();
        let err = pattern.resolve(&tokens(&[("executorId", "x/y")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentInvalid);
    }

    #[test]
    fn malformed_patterns_are_configuration_errors() {
        for bad in ["", "/a", "a/", "a//b", "a/+/b", "a/#", "a/{bad name}", "a/{1x}", "a b/c", "a/x{y}"] {
            let err = TopicPattern::new("p", bad, &TopicTokens::new()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid, "{bad:?}");
            assert!(err.is_shallow());
        }
    }

    #[test]
    fn invalid_bound_value_is_rejected() {
        let err = TopicPattern::new("p", "a/{modelId}", &tokens(&[("modelId", "has space")]))
            .unwrap_err();
        assert_eq!(err.property_name(), Some("modelId"));
    }

    #[test]
    fn match_topic_extracts_tokens() {
        let pattern = TopicPattern::new(
            "p",
            "clients/{invokerClientId}/rpc/{commandName}",
            &TopicTokens::new(),
        )
        .unwrap();
        let found = pattern.match_topic("clients/c1/rpc/reboot").unwrap();
        assert_eq!(found, tokens(&[("invokerClientId", "c1"), ("commandName", "reboot")]));

        assert!(pattern.match_topic("clients/c1/rpc").is_none());
        assert!(pattern.match_topic("clients/c1/rpc/reboot/extra").is_none());
        assert!(pattern.match_topic("clients/c1/other/reboot").is_none());
        assert!(pattern.match_topic("clients//rpc/reboot").is_none());
    }

    #[test]
    fn custom_tokens_are_namespaced() {
        let user: HashMap<String, String> = [("region".to_string(), "west".to_string())].into();
        let qualified = custom_tokens(&user);
        assert_eq!(qualified.get("ex:region").map(String::as_str), Some("west"));
    }

    #[test]
    fn filter_matching_follows_mqtt_rules() {
        assert!(topic_matches_filter("a/+/c", "a/b/c"));
        assert!(!topic_matches_filter("a/+/c", "a/b/d"));
        assert!(topic_matches_filter("a/#", "a/b/c"));
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
        assert!(!topic_matches_filter("a/+", "a"));
        assert!(topic_matches_filter("$share/g1/a/+", "a/x"));
        assert_eq!(strip_share_prefix("$share/g1/a/+"), Some(("g1", "a/+")));
        assert_eq!(strip_share_prefix("a/+"), None);
    }

    fn token_value() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.-]{1,12}"
    }

    proptest! {
        #[test]
        fn resolve_then_match_recovers_tokens(
            executor in token_value(),
            invoker in token_value(),
            region in token_value(),
        ) {
            let pattern = TopicPattern::new(
                "p",
                "svc/{executorId}/x/{invokerClientId}/{ex:region}",
                &TopicTokens::new(),
            ).unwrap();
            let supplied = tokens(&[
                ("executorId", executor.as_str()),
                ("invokerClientId", invoker.as_str()),
                ("ex:region", region.as_str()),
            ]);
            let topic = pattern.resolve(&supplied).unwrap();
            prop_assert_eq!(pattern.match_topic(&topic), Some(supplied));
            prop_assert!(topic_matches_filter(&pattern.as_subscribe_topic(), &topic));
        }
    }
}
