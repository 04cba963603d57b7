//! Channel patterns and event matching.
//!
//! A pattern is either the universal `*` or `target:type`, where either side
//! may be the wildcard `*`. Matching is pure and order-independent.

use crate::error::BusError;
use crate::event::validate_target;
use std::fmt;
use std::str::FromStr;
use tandem_protocol::{Event, EventType};

/// A parsed channel pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelPattern {
    /// Matches every event.
    All,
    /// Matches on target and type; `None` is a wildcard.
    Scoped {
        /// Required target.
        target: Option<String>,
        /// Required event type.
        event_type: Option<EventType>,
    },
}

impl ChannelPattern {
    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidPattern`] if the pattern is malformed or names
    /// an unknown event type.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let invalid = |reason| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern == "*" {
            return Ok(ChannelPattern::All);
        }

        let (target, kind) = pattern
            .split_once(':')
            .ok_or_else(|| invalid("expected `target:type` or `*`"))?;

        let target = match target {
            "*" => None,
            name => {
                validate_target(name).map_err(invalid)?;
                Some(name.to_string())
            }
        };
        let event_type = match kind {
            "*" => None,
            name => Some(
                name.parse::<EventType>()
                    .map_err(|_| invalid("unknown event type"))?,
            ),
        };

        Ok(match (target, event_type) {
            (None, None) => ChannelPattern::All,
            (target, event_type) => ChannelPattern::Scoped { target, event_type },
        })
    }

    /// Pattern matching every event of one target.
    #[must_use]
    pub fn target(target: impl Into<String>) -> Self {
        ChannelPattern::Scoped {
            target: Some(target.into()),
            event_type: None,
        }
    }

    /// Whether this pattern matches the event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            ChannelPattern::All => true,
            ChannelPattern::Scoped { target, event_type } => {
                target.as_deref().map_or(true, |t| t == event.target)
                    && event_type.map_or(true, |k| k == event.event_type)
            }
        }
    }
}

impl FromStr for ChannelPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPattern::All => f.write_str("*"),
            ChannelPattern::Scoped { target, event_type } => write!(
                f,
                "{}:{}",
                target.as_deref().unwrap_or("*"),
                event_type.map_or("*", |k| k.as_str())
            ),
        }
    }
}

/// Parse a list of patterns, dropping duplicates. An empty list means `*`.
///
/// # Errors
///
/// Returns the first pattern that fails to parse.
pub fn parse_patterns<S: AsRef<str>>(
    patterns: impl IntoIterator<Item = S>,
) -> Result<Vec<ChannelPattern>, BusError> {
    let mut parsed: Vec<ChannelPattern> = Vec::new();
    for pattern in patterns {
        let pattern = ChannelPattern::parse(pattern.as_ref().trim())?;
        if !parsed.contains(&pattern) {
            parsed.push(pattern);
        }
    }
    if parsed.is_empty() {
        parsed.push(ChannelPattern::All);
    }
    Ok(parsed)
}

/// Whether any of the patterns matches the event.
///
/// A connection with overlapping patterns still matches exactly once.
#[must_use]
pub fn matches_any(patterns: &[ChannelPattern], event: &Event) -> bool {
    patterns.iter().any(|p| p.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::{EventMetadata, Priority, Source};

    fn event(target: &str, event_type: EventType) -> Event {
        Event {
            id: 1,
            event_type,
            source: Source::System,
            target: target.into(),
            action: String::new(),
            data: Default::default(),
            metadata: EventMetadata::default(),
            priority: Priority::Normal,
            timestamp: 0,
            ttl: None,
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(ChannelPattern::parse("*").unwrap(), ChannelPattern::All);
        assert_eq!(ChannelPattern::parse("*:*").unwrap(), ChannelPattern::All);
        assert_eq!(
            ChannelPattern::parse("note:*").unwrap(),
            ChannelPattern::target("note")
        );
        assert_eq!(
            ChannelPattern::parse("*:delete").unwrap(),
            ChannelPattern::Scoped {
                target: None,
                event_type: Some(EventType::Delete)
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "note", "note:explode", ":create", "a:b:c"] {
            assert!(
                matches!(ChannelPattern::parse(bad), Err(BusError::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["*", "note:*", "*:sync_end", "task:update"] {
            assert_eq!(ChannelPattern::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_target_wildcard() {
        let pattern = ChannelPattern::parse("note:*").unwrap();
        assert!(pattern.matches(&event("note", EventType::Create)));
        assert!(pattern.matches(&event("note", EventType::Conflict)));
        assert!(!pattern.matches(&event("task", EventType::Create)));
    }

    #[test]
    fn test_type_wildcard_and_exact() {
        let any_target = ChannelPattern::parse("*:update").unwrap();
        assert!(any_target.matches(&event("task", EventType::Update)));
        assert!(!any_target.matches(&event("task", EventType::Create)));

        let exact = ChannelPattern::parse("task:update").unwrap();
        assert!(exact.matches(&event("task", EventType::Update)));
        assert!(!exact.matches(&event("note", EventType::Update)));
    }

    #[test]
    fn test_overlapping_patterns_match_once() {
        let patterns = parse_patterns(["note:*", "*:create", "*", "note:*"]).unwrap();
        assert_eq!(patterns.len(), 3);
        assert!(matches_any(&patterns, &event("note", EventType::Create)));
    }

    #[test]
    fn test_empty_list_is_universal() {
        let patterns = parse_patterns(Vec::<String>::new()).unwrap();
        assert_eq!(patterns, vec![ChannelPattern::All]);
    }
}
