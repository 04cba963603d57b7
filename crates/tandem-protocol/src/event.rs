//! Event records as they travel over every transport.
//!
//! An [`Event`] is immutable once the bus has assigned its id. The enumerations
//! here are closed sets; parsing an unknown name yields [`UnknownVariant`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Monotonically increasing event identifier.
///
/// Ids start at 1; `0` is used as "nothing seen yet".
pub type EventId = u64;

/// Opaque payload mapping carried by an event.
pub type Payload = Map<String, Value>;

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The wire name of this variant.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

named_enum! {
    /// What happened to the target resource.
    EventType, "event type" {
        /// A resource was created.
        Create => "create",
        /// A resource was modified.
        Update => "update",
        /// A resource was removed.
        Delete => "delete",
        /// A consumer should navigate to a resource.
        Navigate => "navigate",
        /// A consumer should refresh its view of a resource.
        Refresh => "refresh",
        /// A bulk synchronization began.
        SyncStart => "sync_start",
        /// A bulk synchronization finished.
        SyncEnd => "sync_end",
        /// A producer detected conflicting updates.
        Conflict => "conflict",
    }
}

named_enum! {
    /// Who produced the event.
    Source, "source" {
        /// The request/response agent.
        Agent => "agent",
        /// A browser-style client.
        Ui => "ui",
        /// The system itself.
        System => "system",
    }
}

named_enum! {
    /// Delivery priority. Ordered from lowest to highest.
    Priority, "priority" {
        /// Background information.
        Low => "low",
        /// The default.
        Normal => "normal",
        /// Should be surfaced promptly.
        High => "high",
        /// Must be surfaced immediately.
        Critical => "critical",
    }
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Well-known metadata plus arbitrary producer extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Hint for UI behaviour (e.g. `navigate_to`, `refresh`, `focus`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_hint: Option<String>,
    /// Session the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Groups causally related events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Anything else the producer attached.
    #[serde(flatten)]
    pub extra: Payload,
}

impl EventMetadata {
    /// Set the UI hint.
    #[must_use]
    pub fn with_ui_hint(mut self, hint: impl Into<String>) -> Self {
        self.ui_hint = Some(hint.into());
        self
    }

    /// Set the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach an extra key.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Bus-assigned id, strictly increasing.
    pub id: EventId,
    /// Kind of change.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Origin tag.
    pub source: Source,
    /// Logical resource kind, e.g. `note` or `task`.
    pub target: String,
    /// Producer-defined operation name.
    pub action: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Payload,
    /// Metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Lifespan in seconds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Event {
    /// Millisecond timestamp after which the event is expired.
    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        self.ttl
            .map(|secs| self.timestamp.saturating_add(secs.saturating_mul(1000)))
    }

    /// Whether the event has expired at `now_ms`.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at().is_some_and(|at| now_ms > at)
    }

    /// The `id` field of the payload, rendered as a string.
    #[must_use]
    pub fn resource_id(&self) -> Option<String> {
        match self.data.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Event {
        Event {
            id: 7,
            event_type: EventType::SyncStart,
            source: Source::Agent,
            target: "note".into(),
            action: "create_note".into(),
            data: json!({"id": 42, "title": "x"}).as_object().cloned().unwrap(),
            metadata: EventMetadata::default()
                .with_ui_hint("navigate_to")
                .with_extra("function", "create_note"),
            priority: Priority::High,
            timestamp: 1_000,
            ttl: Some(2),
        }
    }

    #[test]
    fn test_enum_names() {
        assert_eq!("sync_end".parse::<EventType>(), Ok(EventType::SyncEnd));
        assert_eq!(EventType::Conflict.to_string(), "conflict");
        assert!("read".parse::<EventType>().is_err());
        assert_eq!("ui".parse::<Source>(), Ok(Source::Ui));
        assert!("CRITICAL".parse::<Priority>().is_err());
        assert_eq!(EventType::ALL.len(), 8);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_expiry() {
        let event = sample();
        assert_eq!(event.expires_at(), Some(3_000));
        assert!(!event.is_expired_at(3_000));
        assert!(event.is_expired_at(3_001));

        let forever = Event { ttl: None, ..sample() };
        assert!(!forever.is_expired_at(u64::MAX));
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["type"], "sync_start");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["metadata"]["ui_hint"], "navigate_to");
        assert_eq!(value["metadata"]["function"], "create_note");
        assert!(value["metadata"].get("session").is_none());
    }

    #[test]
    fn test_resource_id() {
        assert_eq!(sample().resource_id(), Some("42".to_string()));
        let mut event = sample();
        event.data.remove("id");
        assert_eq!(event.resource_id(), None);
    }
}
