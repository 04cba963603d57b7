//! Event drafts: what producers hand to the bus before an id is assigned.

use crate::error::BusError;
use crate::registry::ConnectionId;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tandem_protocol::{Event, EventId, EventMetadata, EventType, Payload, Priority, Source};

/// Maximum length of a target or action name.
pub const MAX_NAME_LENGTH: usize = 256;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Validate a target name.
///
/// Targets appear inside channel patterns, so they may not contain the
/// pattern separator or wildcard.
///
/// # Errors
///
/// Returns an error message if the target is invalid.
pub fn validate_target(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("target cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("target too long");
    }
    if name.contains(':') || name.contains('*') {
        return Err("target may not contain ':' or '*'");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("target contains invalid characters");
    }
    Ok(())
}

/// An event before publication.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    /// Kind of change.
    pub event_type: EventType,
    /// Origin tag.
    pub source: Source,
    /// Logical resource kind.
    pub target: String,
    /// Producer-defined operation name.
    pub action: String,
    /// Opaque payload.
    pub data: Payload,
    /// Metadata.
    pub metadata: EventMetadata,
    /// Delivery priority.
    pub priority: Priority,
    /// Lifespan; the bus default applies when `None`.
    pub ttl: Option<Duration>,
    /// Registered connection publishing this event, charged against its rate limit.
    pub origin: Option<ConnectionId>,
}

impl EventDraft {
    /// Create a draft with an empty payload, `agent` source and normal priority.
    #[must_use]
    pub fn new(target: impl Into<String>, event_type: EventType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            source: Source::Agent,
            target: target.into(),
            action: action.into(),
            data: Payload::new(),
            metadata: EventMetadata::default(),
            priority: Priority::Normal,
            ttl: None,
            origin: None,
        }
    }

    /// Set the source.
    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Insert one payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the lifespan.
    ///
    /// Events carry their TTL in whole seconds; a fractional TTL is rounded
    /// up, so `1500ms` keeps the event for two seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Publish on behalf of a registered connection.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<ConnectionId>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Check the free-form fields.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), BusError> {
        validate_target(&self.target).map_err(|reason| BusError::Validation(reason.into()))?;
        if self.action.len() > MAX_NAME_LENGTH {
            return Err(BusError::Validation("action too long".into()));
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(BusError::Validation("ttl must be positive".into()));
        }
        Ok(())
    }

    /// Freeze the draft into an immutable event.
    #[must_use]
    pub(crate) fn seal(self, id: EventId, timestamp: u64, default_ttl: Option<u64>) -> Event {
        let ttl = self
            .ttl
            .map(|ttl| {
                ttl.as_secs()
                    .saturating_add(u64::from(ttl.subsec_nanos() > 0))
                    .max(1)
            })
            .or(default_ttl);
        Event {
            id,
            event_type: self.event_type,
            source: self.source,
            target: self.target,
            action: self.action,
            data: self.data,
            metadata: self.metadata,
            priority: self.priority,
            timestamp,
            ttl,
        }
    }
}

/// An untyped draft as received from an external caller.
///
/// Enumerated fields arrive as strings and are checked against the closed
/// sets when converted into an [`EventDraft`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawEventDraft {
    /// Logical resource kind.
    pub target: String,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Operation name.
    #[serde(default)]
    pub action: String,
    /// Payload.
    #[serde(default)]
    pub data: Payload,
    /// Metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Priority name, `normal` when absent.
    #[serde(default)]
    pub priority: Option<String>,
    /// Source name, `agent` when absent.
    #[serde(default)]
    pub source: Option<String>,
    /// Lifespan in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Publishing connection.
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl TryFrom<RawEventDraft> for EventDraft {
    type Error = BusError;

    fn try_from(raw: RawEventDraft) -> Result<Self, Self::Error> {
        let mut draft = EventDraft::new(raw.target, raw.event_type.parse()?, raw.action)
            .with_data(raw.data)
            .with_metadata(raw.metadata);
        if let Some(priority) = raw.priority {
            draft.priority = priority.parse()?;
        }
        if let Some(source) = raw.source {
            draft.source = source.parse()?;
        }
        if let Some(ttl) = raw.ttl {
            draft.ttl = Some(Duration::from_secs(ttl));
        }
        draft.origin = raw.connection_id.map(ConnectionId::from);
        draft.validate()?;
        Ok(draft)
    }
}
