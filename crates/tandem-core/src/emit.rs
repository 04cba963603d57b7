//! Emit-after-success middleware.
//!
//! Adapters wrap their mutating operations in an [`Emitter`] so every
//! successful change is published without the adapter building events by
//! hand.

use crate::bus::EventBus;
use crate::error::BusError;
use crate::event::EventDraft;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tandem_protocol::{Event, EventMetadata, EventType, Payload, Priority, Source};
use tracing::warn;

/// Publishes one kind of event after successful operations.
#[derive(Debug, Clone)]
pub struct Emitter {
    bus: EventBus,
    target: String,
    event_type: EventType,
    source: Source,
    priority: Priority,
    ui_hint: Option<String>,
}

impl EventBus {
    /// Build an [`Emitter`] for `target` events of `event_type`.
    #[must_use]
    pub fn emitter(&self, target: impl Into<String>, event_type: EventType) -> Emitter {
        Emitter {
            bus: self.clone(),
            target: target.into(),
            event_type,
            source: Source::Agent,
            priority: Priority::Normal,
            ui_hint: None,
        }
    }
}

impl Emitter {
    /// Tag events with a UI hint.
    #[must_use]
    pub fn with_ui_hint(mut self, hint: impl Into<String>) -> Self {
        self.ui_hint = Some(hint.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the source.
    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Publish an event describing `result`.
    ///
    /// Object results become the payload verbatim; anything else is wrapped
    /// as `{"result": ...}`. The result's `id` field, if any, is copied into
    /// the `resource_id` metadata.
    ///
    /// # Errors
    ///
    /// Returns the publish error, or [`BusError::Validation`] if the result
    /// does not serialize.
    pub fn emit_after<T: Serialize + ?Sized>(
        &self,
        action: &str,
        result: &T,
    ) -> Result<Arc<Event>, BusError> {
        let value = serde_json::to_value(result)
            .map_err(|e| BusError::Validation(format!("unserializable result: {e}")))?;
        let data: Payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Payload::new();
                map.insert("result".into(), other);
                map
            }
        };

        let mut metadata = EventMetadata::default().with_extra("function", action);
        if let Some(hint) = &self.ui_hint {
            metadata = metadata.with_ui_hint(hint.clone());
        }
        if let Some(id) = data.get("id").filter(|id| !id.is_null()) {
            metadata = metadata.with_extra("resource_id", id.clone());
        }

        self.bus.publish(
            EventDraft::new(self.target.clone(), self.event_type, action)
                .with_source(self.source)
                .with_priority(self.priority)
                .with_data(data)
                .with_metadata(metadata),
        )
    }

    /// Run `operation` and publish its result if it succeeds.
    ///
    /// The operation's outcome is returned unchanged; a failed emission is
    /// logged and never turns a successful operation into an error.
    pub async fn wrap<T, E, F>(&self, action: &str, operation: F) -> Result<T, E>
    where
        T: Serialize,
        F: Future<Output = Result<T, E>>,
    {
        let output = operation.await?;
        if let Err(e) = self.emit_after(action, &output) {
            warn!(
                target_name = %self.target,
                action,
                error = %e,
                "Failed to emit event after successful operation"
            );
        }
        Ok(output)
    }
}
