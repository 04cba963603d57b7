//! In-process listeners.
//!
//! A table from channel pattern to handlers. Handlers run synchronously on
//! the publishing task, in registration order, once per matching event.

use crate::router::ChannelPattern;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tandem_protocol::Event;
use tracing::{error, trace};

/// Event handler.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerTable {
    handlers: RwLock<HashMap<ChannelPattern, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    pub(crate) fn insert(self: &Arc<Self>, pattern: ChannelPattern, handler: Handler) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(listener = id, pattern = %pattern, "Listener added");
        self.handlers
            .write()
            .entry(pattern.clone())
            .or_default()
            .push((id, handler));

        ListenerHandle {
            table: Arc::downgrade(self),
            pattern,
            id,
        }
    }

    fn remove(&self, pattern: &ChannelPattern, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(pattern) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener, _)| *listener != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(pattern);
        }
        removed
    }

    /// Number of registered handlers.
    pub(crate) fn len(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Run every handler whose pattern matches.
    ///
    /// The lock is released before any handler runs, so handlers may publish
    /// or register listeners themselves.
    pub(crate) fn dispatch(&self, event: &Event) {
        let mut matched: Vec<(u64, Handler)> = {
            let handlers = self.handlers.read();
            if handlers.is_empty() {
                return;
            }
            handlers
                .iter()
                .filter(|(pattern, _)| pattern.matches(event))
                .flat_map(|(_, list)| list.iter().cloned())
                .collect()
        };
        matched.sort_unstable_by_key(|(id, _)| *id);

        for (id, handler) in matched {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(listener = id, event_id = event.id, "Listener panicked");
            }
        }
    }
}

/// Returned by [`EventBus::on`](crate::EventBus::on); removes the handler.
pub struct ListenerHandle {
    table: Weak<ListenerTable>,
    pattern: ChannelPattern,
    id: u64,
}

impl ListenerHandle {
    /// Remove the handler. Calling this more than once is a no-op.
    ///
    /// Returns `true` if the handler was removed by this call.
    pub fn unsubscribe(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| table.remove(&self.pattern, self.id))
    }

    /// Pattern the handler was registered for.
    #[must_use]
    pub fn pattern(&self) -> &ChannelPattern {
        &self.pattern
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("pattern", &self.pattern.to_string())
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tandem_protocol::{EventMetadata, EventType, Priority, Source};

    fn event(target: &str, event_type: EventType) -> Event {
        Event {
            id: 1,
            event_type,
            source: Source::Ui,
            target: target.into(),
            action: String::new(),
            data: Default::default(),
            metadata: EventMetadata::default(),
            priority: Priority::Normal,
            timestamp: 0,
            ttl: None,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = log.clone();
        Arc::new(move |_| log.lock().push(name))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let table = Arc::new(ListenerTable::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = table.insert(ChannelPattern::parse("note:create").unwrap(), recorder(&log, "a"));
        let _b = table.insert(ChannelPattern::All, recorder(&log, "b"));
        let _c = table.insert(ChannelPattern::parse("note:*").unwrap(), recorder(&log, "c"));
        let _d = table.insert(ChannelPattern::parse("task:*").unwrap(), recorder(&log, "d"));

        table.dispatch(&event("note", EventType::Create));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let table = Arc::new(ListenerTable::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = table.insert(ChannelPattern::All, recorder(&log, "a"));

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(table.len(), 0);

        table.dispatch(&event("note", EventType::Create));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let table = Arc::new(ListenerTable::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _bad = table.insert(ChannelPattern::All, Arc::new(|_| panic!("boom")));
        let _good = table.insert(ChannelPattern::All, recorder(&log, "good"));

        table.dispatch(&event("note", EventType::Update));
        assert_eq!(*log.lock(), vec!["good"]);
    }

    #[test]
    fn test_handle_outlives_table() {
        let table = Arc::new(ListenerTable::default());
        let handle = table.insert(ChannelPattern::All, Arc::new(|_| {}));
        drop(table);
        assert!(!handle.unsubscribe());
    }
}
