//! # tandem-core
//!
//! Event distribution engine for Tandem.
//!
//! Bridges two independently paced consumers of the same state: agents that
//! discover changes with blocking waits, and long-lived subscribers that get
//! changes pushed as they happen.
//!
//! - **EventBus** - Ingestion, id assignment, bounded history
//! - **Router** - `target:type` channel patterns
//! - **Registry** - Pull and push connections, cursors, liveness
//! - **Delivery** - Long-poll waits and push streams with retry
//! - **RateLimit** - Per-connection token buckets
//! - **Cleanup** - Periodic eviction of expired events and stale connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Producer   │────▶│  EventBus   │────▶│   History   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Registry   │
//!                     └─────────────┘
//!                       │         │
//!                       ▼         ▼
//!              ┌────────────┐ ┌────────────┐
//!              │ Pull wait  │ │ Push sink  │
//!              └────────────┘ └────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tandem_core::{BusConfig, EventBus, EventDraft, EventFilter, WaitRequest};
//! use tandem_protocol::EventType;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), tandem_core::BusError> {
//! let bus = EventBus::new(BusConfig::default())?;
//! bus.start()?;
//!
//! bus.publish(EventDraft::new("note", EventType::Create, "create_note").with_field("id", "n1"))?;
//!
//! let outcome = bus
//!     .wait_for_updates(
//!         WaitRequest::new("agent").with_filter(EventFilter::new().with_targets(["note"])),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(outcome.events.len(), 1);
//!
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bus;
pub mod cleanup;
pub mod config;
pub mod delivery;
pub mod emit;
pub mod error;
pub mod event;
pub mod filter;
pub mod history;
mod listeners;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod router;

pub use backoff::RetryPolicy;
pub use bus::{Changes, EventBus};
pub use cleanup::SweepReport;
pub use config::BusConfig;
pub use delivery::{
    DeliveryError, EventSummary, PushSink, SubscribeRequest, Subscription, WaitOutcome,
    WaitRequest, WaitStatus,
};
pub use emit::Emitter;
pub use error::BusError;
pub use event::{EventDraft, RawEventDraft};
pub use filter::EventFilter;
pub use listeners::{Handler, ListenerHandle};
pub use metrics::MetricsSnapshot;
pub use rate_limit::{RateLimit, TokenBucket};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionMode};
pub use router::ChannelPattern;
