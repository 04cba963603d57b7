//! Delivery strategies over the routed event stream.
//!
//! - [`pull`]: blocking wait with timeout, cursor and cancellation
//! - [`push`]: persistent stream with heartbeat and retrying writes

pub mod pull;
pub mod push;

pub use pull::{EventSummary, WaitOutcome, WaitRequest, WaitStatus};
pub use push::{DeliveryError, PushSink, SubscribeRequest, Subscription};
