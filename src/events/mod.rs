//! Typed event bus gluing the host subsystems together.
//!
//! Publishers are the state machine, the loader, the managers, and the
//! registry client; subscribers include the dependency resolver, the conflict
//! detector, and the control-plane metrics. Delivery is rate limited and
//! batched per event kind.

pub mod batch;
pub mod bus;
pub mod rate_limit;
pub mod types;
pub mod validation;

pub use batch::{BatchConfig, Batcher};
pub use bus::{
    listener, BusStats, BusStatsSnapshot, EventBus, EventBusConfig, Listener, ListenerHandle,
    PublishOutcome,
};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use types::{EventKind, EventPriority, PluginEvent};
pub use validation::{EventValidator, ValidationCounters};
