//! Event bus
//!
//! Per-user fan-out of lifecycle events to dashboard subscribers.

mod bus;
mod types;

pub use bus::{EventBus, SubscriberId};
pub use types::Event;
