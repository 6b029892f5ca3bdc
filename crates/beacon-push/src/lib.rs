//! Push-side delivery: long/short polling, subscriber tracking, sequenced
//! broadcast and heartbeats.

pub mod broadcast;
pub mod frame;
pub mod heartbeat;
pub mod poll;
pub mod registry;

pub use broadcast::{BroadcastDispatcher, BroadcastReport};
pub use heartbeat::HeartbeatScheduler;
pub use poll::{PollError, PollMode, PollResponder, PollResponse};
pub use registry::{SendFailure, Subscriber, SubscriberRegistry};
