pub mod errors;
pub mod events;
pub mod ids;
pub mod state;

pub use errors::StateError;
pub use events::{PushEvent, Transport, HEARTBEAT_EVENT, UPDATE_EVENT};
pub use state::{StateSnapshot, VersionedState};
