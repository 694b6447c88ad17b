//! Child-server supervision: spawn, monitor, stop, and clean up upstream
//! MCP servers, with stderr capture into bounded log rings and status
//! fan-out over the event bus.

mod events;
mod handle;
mod logring;
mod pidtrack;
mod supervisor;

pub use events::{Event, EventBus};
pub use handle::{ChildHandle, ChildState};
pub use logring::{DEFAULT_LOG_CAPACITY, LogRing};
pub use pidtrack::PidTracker;
pub use supervisor::{GRACEFUL_STOP_TIMEOUT, Supervisor};
