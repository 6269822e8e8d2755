//! Redis-backed shared state for taskmesh.
//!
//! Everything that must be visible across workers lives here: session
//! history, the streaming replay cache, cancellation flags, worker
//! heartbeats, the running-task registry, push-mode queues, and
//! distributed locks. No other crate talks to Redis.

pub mod cancel;
pub mod heartbeat;
pub mod lock;
pub mod queue;
pub mod sessions;
pub mod store;
pub mod tracker;

pub use cancel::CancelRegistry;
pub use heartbeat::HeartbeatStore;
pub use lock::DistributedLock;
pub use queue::{QueueType, TaskQueue};
pub use sessions::SessionCache;
pub use store::StateStore;
pub use tracker::{RunningTaskMeta, RunningTaskTracker};
