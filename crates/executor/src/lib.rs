//! Worker-side half of the control plane: short-lived Docker containers,
//! the push-mode queue consumer, the heartbeat scanner, and the manager
//! HTTP API that the dispatcher targets in http_callback mode.

pub mod api_client;
pub mod consumer;
pub mod docker;
pub mod heartbeat;
pub mod manager;
pub mod scheduler;

pub use api_client::{TaskApiClient, TaskStatusSink};
pub use consumer::QueueConsumer;
pub use docker::DockerExecutor;
pub use heartbeat::HeartbeatChecker;
pub use scheduler::Scheduler;
