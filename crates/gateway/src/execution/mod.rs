//! The execution pipeline: routing, request building, dispatch, and
//! event emission.

pub mod builder;
pub mod codec;
pub mod dispatcher;
pub mod emitters;
pub mod router;

pub use builder::{BuildOptions, TaskRequestBuilder};
pub use dispatcher::Dispatcher;
pub use router::{CommunicationMode, ExecutionRouter, ExecutionTarget};

use tm_state::{CancelRegistry, RunningTaskTracker, SessionCache};

/// Stream-scoped shared state handed to emitters that own terminal
/// cleanup: replay cache, cancellation flags, running-task registry.
#[derive(Clone)]
pub struct StreamServices {
    pub sessions: SessionCache,
    pub cancels: CancelRegistry,
    pub tracker: RunningTaskTracker,
}
