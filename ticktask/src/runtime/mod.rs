//! Runners drain newly started tasks into an active set and advance each
//! active task once per tick.
//!
//! A [`Runner`] is driven by whoever calls [`Runner::drive_once`]: a host
//! frame callback, a timer, or the dedicated thread of a [`ThreadedRunner`].
//! Parallelism comes from running several runners, never from one runner.
use crate::task::{Id, TaskError};
use std::sync::Arc;

mod builder;
pub use builder::Builder;
pub(crate) use builder::RunnerConfig;

mod registry;
pub use registry::{STANDARD, Schedulers};

mod runner;
pub use runner::Runner;

mod threaded;
pub use threaded::ThreadedRunner;


/// What a runner needs from a scheduled task.
pub trait Advance: Send + Sync {
    /// Advance the task one step. `Ok(false)` removes it from the active set;
    /// by then the task has already done its own cleanup.
    ///
    /// An `Err` is an internal fault, the task is removed and the error is
    /// returned from [`Runner::drive_once`].
    fn advance(&self) -> Result<bool, TaskError>;

    fn id(&self) -> Id;
}

/// Accepts newly started tasks.
pub trait Schedule: Send + Sync {
    /// Enqueue a task. Never blocks behind the driving thread.
    fn submit(&self, task: Arc<dyn Advance>) -> Result<(), TaskError>;

    fn name(&self) -> &str;
}
