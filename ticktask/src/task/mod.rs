//! Task handles and the engine that drives them.
//!
//! A task binds one [`Work`] to a [`Continuation`] and a lifecycle state. Two
//! handle flavours exist:
//!
//! - [`PooledTask`]: borrowed from a [`TaskPool`], started once, returned to
//!   the pool automatically when it finishes.
//! - [`TaskRoutine`]: long-lived and owned by the caller. It can be paused,
//!   resumed, stopped and restarted, including while a stop is in flight.
//!
//! [`Work`]: crate::step::Work
use std::fmt;
use std::sync::Arc;

pub(crate) mod core;

mod continuation;
pub use continuation::Continuation;

mod error;
pub use error::{TaskError, TaskName};

mod id;
pub use id::Id;

mod pooled;
pub use pooled::{PooledTask, TaskPool};

mod routine;
pub use routine::TaskRoutine;

pub mod state;
pub use state::Snapshot;

pub type OnFail = Arc<dyn Fn(TaskError) + Send + Sync>;
pub type OnStop = Arc<dyn Fn() + Send + Sync>;

/// Per-run callbacks. Both are optional; a task without `on_fail` logs its
/// failure instead.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_fail: Option<OnFail>,
    pub(crate) on_stop: Option<OnStop>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the wrapped error when the task's work fails.
    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: Fn(TaskError) + Send + Sync + 'static,
    {
        self.on_fail = Some(Arc::new(f));
        self
    }

    /// Called when the task completes through `stop` or a
    /// [`BreakSignal::AndStop`](crate::step::BreakSignal::AndStop).
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_fail.is_none() && self.on_stop.is_none()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_fail", &self.on_fail.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}
