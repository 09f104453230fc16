use crate::step::StepError;
use crate::task::Id;
use std::borrow::Cow;

/// Identity of a task as reported in errors and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskName {
    pub id: Id,
    pub name: Cow<'static, str>,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Errors surfaced by task handles and runners.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// `start` was called without work or a work provider.
    #[error("an enumerator or enumerator provider is required, call set_work or set_work_provider before start")]
    MissingWork,

    /// `start` was called on a routine that has no runner.
    #[error("no runner set, call set_runner before start")]
    MissingRunner,

    /// Restarting would replay a step that cannot be rewound.
    #[error("cannot restart {task}: its work is not replayable, use set_work_provider instead")]
    NotReplayable { task: TaskName },

    /// A pooled task is started once per acquire.
    #[error("task {task} is already started")]
    AlreadyStarted { task: TaskName },

    /// The task's work failed. Handed to `on_fail`.
    #[error("task {task} failed: {source}")]
    StepFailed {
        task: TaskName,
        #[source]
        source: StepError,
    },

    /// A task was advanced before being started. This is a bug in the caller
    /// of `advance`, not in the task's work.
    #[error("advancing task {task} without starting it, call start first")]
    NotStarted { task: TaskName },

    /// The pooled handle was recycled and now belongs to another run.
    #[error("pooled handle for task {task} is stale")]
    Stale { task: Id },

    /// Two threads tried to drive the same runner.
    #[error("runner {runner} is already being driven")]
    AlreadyDriving { runner: String },

    /// The threaded runner was killed and no longer accepts work.
    #[error("runner {runner} has been killed")]
    Killed { runner: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A catch-all for any other type of unexpected error.
    #[error("an unexpected error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// The error returned by the step, if this is a step failure.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            TaskError::StepFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Programmer errors reported at the call that caused them.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            TaskError::MissingWork | TaskError::MissingRunner | TaskError::NotReplayable { .. }
        )
    }

    /// Faults in the engine's own bookkeeping.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::NotStarted { .. } | TaskError::Internal(_))
    }
}
