//! Resumable units of work.
//!
//! A [`Step`] is advanced once per tick by whichever collection owns it. It
//! never blocks: all of its progress lives in explicit fields so that the
//! runner can suspend it simply by not calling [`Step::advance`] again until
//! the next tick.
use std::borrow::Cow;
use std::fmt;

pub mod adapters;
pub use adapters::{
    CatchReport, Catching, Factory, FnStep, IterStep, Shared, Sleep, Timeout, WaitUntil, from_iter,
    step_fn,
};

pub mod collection;
pub use collection::{CollectionKind, TaskCollection};

/// Maximum depth of nested work a single collection lane accepts before the
/// nested work is rejected.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Signal a step can raise to cut its collection short.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakSignal {
    #[default]
    None,

    /// Abort the enclosing collection. The owning task completes normally.
    Iteration,

    /// Abort the enclosing collections and complete the owning task through
    /// its stop path (`on_stop` is invoked if one was supplied).
    AndStop,
}

/// What a step reports after being advanced once.
pub enum Yield {
    /// More work remains, advance me again next tick.
    Continue,

    /// The step is finished.
    Done,

    /// The step wants its collection to stop iterating.
    Break(BreakSignal),

    /// Run this work to completion before advancing me again.
    Nested(Work),
}

impl fmt::Debug for Yield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Yield::Continue => f.write_str("Continue"),
            Yield::Done => f.write_str("Done"),
            Yield::Break(signal) => f.debug_tuple("Break").field(signal).finish(),
            Yield::Nested(work) => f.debug_tuple("Nested").field(&work.name()).finish(),
        }
    }
}

/// Outcome of advancing a whole collection: the `(has_more, break)` pair the
/// Task Core turns into state transitions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepState {
    pub has_more: bool,
    pub signal: BreakSignal,
}

impl StepState {
    pub const MORE: StepState = StepState {
        has_more: true,
        signal: BreakSignal::None,
    };

    pub const DONE: StepState = StepState {
        has_more: false,
        signal: BreakSignal::None,
    };

    pub fn broken(signal: BreakSignal) -> Self {
        StepState {
            has_more: false,
            signal,
        }
    }
}

/// Why nested work was refused by a collection lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub step: Cow<'static, str>,
    pub depth: usize,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} yielded nested work at depth {} (max {})",
            self.step, self.depth, MAX_NESTING_DEPTH
        )
    }
}

/// Failure surfaced while advancing a step.
#[derive(thiserror::Error, Debug)]
pub enum StepError {
    /// The step returned an error.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// The step panicked while being advanced.
    #[error("step panicked: {0}")]
    Panicked(String),

    /// The collection refused nested work. This is bookkeeping, not a user
    /// failure: the task completes without reaching `on_fail`.
    #[error("nested work rejected: {0}")]
    Rejected(Rejection),
}

pub type StepResult = Result<Yield, StepError>;

/// The minimal unit of resumable work.
///
/// Implementations must keep all progress in their own fields. A step that is
/// built from a language-level iterator cannot be rewound and must report
/// `false` from [`Step::is_replayable`]; restarting such a step is rejected.
pub trait Step: Send {
    /// Advance one step.
    fn advance(&mut self) -> StepResult;

    /// Whether [`Step::reset`] rewinds this step to its initial state.
    fn is_replayable(&self) -> bool {
        false
    }

    /// Rewind to the initial state. Only called when `is_replayable` is true.
    fn reset(&mut self) {}

    /// Human readable name used in logs and wrapped errors.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

impl<S: Step + ?Sized> Step for Box<S> {
    fn advance(&mut self) -> StepResult {
        (**self).advance()
    }

    fn is_replayable(&self) -> bool {
        (**self).is_replayable()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn name(&self) -> Cow<'static, str> {
        (**self).name()
    }
}

/// Work handed to a task: either a single step, wrapped by the task in a
/// serial collection of one, or a collection used directly.
pub enum Work {
    Single(Box<dyn Step>),
    Collection(TaskCollection),
}

impl Work {
    pub fn step<S: Step + 'static>(step: S) -> Self {
        Work::Single(Box::new(step))
    }

    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Work::Single(step) => step.name(),
            Work::Collection(collection) => collection.name(),
        }
    }

    pub(crate) fn into_step(self) -> Box<dyn Step> {
        match self {
            Work::Single(step) => step,
            Work::Collection(collection) => Box::new(collection),
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Single(step) => f.debug_tuple("Single").field(&step.name()).finish(),
            Work::Collection(c) => f.debug_tuple("Collection").field(c).finish(),
        }
    }
}

impl From<TaskCollection> for Work {
    fn from(collection: TaskCollection) -> Self {
        Work::Collection(collection)
    }
}

impl From<Box<dyn Step>> for Work {
    fn from(step: Box<dyn Step>) -> Self {
        Work::Single(step)
    }
}

/// Advance a step, turning a panic into [`StepError::Panicked`].
pub(crate) fn advance_guarded(step: &mut dyn Step) -> StepResult {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| step.advance())) {
        Ok(res) => res,
        Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
