//! Cooperative tasks advanced one step per tick.
//!
//! Work is expressed as [`Step`]s, composed into serial or parallel
//! [`TaskCollection`]s and run by a task handle on a [`Runner`]. Every handle
//! can be paused, resumed and stopped from any thread; the runner observes
//! those requests on its next tick.
//!
//! ```ignore
//! use ticktask::{Builder, TaskPool, Work, from_iter};
//!
//! let runner = Builder::new().try_build()?;
//! let pool = TaskPool::new();
//! let done = pool.acquire().start(&runner, Work::step(from_iter(0..3)))?;
//!
//! while !done.poll() {
//!     runner.drive_once()?;
//! }
//! ```
//!
//! [`Step`]: step::Step
//! [`TaskCollection`]: step::TaskCollection

pub mod runtime;
pub use runtime::{Builder, Runner, Schedulers, ThreadedRunner};

pub mod step;
pub use step::{
    BreakSignal, Step, StepError, StepResult, TaskCollection, Work, Yield, from_iter, step_fn,
};

pub mod task;
pub use task::{Callbacks, Continuation, PooledTask, TaskError, TaskPool, TaskRoutine};

mod utils;

#[cfg(test)]
mod test_utils;
