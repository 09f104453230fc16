//! Ready-made steps and step wrappers.
//!
//! Anything that wraps an external asynchronous operation into the step shape
//! follows the same pattern as [`WaitUntil`]: keep returning
//! [`Yield::Continue`] until the operation reports done, then surface its
//! outcome on the following advance.
use crate::step::{
    BreakSignal, CollectionKind, Step, StepError, StepResult, StepState, TaskCollection, Work,
    Yield, advance_guarded,
};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Step driven by a closure. Closures carry hidden state, so they cannot be
/// replayed; hand a [`Factory`] to a routine that must restart.
pub struct FnStep<F> {
    f: F,
}

pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: FnMut() -> StepResult + Send,
{
    FnStep { f }
}

impl<F> Step for FnStep<F>
where
    F: FnMut() -> StepResult + Send,
{
    fn advance(&mut self) -> StepResult {
        (self.f)()
    }
}

/// Step backed by an iterator: every item is one unit of progress, exhaustion
/// means done. This is the generator analogue and is never replayable.
pub struct IterStep<I> {
    iter: I,
}

pub fn from_iter<I>(iter: I) -> IterStep<I::IntoIter>
where
    I: IntoIterator,
    I::IntoIter: Send,
{
    IterStep {
        iter: iter.into_iter(),
    }
}

impl<I> Step for IterStep<I>
where
    I: Iterator + Send,
{
    fn advance(&mut self) -> StepResult {
        match self.iter.next() {
            Some(_) => Ok(Yield::Continue),
            None => Ok(Yield::Done),
        }
    }
}

/// Creates its work lazily on first advance and recreates it on reset, which
/// makes any work replayable.
pub struct Factory<F> {
    make: F,
    current: Option<Box<dyn Step>>,
}

impl<F> Factory<F>
where
    F: Fn() -> Work + Send,
{
    pub fn new(make: F) -> Self {
        Self {
            make,
            current: None,
        }
    }
}

impl<F> Step for Factory<F>
where
    F: Fn() -> Work + Send,
{
    fn advance(&mut self) -> StepResult {
        let make = &self.make;
        let current = self.current.get_or_insert_with(|| make().into_step());
        current.advance()
    }

    fn is_replayable(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn name(&self) -> Cow<'static, str> {
        match &self.current {
            Some(step) => step.name(),
            None => Cow::Borrowed("Factory"),
        }
    }
}

/// A step instance shared between its owner and the task running it. Every
/// clone drives the same underlying step.
///
/// The name and replayability are captured when the instance is shared, and
/// [`reset`](Step::reset) only marks the step for rewinding. The rewind
/// happens on the next advance, on the thread driving it, so a step may
/// restart the routine that is running it.
#[derive(Clone)]
pub struct Shared {
    inner: Arc<SharedStep>,
}

struct SharedStep {
    step: Mutex<Box<dyn Step>>,
    name: Cow<'static, str>,
    replayable: bool,
    rewind: AtomicBool,
}

impl Shared {
    pub fn new<S: Step + 'static>(step: S) -> Self {
        Self::from_boxed(Box::new(step))
    }

    pub fn from_boxed(step: Box<dyn Step>) -> Self {
        Self {
            inner: Arc::new(SharedStep {
                name: step.name(),
                replayable: step.is_replayable(),
                step: Mutex::new(step),
                rewind: AtomicBool::new(false),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &Shared) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Step for Shared {
    fn advance(&mut self) -> StepResult {
        let mut step = self.inner.step.lock();
        if self.inner.rewind.swap(false, Ordering::SeqCst) && self.inner.replayable {
            step.reset();
        }
        step.advance()
    }

    fn is_replayable(&self) -> bool {
        self.inner.replayable
    }

    fn reset(&mut self) {
        self.inner.rewind.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> Cow<'static, str> {
        self.inner.name.clone()
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&self.inner.name).finish()
    }
}

#[derive(Debug, Default)]
struct CatchState {
    finished: bool,
    succeeded: bool,
    error: Option<StepError>,
}

/// Read side of a [`Catching`] wrapper.
#[derive(Debug, Clone, Default)]
pub struct CatchReport {
    state: Arc<Mutex<CatchState>>,
}

impl CatchReport {
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn succeeded(&self) -> bool {
        self.state.lock().succeeded
    }

    pub fn failed(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Take the captured error, if any.
    pub fn take_error(&self) -> Option<StepError> {
        self.state.lock().error.take()
    }
}

/// Turns a failing step into a normally finishing one and records the
/// failure in a [`CatchReport`] instead of reaching the task's `on_fail`.
pub struct Catching<S> {
    inner: S,
    report: CatchReport,
}

impl<S: Step> Catching<S> {
    pub fn new(inner: S) -> (Self, CatchReport) {
        let report = CatchReport::default();
        (
            Self {
                inner,
                report: report.clone(),
            },
            report,
        )
    }
}

impl<S: Step> Step for Catching<S> {
    fn advance(&mut self) -> StepResult {
        match advance_guarded(&mut self.inner) {
            Ok(Yield::Done) => {
                let mut state = self.report.state.lock();
                state.finished = true;
                state.succeeded = true;
                Ok(Yield::Done)
            }
            Ok(other) => Ok(other),
            Err(e @ StepError::Rejected(_)) => Err(e),
            Err(e) => {
                let mut state = self.report.state.lock();
                state.finished = true;
                state.succeeded = false;
                state.error = Some(e);
                Ok(Yield::Done)
            }
        }
    }

    fn is_replayable(&self) -> bool {
        self.inner.is_replayable()
    }

    fn reset(&mut self) {
        *self.report.state.lock() = CatchState::default();
        self.inner.reset();
    }

    fn name(&self) -> Cow<'static, str> {
        self.inner.name()
    }
}

/// Stops the owning task (through its stop path) when the inner step has not
/// finished within `limit` of its first advance.
///
/// The inner step runs in a collection of its own, so nested work it yields
/// stays under the deadline too.
pub struct Timeout {
    inner: TaskCollection,
    name: Cow<'static, str>,
    limit: Duration,
    started_at: Option<Instant>,
}

impl Timeout {
    pub fn new<S: Step + 'static>(inner: S, limit: Duration) -> Self {
        Self {
            name: inner.name(),
            inner: TaskCollection::with_capacity(CollectionKind::Serial, 1).with(inner),
            limit,
            started_at: None,
        }
    }
}

impl Step for Timeout {
    fn advance(&mut self) -> StepResult {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if started_at.elapsed() >= self.limit {
            tracing::debug!(step = %self.name, limit = ?self.limit, "step timed out");
            return Ok(Yield::Break(BreakSignal::AndStop));
        }

        Ok(match self.inner.step()? {
            StepState { has_more: true, .. } => Yield::Continue,
            StepState {
                signal: BreakSignal::None,
                ..
            } => Yield::Done,
            StepState { signal, .. } => Yield::Break(signal),
        })
    }

    fn is_replayable(&self) -> bool {
        self.inner.is_replayable()
    }

    fn reset(&mut self) {
        self.started_at = None;
        self.inner.reset();
    }

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }
}

/// Finishes once `duration` has elapsed since its first advance.
#[derive(Debug, Clone)]
pub struct Sleep {
    duration: Duration,
    started_at: Option<Instant>,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started_at: None,
        }
    }
}

impl Step for Sleep {
    fn advance(&mut self) -> StepResult {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if started_at.elapsed() >= self.duration {
            Ok(Yield::Done)
        } else {
            Ok(Yield::Continue)
        }
    }

    fn is_replayable(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.started_at = None;
    }
}

/// Finishes on the first advance where `done` returns true.
pub struct WaitUntil<F> {
    done: F,
}

impl<F> WaitUntil<F>
where
    F: FnMut() -> bool + Send,
{
    pub fn new(done: F) -> Self {
        Self { done }
    }
}

impl<F> Step for WaitUntil<F>
where
    F: FnMut() -> bool + Send,
{
    fn advance(&mut self) -> StepResult {
        if (self.done)() {
            Ok(Yield::Done)
        } else {
            Ok(Yield::Continue)
        }
    }

    fn is_replayable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_from_iter_one_item_per_advance() -> anyhow::Result<()> {
        let mut step = from_iter(0..2);
        assert!(matches!(step.advance()?, Yield::Continue));
        assert!(matches!(step.advance()?, Yield::Continue));
        assert!(matches!(step.advance()?, Yield::Done));
        assert!(!step.is_replayable());
        Ok(())
    }

    #[test]
    fn test_factory_recreates_on_reset() -> anyhow::Result<()> {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let mut factory = Factory::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Work::step(Counting::new(1))
        });

        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(matches!(factory.advance()?, Yield::Done));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        factory.reset();
        assert!(matches!(factory.advance()?, Yield::Done));
        assert_eq!(built.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_shared_clones_drive_same_step() -> anyhow::Result<()> {
        let counting = Counting::new(3);
        let count = counting.counter();
        let shared = Shared::new(counting);
        let mut a = shared.clone();
        let mut b = shared.clone();

        a.advance()?;
        b.advance()?;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(a.ptr_eq(&b));
        Ok(())
    }

    #[test]
    fn test_catching_records_failure() -> anyhow::Result<()> {
        let (mut step, report) = Catching::new(step_fn(|| Err(anyhow!("nope").into())));

        assert!(matches!(step.advance()?, Yield::Done));
        assert!(report.is_finished());
        assert!(report.failed());
        assert!(!report.succeeded());
        assert!(matches!(report.take_error(), Some(StepError::Failed(_))));
        Ok(())
    }

    #[test]
    fn test_catching_records_panic() -> anyhow::Result<()> {
        let (mut step, report) = Catching::new(Panicking::new("kaboom"));

        assert!(matches!(step.advance()?, Yield::Done));
        assert!(matches!(report.take_error(), Some(StepError::Panicked(msg)) if msg == "kaboom"));
        Ok(())
    }

    #[test]
    fn test_catching_records_success() -> anyhow::Result<()> {
        let (mut step, report) = Catching::new(Counting::new(2));

        assert!(matches!(step.advance()?, Yield::Continue));
        assert!(!report.is_finished());
        assert!(matches!(step.advance()?, Yield::Done));
        assert!(report.succeeded());
        Ok(())
    }

    #[test]
    fn test_timeout_breaks_and_stops() -> anyhow::Result<()> {
        let mut step = Timeout::new(from_iter(std::iter::repeat(())), Duration::ZERO);
        assert!(matches!(
            step.advance()?,
            Yield::Break(BreakSignal::AndStop)
        ));
        Ok(())
    }

    #[test]
    fn test_timeout_passes_through_before_deadline() -> anyhow::Result<()> {
        let mut step = Timeout::new(Counting::new(1), Duration::from_secs(60));
        assert!(matches!(step.advance()?, Yield::Done));
        Ok(())
    }

    #[test]
    fn test_timeout_covers_nested_work() -> anyhow::Result<()> {
        let nested = Counting::new(1000);
        let count = nested.counter();
        let mut nested = Some(nested);

        let parent = step_fn(move || match nested.take() {
            Some(step) => Ok(Yield::Nested(Work::step(step))),
            None => Ok(Yield::Done),
        });
        let mut step = Timeout::new(parent, Duration::from_millis(50));

        assert!(matches!(step.advance()?, Yield::Continue));
        assert!(matches!(step.advance()?, Yield::Continue));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            step.advance()?,
            Yield::Break(BreakSignal::AndStop)
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_shared_reset_is_applied_on_next_advance() -> anyhow::Result<()> {
        let shared = Shared::new(Counting::new(2));
        let mut runner_side = shared.clone();
        let mut owner_side = shared.clone();

        assert!(matches!(runner_side.advance()?, Yield::Continue));

        // Resetting never waits for the instance, even while it is locked.
        let guard = shared.inner.step.lock();
        owner_side.reset();
        assert!(owner_side.is_replayable());
        assert!(owner_side.name().contains("Counting"));
        drop(guard);

        // Rewound: two more advances are needed.
        assert!(matches!(runner_side.advance()?, Yield::Continue));
        assert!(matches!(runner_side.advance()?, Yield::Done));
        Ok(())
    }

    #[test]
    fn test_sleep_zero_is_done_immediately() -> anyhow::Result<()> {
        let mut step = Sleep::new(Duration::ZERO);
        assert!(matches!(step.advance()?, Yield::Done));
        Ok(())
    }

    #[test]
    fn test_wait_until_polls_predicate() -> anyhow::Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        let observed = flag.clone();
        let mut step = WaitUntil::new(move || observed.load(Ordering::SeqCst));

        assert!(matches!(step.advance()?, Yield::Continue));
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(step.advance()?, Yield::Done));
        Ok(())
    }
}
