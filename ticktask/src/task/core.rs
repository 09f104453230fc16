use crate::step::{BreakSignal, CollectionKind, StepError, TaskCollection, Work, panic_message};
use crate::task::error::TaskName;
use crate::task::state::{Snapshot, State};
use crate::task::{Callbacks, Continuation, Id, TaskError};
use anyhow::anyhow;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) type Listener = Box<dyn FnOnce() + Send>;

/// Engine shared by both handle flavours: one state block, one continuation
/// and the active collection, advanced one step per call.
///
/// `advance` is only called from the runner's driving thread. Everything else
/// may be called from any thread, and no lock is held while user code runs.
pub(crate) struct TaskCore {
    id: Id,

    name: Mutex<Cow<'static, str>>,

    state: State,

    continuation: Mutex<Continuation>,

    /// The stacking collection. Taken out while it is being advanced so that
    /// `start` on another thread never blocks behind a long step.
    work: Mutex<Option<TaskCollection>>,

    /// Bumped every time new work is installed. An advance that started on
    /// replaced work discards its outcome.
    epoch: AtomicU64,

    /// Fired on stop and restart so that a caller can cancel an in-flight
    /// wait that lives outside of the step.
    listeners: Mutex<SmallVec<[Listener; 2]>>,
}

impl TaskCore {
    pub(crate) fn new() -> Self {
        Self {
            id: Id::next(),
            name: Mutex::new(Cow::Borrowed("")),
            state: State::new(),
            continuation: Mutex::new(Continuation::new()),
            work: Mutex::new(None),
            epoch: AtomicU64::new(0),
            listeners: Mutex::new(SmallVec::new()),
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.state.load()
    }

    pub(crate) fn task_name(&self) -> TaskName {
        TaskName {
            id: self.id,
            name: self.name.lock().clone(),
        }
    }

    pub(crate) fn continuation(&self) -> Continuation {
        self.continuation.lock().clone()
    }

    /// Install a fresh continuation for a new run and return it.
    pub(crate) fn renew_continuation(&self) -> Continuation {
        self.replace_continuation(Continuation::new())
    }

    /// Install `next`. The replaced continuation belongs to a run that is over
    /// or superseded, so it resolves here.
    pub(crate) fn replace_continuation(&self, next: Continuation) -> Continuation {
        let previous = std::mem::replace(&mut *self.continuation.lock(), next.clone());
        previous.complete();
        next
    }

    /// Make `work` the active collection. A single step is wrapped in a serial
    /// collection of one, reusing the previous collection's allocation.
    pub(crate) fn install(&self, work: Work) {
        *self.name.lock() = work.name();

        let mut slot = self.work.lock();
        match work {
            Work::Single(step) => match slot.as_mut() {
                Some(collection) if collection.kind() == CollectionKind::Serial => {
                    collection.clear();
                    collection.add_boxed(step);
                }
                _ => {
                    let mut collection = TaskCollection::with_capacity(CollectionKind::Serial, 1);
                    collection.add_boxed(step);
                    *slot = Some(collection);
                }
            },
            Work::Collection(collection) => *slot = Some(collection),
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop everything a finished run retained so that the handle is
    /// indistinguishable from a fresh one.
    pub(crate) fn reset_for_reuse(&self) {
        self.state.replace(Snapshot::empty());

        if let Some(collection) = self.work.lock().as_mut() {
            collection.clear();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        self.clear_listeners();
        *self.name.lock() = Cow::Borrowed("");
    }

    pub(crate) fn has_work(&self) -> bool {
        self.work
            .lock()
            .as_ref()
            .is_some_and(|collection| !collection.is_empty())
    }

    pub(crate) fn stop(&self) {
        let prev = self.state.set(Snapshot::EXPLICITLY_STOPPED);
        if !prev.is_explicitly_stopped() {
            tracing::debug!(task = %self.id, "stop requested");
        }
        self.notify_interrupted();
    }

    pub(crate) fn on_interrupted(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Fire and clear the interrupted listeners. A panicking listener is
    /// logged and does not prevent the others from running.
    pub(crate) fn notify_interrupted(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(listener)) {
                tracing::error!(
                    task = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "interrupted listener panicked"
                );
            }
        }
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Advance the task one step.
    ///
    /// Returns `Ok(false)` once the task finished this round. The only error
    /// is an internal fault, the task's own failures go to `on_fail`.
    pub(crate) fn advance(&self, callbacks: &Callbacks) -> Result<bool, TaskError> {
        let snapshot = self.state.load();

        if !snapshot.is_started() {
            let err = TaskError::NotStarted {
                task: self.task_name(),
            };
            tracing::error!(task = %self.id, error = %err, "internal fault");
            return Err(err);
        }

        if !snapshot.should_advance() {
            return Ok(!snapshot.is_finished());
        }

        if snapshot.is_explicitly_stopped() {
            self.state.set(Snapshot::COMPLETED);
            tracing::debug!(task = %self.id, "task stopped");
            self.invoke_on_stop(callbacks);
            return Ok(!self.state.load().is_finished());
        }

        let epoch = self.epoch.load(Ordering::SeqCst);

        let Some(mut collection) = self.work.lock().take() else {
            let err = TaskError::Internal(anyhow!("task {} is started without work", self.id));
            tracing::error!(task = %self.id, error = %err, "internal fault");
            return Err(err);
        };

        let res = collection.step();

        {
            let mut slot = self.work.lock();
            if slot.is_none() {
                *slot = Some(collection);
            }
        }

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::trace!(task = %self.id, "work replaced while advancing");
            return Ok(true);
        }

        match res {
            Ok(state) if state.signal == BreakSignal::AndStop && callbacks.on_stop.is_some() => {
                self.state.set(Snapshot::COMPLETED);
                tracing::debug!(task = %self.id, "task broke and stopped");
                self.invoke_on_stop(callbacks);
            }
            Ok(state) => {
                if !state.has_more {
                    self.state.set(Snapshot::COMPLETED);
                    tracing::trace!(task = %self.id, "task completed");
                }
            }
            Err(StepError::Rejected(rejection)) => {
                self.state.set(Snapshot::COMPLETED);
                tracing::warn!(task = %self.id, %rejection, "nested work rejected");
            }
            Err(source) => {
                self.state.set(Snapshot::COMPLETED);
                let err = TaskError::StepFailed {
                    task: self.task_name(),
                    source,
                };
                self.invoke_on_fail(callbacks, err);
            }
        }

        if self.epoch.load(Ordering::SeqCst) != epoch {
            // A restart installed new work while this run was finishing.
            tracing::trace!(task = %self.id, "work replaced while finishing");
            self.state.unset(Snapshot::COMPLETED);
            return Ok(true);
        }

        Ok(!self.state.load().is_finished())
    }

    fn invoke_on_stop(&self, callbacks: &Callbacks) {
        let Some(on_stop) = &callbacks.on_stop else {
            return;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_stop())) {
            tracing::error!(
                task = %self.id,
                panic = %panic_message(payload.as_ref()),
                "on_stop callback panicked"
            );
        }
    }

    fn invoke_on_fail(&self, callbacks: &Callbacks, err: TaskError) {
        let Some(on_fail) = &callbacks.on_fail else {
            tracing::error!(task = %self.id, error = %err, "task failed");
            return;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_fail(err))) {
            tracing::error!(
                task = %self.id,
                panic = %panic_message(payload.as_ref()),
                "on_fail callback panicked"
            );
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("state", &self.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{BreakSignal, Yield, step_fn};
    use crate::test_utils::{Counting, Failing, Panicking};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started(work: impl Into<Work>) -> TaskCore {
        let core = TaskCore::new();
        core.install(work.into());
        core.state().replace(Snapshot::STARTED);
        core
    }

    #[test]
    fn test_advance_unstarted_is_internal_fault() {
        let core = TaskCore::new();
        core.install(Work::step(Counting::new(1)));

        let err = core.advance(&Callbacks::default()).unwrap_err();
        assert!(matches!(err, TaskError::NotStarted { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_advance_until_done() -> anyhow::Result<()> {
        let step = Counting::new(2);
        let counter = step.counter();
        let core = started(Work::step(step));

        assert!(core.advance(&Callbacks::default())?);
        assert!(!core.advance(&Callbacks::default())?);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(core.snapshot().is_done());

        // Completed tasks are not advanced again.
        assert!(!core.advance(&Callbacks::default())?);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_paused_never_advances_work() -> anyhow::Result<()> {
        let step = Counting::new(2);
        let counter = step.counter();
        let core = started(Work::step(step));
        core.state().set_paused(true);

        for _ in 0..5 {
            assert!(core.advance(&Callbacks::default())?);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        core.state().set_paused(false);
        assert!(core.advance(&Callbacks::default())?);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_stop_takes_stop_path() -> anyhow::Result<()> {
        let step = Counting::new(10);
        let counter = step.counter();
        let core = started(Work::step(step));

        let stops = Arc::new(AtomicUsize::new(0));
        let stops_clone = stops.clone();
        let callbacks = Callbacks::new().on_stop(move || {
            stops_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(core.advance(&callbacks)?);
        core.stop();
        assert!(!core.advance(&callbacks)?);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(core.snapshot().is_explicitly_stopped());
        Ok(())
    }

    #[test]
    fn test_failure_calls_on_fail_with_wrapped_error() -> anyhow::Result<()> {
        let core = started(Work::step(Failing::new("disk full")));

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();
        let callbacks = Callbacks::new().on_fail(move |err| {
            *seen_clone.lock() = Some(err.to_string());
        });

        assert!(!core.advance(&callbacks)?);
        let msg = seen.lock().take().expect("on_fail was not called");
        assert!(msg.contains("disk full"));
        assert!(core.snapshot().is_done());
        Ok(())
    }

    #[test]
    fn test_work_installed_while_finishing_keeps_task() -> anyhow::Result<()> {
        let core = Arc::new(started(Work::step(Failing::new("lost lease"))));
        let next = Counting::new(1);
        let counter = next.counter();

        let restart = Arc::downgrade(&core);
        let next = parking_lot::Mutex::new(Some(next));
        let callbacks = Callbacks::new().on_fail(move |_| {
            if let (Some(core), Some(step)) = (restart.upgrade(), next.lock().take()) {
                core.install(Work::step(step));
            }
        });

        // The failed run is replaced, not finished.
        assert!(core.advance(&callbacks)?);
        assert!(core.snapshot().is_running());

        assert!(!core.advance(&callbacks)?);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_failure_without_on_fail_still_completes() -> anyhow::Result<()> {
        let core = started(Work::step(Panicking::new("boom")));
        assert!(!core.advance(&Callbacks::default())?);
        assert!(core.snapshot().is_done());
        Ok(())
    }

    #[test]
    fn test_panicking_callbacks_are_isolated() -> anyhow::Result<()> {
        let callbacks = Callbacks::new()
            .on_fail(|_| panic!("on_fail is broken"))
            .on_stop(|| panic!("on_stop is broken"));

        let failing = started(Work::step(Failing::new("x")));
        assert!(!failing.advance(&callbacks)?);

        let stopped = started(Work::step(Counting::new(3)));
        stopped.stop();
        assert!(!stopped.advance(&callbacks)?);
        assert!(stopped.snapshot().is_done());
        Ok(())
    }

    #[test]
    fn test_break_and_stop_calls_on_stop() -> anyhow::Result<()> {
        let core = started(Work::step(step_fn(|| Ok(Yield::Break(BreakSignal::AndStop)))));

        let stops = Arc::new(AtomicUsize::new(0));
        let stops_clone = stops.clone();
        let callbacks = Callbacks::new().on_stop(move || {
            stops_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!core.advance(&callbacks)?);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_rejection_completes_without_on_fail() -> anyhow::Result<()> {
        fn nest_forever() -> Work {
            Work::step(step_fn(|| Ok(Yield::Nested(nest_forever()))))
        }

        let core = started(nest_forever());
        let fails = Arc::new(AtomicUsize::new(0));
        let fails_clone = fails.clone();
        let callbacks = Callbacks::new().on_fail(move |_| {
            fails_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut ticks = 0;
        while core.advance(&callbacks)? {
            ticks += 1;
            assert!(ticks < 100, "rejection never surfaced");
        }
        assert_eq!(fails.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_listeners_fire_once_on_stop() {
        let core = started(Work::step(Counting::new(3)));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let fired = fired.clone();
            core.on_interrupted(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        core.on_interrupted(Box::new(|| panic!("listener is broken")));

        core.stop();
        core.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(core.listener_count(), 0);
    }

    #[test]
    fn test_reset_for_reuse_clears_everything() -> anyhow::Result<()> {
        let core = started(Work::step(Counting::new(1)));
        core.on_interrupted(Box::new(|| {}));
        assert!(!core.advance(&Callbacks::default())?);

        core.reset_for_reuse();
        assert_eq!(core.snapshot(), Snapshot::empty());
        assert!(!core.has_work());
        assert_eq!(core.listener_count(), 0);
        assert_eq!(core.task_name().name, "");
        Ok(())
    }
}
