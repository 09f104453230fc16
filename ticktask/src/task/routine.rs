use crate::runtime::{Advance, Schedule};
use crate::step::{Shared, Step, Work};
use crate::task::core::TaskCore;
use crate::task::state::Snapshot;
use crate::task::{Callbacks, Continuation, Id, TaskError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Provider = Arc<dyn Fn() -> Work + Send + Sync>;

/// Bits a new run inherits: work set since the last `start` belongs to the
/// next one, and a restart queued meanwhile stays queued.
const KEPT_ON_RESTART: Snapshot = Snapshot::WORK_JUST_SET.union(Snapshot::PENDING_TASK);

#[derive(Clone)]
enum WorkSource {
    /// One instance, reset and replayed on every restart.
    Instance(Shared),

    /// A fresh work item per run.
    Provider(Provider),
}

/// A restart requested while a stop was still in flight. Activated by the
/// advance that observes the stop.
struct PendingRun {
    work: Work,
    callbacks: Callbacks,
    continuation: Continuation,
}

/// A named, reusable task owned by the caller.
///
/// Work set with [`set_work`](TaskRoutine::set_work) or
/// [`set_work_provider`](TaskRoutine::set_work_provider) only takes effect on
/// the next [`start`](TaskRoutine::start). Calling `start` on a live run
/// restarts it in place without resubmitting it; calling `start` right after
/// `stop` queues the new run until the stop has been observed.
///
/// Clones share the same routine.
#[derive(Clone)]
pub struct TaskRoutine {
    inner: Arc<RoutineInner>,
}

struct RoutineInner {
    core: TaskCore,

    runner: Mutex<Option<Arc<dyn Schedule>>>,

    source: Mutex<Option<WorkSource>>,

    callbacks: Mutex<Callbacks>,

    pending: Mutex<Option<PendingRun>>,

    /// Set while the routine sits in a runner's inbound queue or active set.
    /// Whoever flips it from `false` to `true` owns the submission.
    scheduled: AtomicBool,
}

impl TaskRoutine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RoutineInner {
                core: TaskCore::new(),
                runner: Mutex::new(None),
                source: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
                pending: Mutex::new(None),
                scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_runner<R: Schedule + 'static>(runner: R) -> Self {
        let routine = Self::new();
        routine.set_runner(runner);
        routine
    }

    pub fn set_runner<R: Schedule + 'static>(&self, runner: R) {
        *self.inner.runner.lock() = Some(Arc::new(runner));
    }

    pub fn id(&self) -> Id {
        self.inner.core.id()
    }

    /// Use `step` as the routine's work. Restarts reset and replay this same
    /// instance, so it must be replayable unless it is only started once.
    pub fn set_work<S: Step + 'static>(&self, step: S) -> &Self {
        self.set_shared(Shared::new(step))
    }

    /// Like [`set_work`](TaskRoutine::set_work) with an instance the caller
    /// keeps a handle to. Setting the instance already in use is a no-op.
    pub fn set_shared(&self, step: Shared) -> &Self {
        let mut source = self.inner.source.lock();

        let same = matches!(&*source, Some(WorkSource::Instance(current)) if current.ptr_eq(&step));
        if !same {
            self.inner.core.state().set(Snapshot::WORK_JUST_SET);
        }

        *source = Some(WorkSource::Instance(step));
        self
    }

    /// Create fresh work for every run. Any work can be restarted this way.
    pub fn set_work_provider<F>(&self, provider: F) -> &Self
    where
        F: Fn() -> Work + Send + Sync + 'static,
    {
        *self.inner.source.lock() = Some(WorkSource::Provider(Arc::new(provider)));
        self
    }

    pub fn start(&self) -> Result<Continuation, TaskError> {
        self.start_with(Callbacks::default())
    }

    /// Start or restart the routine with `callbacks` for the new run.
    ///
    /// Fails without touching the routine when no runner or work is set, or
    /// when restarting would replay a non-replayable instance.
    pub fn start_with(&self, callbacks: Callbacks) -> Result<Continuation, TaskError> {
        let inner = &self.inner;
        let core = &inner.core;

        let runner = inner.runner.lock().clone().ok_or(TaskError::MissingRunner)?;
        let source = inner.source.lock().clone().ok_or(TaskError::MissingWork)?;

        let just_set = core.snapshot().is_work_just_set();
        if !just_set && matches!(&source, WorkSource::Instance(step) if !step.is_replayable()) {
            return Err(TaskError::NotReplayable {
                task: core.task_name(),
            });
        }

        core.state().set(Snapshot::PAUSED);
        core.notify_interrupted();

        let work = inner.next_work(source, just_set);
        let snapshot = core.snapshot();

        if snapshot.is_running() && snapshot.is_explicitly_stopped() {
            return Ok(inner.queue_pending(&*runner, work, callbacks));
        }

        core.install(work);
        *inner.callbacks.lock() = callbacks;

        if core.snapshot().is_running() {
            tracing::debug!(task = %core.id(), "routine restarted in place");
            core.state().set_paused(false);
            return Ok(core.continuation());
        }

        let continuation = core.renew_continuation();
        core.state().replace_keeping(Snapshot::STARTED, KEPT_ON_RESTART);
        tracing::debug!(task = %core.id(), runner = runner.name(), "routine started");

        if !inner.scheduled.swap(true, Ordering::SeqCst) {
            if let Err(e) = runner.submit(inner.clone()) {
                inner.scheduled.store(false, Ordering::SeqCst);
                core.state().set(Snapshot::COMPLETED);
                continuation.complete();
                return Err(e);
            }
        }

        Ok(continuation)
    }

    /// Stop advancing the work. The routine stays scheduled.
    pub fn pause(&self) {
        self.inner.core.state().set_paused(true);
    }

    pub fn resume(&self) {
        self.inner.core.state().set_paused(false);
    }

    /// Request a cooperative stop, observed by the next advance. A paused
    /// routine observes it once resumed.
    pub fn stop(&self) {
        self.inner.core.stop();
    }

    /// Register a listener fired once on the next stop or restart.
    pub fn on_interrupted<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.core.on_interrupted(Box::new(f));
    }

    pub fn is_running(&self) -> bool {
        self.inner.core.snapshot().is_running()
    }

    pub fn is_done(&self) -> bool {
        self.inner.core.snapshot().is_done()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.core.snapshot().is_paused()
    }

    pub fn state(&self) -> Snapshot {
        self.inner.core.snapshot()
    }
}

impl Default for TaskRoutine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRoutine")
            .field("core", &self.inner.core)
            .field("scheduled", &self.inner.scheduled.load(Ordering::SeqCst))
            .finish()
    }
}

impl RoutineInner {
    fn next_work(&self, source: WorkSource, just_set: bool) -> Work {
        match source {
            WorkSource::Instance(mut step) => {
                let just_set = self.core.state().take(Snapshot::WORK_JUST_SET) || just_set;
                if !just_set {
                    step.reset();
                }
                Work::step(step)
            }
            WorkSource::Provider(provider) => provider(),
        }
    }

    /// Stash `work` behind the in-flight stop and hand out the continuation of
    /// the queued run.
    fn queue_pending(
        self: &Arc<Self>,
        runner: &dyn Schedule,
        work: Work,
        callbacks: Callbacks,
    ) -> Continuation {
        let continuation = Continuation::new();

        let superseded = self.pending.lock().replace(PendingRun {
            work,
            callbacks,
            continuation: continuation.clone(),
        });
        if let Some(superseded) = superseded {
            // Never activated, resolve it so that nobody waits forever.
            superseded.continuation.complete();
        }

        self.core.state().set(Snapshot::PENDING_TASK);
        self.core.state().set_paused(false);
        tracing::debug!(task = %self.core.id(), "restart queued behind stop");

        // The stop may have been observed while we were queueing. Whoever wins
        // `scheduled` activates the queued run.
        if !self.scheduled.swap(true, Ordering::SeqCst) && self.activate_pending() {
            if let Err(e) = runner.submit(self.clone()) {
                tracing::error!(task = %self.core.id(), error = %e, "failed to resubmit routine");
                self.scheduled.store(false, Ordering::SeqCst);
                self.core.state().set(Snapshot::COMPLETED);
                continuation.complete();
            }
        }

        continuation
    }

    /// Swap the queued run in. Returns false when nothing was queued.
    fn activate_pending(&self) -> bool {
        if !self.core.state().take(Snapshot::PENDING_TASK) {
            return false;
        }

        let Some(pending) = self.pending.lock().take() else {
            return false;
        };

        self.core.install(pending.work);
        *self.callbacks.lock() = pending.callbacks;
        self.core.replace_continuation(pending.continuation);
        self.core.clear_listeners();
        self.core.state().replace_keeping(Snapshot::STARTED, KEPT_ON_RESTART);

        tracing::debug!(task = %self.core.id(), "queued restart activated");
        true
    }
}

impl Advance for RoutineInner {
    fn advance(&self) -> Result<bool, TaskError> {
        let run = self.core.continuation();
        let callbacks = self.callbacks.lock().clone();

        let keep = match self.core.advance(&callbacks) {
            Ok(keep) => keep,
            Err(e) => {
                self.scheduled.store(false, Ordering::SeqCst);
                run.complete();
                return Err(e);
            }
        };

        if keep {
            return Ok(true);
        }

        if self.activate_pending() {
            // The old run resolves the moment the new one takes over.
            run.complete();
            return Ok(true);
        }

        run.complete();
        self.scheduled.store(false, Ordering::SeqCst);

        // A concurrent `start` saw us scheduled and skipped submission.
        let snapshot = self.core.snapshot();
        if (snapshot.is_running() || snapshot.has_pending_task())
            && !self.scheduled.swap(true, Ordering::SeqCst)
        {
            if snapshot.has_pending_task() {
                self.activate_pending();
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn id(&self) -> Id {
        self.core.id()
    }
}
