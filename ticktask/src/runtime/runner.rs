use crate::runtime::{Advance, RunnerConfig, Schedule};
use crate::task::TaskError;
use crate::utils::ScopeGuard;
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// A runner driven by the caller, one tick per [`Runner::drive_once`].
///
/// Clones share the same queues. Submitting is safe from any thread, but only
/// one thread may drive the runner at a time.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: RunnerConfig,

    /// Newly started tasks, drained at the start of every tick.
    inbound: Injector<Arc<dyn Advance>>,

    /// Only locked by the driving thread.
    active: Mutex<Vec<Arc<dyn Advance>>>,

    /// Mirrors `active.len()` so that it can be read while a tick is running.
    num_active: AtomicUsize,

    /// Set by `request_stop`. While set, nothing new is drained.
    flushing: AtomicBool,

    /// Set on shutdown. Unlike `flushing` it is never cleared.
    closed: AtomicBool,

    driving: AtomicBool,

    ticks: AtomicU64,
}

impl Runner {
    pub(crate) fn new(cfg: RunnerConfig) -> Self {
        tracing::debug!(runner = %cfg.name, "runner created");

        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(Vec::with_capacity(cfg.initial_capacity)),
                cfg,
                inbound: Injector::new(),
                num_active: AtomicUsize::new(0),
                flushing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                driving: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn cfg(&self) -> &RunnerConfig {
        &self.inner.cfg
    }

    /// Run one tick and return the number of tasks still active.
    ///
    /// Every active task is advanced exactly once, in the order it was
    /// drained. A task that faults is removed and the first fault of the
    /// tick is returned after all tasks were advanced.
    pub fn drive_once(&self) -> Result<usize, TaskError> {
        let inner = &self.inner;

        if inner.driving.swap(true, Ordering::AcqRel) {
            return Err(TaskError::AlreadyDriving {
                runner: inner.cfg.name.clone(),
            });
        }
        let _guard = ScopeGuard::new(|| inner.driving.store(false, Ordering::Release));

        let mut active = inner.active.lock();

        if !self.is_flushing() && !inner.closed.load(Ordering::Acquire) {
            loop {
                match inner.inbound.steal() {
                    Steal::Success(task) => active.push(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        let mut fault = None;
        active.retain(|task| match task.advance() {
            Ok(keep) => keep,
            Err(e) => {
                tracing::error!(
                    runner = %inner.cfg.name,
                    task = %task.id(),
                    error = %e,
                    "removing faulted task"
                );
                fault.get_or_insert(e);
                false
            }
        });

        let remaining = active.len();
        inner.num_active.store(remaining, Ordering::Release);
        inner.ticks.fetch_add(1, Ordering::Relaxed);

        if remaining == 0 && inner.flushing.swap(false, Ordering::AcqRel) {
            tracing::debug!(runner = %inner.cfg.name, "flush complete");
        }

        match fault {
            Some(e) => Err(e),
            None => Ok(remaining),
        }
    }

    /// Drive until nothing is active or queued, at most `max_ticks` times.
    /// Returns the number of ticks run.
    pub fn run_until_idle(&self, max_ticks: usize) -> Result<usize, TaskError> {
        for tick in 0..max_ticks {
            if self.is_idle() {
                return Ok(tick);
            }
            self.drive_once()?;
        }
        Ok(max_ticks)
    }

    /// Stop accepting new tasks until the active ones have finished on their
    /// own. Tasks submitted meanwhile wait in the inbound queue.
    pub fn request_stop(&self) {
        if !self.inner.flushing.swap(true, Ordering::AcqRel) {
            tracing::debug!(runner = %self.inner.cfg.name, "flush requested");
        }
    }

    /// Never drain the inbound queue again. Active tasks keep running.
    pub(crate) fn close_inbound(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(runner = %self.inner.cfg.name, "inbound queue closed");
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn num_active(&self) -> usize {
        self.inner.num_active.load(Ordering::Acquire)
    }

    /// Tasks submitted but not yet drained.
    pub fn num_pending(&self) -> usize {
        self.inner.inbound.len()
    }

    pub fn is_idle(&self) -> bool {
        self.num_active() == 0 && self.inner.inbound.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.inner.cfg.name
    }
}

impl Schedule for Runner {
    fn submit(&self, task: Arc<dyn Advance>) -> Result<(), TaskError> {
        tracing::trace!(runner = %self.inner.cfg.name, task = %task.id(), "task submitted");
        self.inner.inbound.push(task);
        Ok(())
    }

    fn name(&self) -> &str {
        Runner::name(self)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.inner.cfg.name)
            .field("num_active", &self.num_active())
            .field("num_pending", &self.num_pending())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}
