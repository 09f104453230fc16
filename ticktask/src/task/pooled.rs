use crate::runtime::{Advance, Schedule};
use crate::step::Work;
use crate::task::core::TaskCore;
use crate::task::state::Snapshot;
use crate::task::{Callbacks, Continuation, Id, TaskError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use slab::Slab;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A concurrent free-list of reusable task slots.
///
/// Slots are indexed by a stable key and never freed while the pool lives.
/// A slot goes back on the free list only after its mandatory reset, so it is
/// never idle in the pool and scheduled on a runner at the same time.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    slots: Mutex<Slots>,
}

struct Slots {
    entries: Slab<Arc<PooledEntry>>,
    free: Vec<usize>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a pool with `capacity` slots ready to be acquired.
    pub fn with_capacity(capacity: usize) -> Self {
        let pool = TaskPool {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots {
                    entries: Slab::with_capacity(capacity),
                    free: Vec::with_capacity(capacity),
                }),
            }),
        };

        {
            let mut slots = pool.inner.slots.lock();
            for _ in 0..capacity {
                let key = pool.insert_entry(&mut slots);
                slots.free.push(key);
            }
        }

        pool
    }

    /// Borrow an idle slot, growing the pool when none is free.
    pub fn acquire(&self) -> PooledTask {
        let mut slots = self.inner.slots.lock();

        let key = match slots.free.pop() {
            Some(key) => key,
            None => self.insert_entry(&mut slots),
        };

        let entry = slots.entries[key].clone();
        drop(slots);

        let was_idle = entry.in_pool.swap(false, Ordering::SeqCst);
        debug_assert!(was_idle, "acquired task slot {} was not in the pool", key);

        let generation = *entry.generation.read();
        PooledTask {
            generation,
            entry,
            started: AtomicBool::new(false),
        }
    }

    /// Number of slots ever created.
    pub fn capacity(&self) -> usize {
        self.inner.slots.lock().entries.len()
    }

    /// Number of slots waiting to be acquired.
    pub fn idle(&self) -> usize {
        self.inner.slots.lock().free.len()
    }

    fn insert_entry(&self, slots: &mut Slots) -> usize {
        let vacant = slots.entries.vacant_entry();
        let key = vacant.key();

        vacant.insert(Arc::new(PooledEntry {
            core: TaskCore::new(),
            key,
            generation: RwLock::new(0),
            callbacks: Mutex::new(Callbacks::default()),
            in_pool: AtomicBool::new(true),
            pool: Arc::downgrade(&self.inner),
        }));

        key
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock();
        f.debug_struct("TaskPool")
            .field("capacity", &slots.entries.len())
            .field("idle", &slots.free.len())
            .finish()
    }
}

impl PoolInner {
    fn release(&self, key: usize) {
        self.slots.lock().free.push(key);
    }
}

/// The runner-facing half of a pooled slot.
pub(crate) struct PooledEntry {
    core: TaskCore,

    key: usize,

    /// Bumped on every recycle, so that handles from a previous run turn stale.
    /// Handles hold the read side while they act on the slot, so a recycle
    /// never lands between their staleness check and the action.
    generation: RwLock<u64>,

    callbacks: Mutex<Callbacks>,

    in_pool: AtomicBool,

    pool: Weak<PoolInner>,
}

impl PooledEntry {
    /// Complete the run and hand the slot back. Everything the run retained is
    /// released first.
    fn recycle(&self, run: &Continuation) {
        run.complete();
        self.release();
    }

    fn release(&self) {
        {
            let mut generation = self.generation.write();
            self.core.reset_for_reuse();
            *self.callbacks.lock() = Callbacks::default();
            *generation += 1;
        }

        let was_idle = self.in_pool.swap(true, Ordering::SeqCst);
        debug_assert!(!was_idle, "task slot {} recycled twice", self.key);

        tracing::trace!(task = %self.core.id(), slot = self.key, "task returned to pool");

        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.key);
        }
    }
}

impl Advance for PooledEntry {
    fn advance(&self) -> Result<bool, TaskError> {
        let run = self.core.continuation();
        let callbacks = self.callbacks.lock().clone();

        match self.core.advance(&callbacks) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.recycle(&run);
                Ok(false)
            }
            Err(e) => {
                // The runner drops us on a fault, so the slot must not leak.
                self.recycle(&run);
                Err(e)
            }
        }
    }

    fn id(&self) -> Id {
        self.core.id()
    }
}

/// A task borrowed from a [`TaskPool`].
///
/// The handle is valid for one run. Once the task finishes the slot returns
/// to the pool and every operation on this handle reports it as stale.
pub struct PooledTask {
    entry: Arc<PooledEntry>,
    generation: u64,

    /// Whether this handle ever handed the slot to a runner.
    started: AtomicBool,
}

impl PooledTask {
    pub fn id(&self) -> Id {
        self.entry.core.id()
    }

    /// Whether the slot was recycled since this handle was acquired.
    pub fn is_stale(&self) -> bool {
        *self.entry.generation.read_recursive() != self.generation
    }

    pub fn start<R>(&self, runner: &R, work: impl Into<Work>) -> Result<Continuation, TaskError>
    where
        R: Schedule + ?Sized,
    {
        self.start_with(runner, work, Callbacks::default())
    }

    /// Start the task on `runner` and return the continuation of the run.
    pub fn start_with<R>(
        &self,
        runner: &R,
        work: impl Into<Work>,
        callbacks: Callbacks,
    ) -> Result<Continuation, TaskError>
    where
        R: Schedule + ?Sized,
    {
        let core = &self.entry.core;

        let continuation = {
            let _fresh = self.lock_fresh()?;

            core.state()
                .transition(Snapshot::empty(), Snapshot::STARTED | Snapshot::PAUSED)
                .map_err(|_| TaskError::AlreadyStarted {
                    task: core.task_name(),
                })?;
            self.started.store(true, Ordering::SeqCst);

            let continuation = core.renew_continuation();
            core.install(work.into());
            *self.entry.callbacks.lock() = callbacks;
            core.state().set_paused(false);
            continuation
        };

        tracing::debug!(task = %core.id(), runner = runner.name(), "pooled task started");

        if let Err(e) = runner.submit(self.entry.clone()) {
            self.entry.recycle(&continuation);
            return Err(e);
        }

        Ok(continuation)
    }

    /// Request a cooperative stop. No-op on a stale handle.
    pub fn stop(&self) {
        let Ok(_fresh) = self.lock_fresh() else {
            tracing::trace!(task = %self.id(), "ignoring stop on stale handle");
            return;
        };
        self.entry.core.stop();
    }

    /// Register a listener fired once when the task is stopped.
    pub fn on_interrupted<F>(&self, f: F) -> Result<(), TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        let _fresh = self.lock_fresh()?;
        self.entry.core.on_interrupted(Box::new(f));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_fresh()
            .is_ok_and(|_fresh| self.entry.core.snapshot().is_running())
    }

    /// A stale handle reports done: the run it belonged to has finished.
    pub fn is_done(&self) -> bool {
        self.lock_fresh()
            .map_or(true, |_fresh| self.entry.core.snapshot().is_done())
    }

    /// Pin the slot to this handle's run. The slot cannot be recycled while
    /// the guard is held. Listeners fired under the guard may use the handle
    /// again, hence the recursive read.
    fn lock_fresh(&self) -> Result<RwLockReadGuard<'_, u64>, TaskError> {
        let generation = self.entry.generation.read_recursive();
        if *generation == self.generation {
            Ok(generation)
        } else {
            Err(TaskError::Stale { task: self.id() })
        }
    }
}

impl Drop for PooledTask {
    fn drop(&mut self) {
        // A handle that was never started still owns its slot.
        if !self.started.load(Ordering::SeqCst) {
            self.entry.release();
        }
    }
}

impl fmt::Debug for PooledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTask")
            .field("core", &self.entry.core)
            .field("slot", &self.entry.key)
            .field("generation", &self.generation)
            .finish()
    }
}
