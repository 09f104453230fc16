//! Atomic lifecycle bits of a task.
//!
//! `advance` runs on the runner's driving thread while `start`, `pause`,
//! `resume` and `stop` may be called from any thread, so every read and write
//! goes through a single `AtomicU8` with sequentially consistent ordering.
use bitflags::bitflags;
use std::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct Snapshot: u8 {
        /// The task will not be advanced again until its state is replaced.
        const COMPLETED = 1;

        /// Set by `start`; advancing before this is set is a bug.
        const STARTED = 1 << 1;

        /// `stop` was requested. Sticky until the state is replaced.
        const EXPLICITLY_STOPPED = 1 << 2;

        /// The routine's work instance was replaced since the last `start`.
        const WORK_JUST_SET = 1 << 3;

        const PAUSED = 1 << 4;

        /// A restart arrived while a stop was still in flight.
        const PENDING_TASK = 1 << 5;
    }
}

impl Snapshot {
    pub fn is_completed(self) -> bool {
        self.contains(Snapshot::COMPLETED)
    }

    pub fn is_started(self) -> bool {
        self.contains(Snapshot::STARTED)
    }

    pub fn is_paused(self) -> bool {
        self.contains(Snapshot::PAUSED)
    }

    pub fn is_explicitly_stopped(self) -> bool {
        self.contains(Snapshot::EXPLICITLY_STOPPED)
    }

    pub fn has_pending_task(self) -> bool {
        self.contains(Snapshot::PENDING_TASK)
    }

    pub fn is_work_just_set(self) -> bool {
        self.contains(Snapshot::WORK_JUST_SET)
    }

    /// Started and not completed.
    pub fn is_running(self) -> bool {
        self.is_started() && !self.is_completed()
    }

    /// Started and completed.
    pub fn is_done(self) -> bool {
        self.is_started() && self.is_completed()
    }

    /// Neither completed nor paused: the next advance steps the work.
    pub fn should_advance(self) -> bool {
        !self.intersects(Snapshot::COMPLETED | Snapshot::PAUSED)
    }

    /// Completed and not paused: the runner drops the task.
    pub fn is_finished(self) -> bool {
        self.is_completed() && !self.is_paused()
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    val: AtomicU8,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Snapshot {
        Snapshot::from_bits_retain(self.val.load(Ordering::SeqCst))
    }

    /// Set `bits`, returning the snapshot from before the update.
    pub fn set(&self, bits: Snapshot) -> Snapshot {
        Snapshot::from_bits_retain(self.val.fetch_or(bits.bits(), Ordering::SeqCst))
    }

    /// Clear `bits`, returning the snapshot from before the update.
    pub fn unset(&self, bits: Snapshot) -> Snapshot {
        Snapshot::from_bits_retain(self.val.fetch_and(!bits.bits(), Ordering::SeqCst))
    }

    /// Clear `bits` and report whether they were all set.
    pub fn take(&self, bits: Snapshot) -> bool {
        self.unset(bits).contains(bits)
    }

    /// Replace the whole state, used when a handle is reused.
    pub fn replace(&self, bits: Snapshot) -> Snapshot {
        Snapshot::from_bits_retain(self.val.swap(bits.bits(), Ordering::SeqCst))
    }

    /// Replace the whole state except for the `keep` bits, which survive as
    /// they are.
    pub fn replace_keeping(&self, bits: Snapshot, keep: Snapshot) -> Snapshot {
        let prev = self
            .val
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some((cur & keep.bits()) | bits.bits())
            })
            .unwrap_or_else(|cur| cur);
        Snapshot::from_bits_retain(prev)
    }

    /// Move from exactly `from` to `to`. On failure returns the current state.
    pub fn transition(&self, from: Snapshot, to: Snapshot) -> Result<Snapshot, Snapshot> {
        self.val
            .compare_exchange(from.bits(), to.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .map(Snapshot::from_bits_retain)
            .map_err(Snapshot::from_bits_retain)
    }

    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.set(Snapshot::PAUSED);
        } else {
            self.unset(Snapshot::PAUSED);
        }
    }
}
