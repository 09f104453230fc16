use crate::step::{Step, StepResult, Yield};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CONSUMED: u8 = 2;

/// One-shot completion signal returned by `start`.
///
/// The signal is created fresh for every run and shared between the caller
/// and the task. Once the task finishes (naturally, by stop, or by failure)
/// the next [`Continuation::poll`] returns `true` and flips the signal back,
/// so callers must treat that edge as the completion event. Completing a run
/// more than once raises the edge only once.
///
/// A continuation is itself a [`Step`], so a task can wait on another one.
#[derive(Debug, Clone, Default)]
pub struct Continuation {
    state: Arc<AtomicU8>,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once after the task completed.
    pub fn poll(&self) -> bool {
        self.state
            .compare_exchange(COMPLETED, CONSUMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Peek without consuming the completion edge.
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMPLETED
    }

    /// Whether both continuations observe the same run.
    pub fn ptr_eq(&self, other: &Continuation) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn complete(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl Step for Continuation {
    fn advance(&mut self) -> StepResult {
        if self.poll() {
            Ok(Yield::Done)
        } else {
            Ok(Yield::Continue)
        }
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("Continuation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Continuation: Send, Sync, Clone);

    #[test]
    fn test_poll_is_one_shot() {
        let signal = Continuation::new();
        assert!(!signal.poll());

        signal.complete();
        assert!(signal.is_completed());
        assert!(signal.poll());
        assert!(!signal.poll());
        assert!(!signal.is_completed());
    }

    #[test]
    fn test_clones_share_completion() {
        let signal = Continuation::new();
        let observer = signal.clone();
        assert!(signal.ptr_eq(&observer));

        signal.complete();
        assert!(observer.poll());
        assert!(!signal.poll());
    }

    #[test]
    fn test_complete_raises_edge_once() {
        let signal = Continuation::new();
        signal.complete();
        assert!(signal.poll());

        signal.complete();
        assert!(!signal.poll());
        assert!(!signal.is_completed());
    }

    #[test]
    fn test_continuation_as_step_waits_for_completion() -> anyhow::Result<()> {
        let signal = Continuation::new();
        let mut waiter = signal.clone();

        assert!(matches!(waiter.advance()?, Yield::Continue));
        signal.complete();
        assert!(matches!(waiter.advance()?, Yield::Done));
        Ok(())
    }
}
