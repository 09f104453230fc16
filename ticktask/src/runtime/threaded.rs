use crate::runtime::{Advance, Runner, RunnerConfig, Schedule};
use crate::task::TaskError;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;

/// A [`Runner`] driven by a dedicated named thread.
///
/// The thread parks while there is nothing to advance and is unparked by
/// [`submit`](Schedule::submit). Clones share the same thread.
#[derive(Clone)]
pub struct ThreadedRunner {
    runner: Runner,
    control: Arc<Control>,
}

struct Control {
    thread: Thread,

    handle: Mutex<Option<JoinHandle<()>>>,

    /// Exit at the next tick, abandoning active tasks.
    killed: AtomicBool,

    /// Exit once the active set has been flushed.
    shutting_down: AtomicBool,
}

impl ThreadedRunner {
    pub(crate) fn spawn(cfg: RunnerConfig) -> Result<Self, TaskError> {
        let runner = Runner::new(cfg);
        let cfg = runner.cfg().clone();

        let mut builder = thread::Builder::new().name(cfg.name.clone());
        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        // The control block holds the thread handle, so the loop only starts
        // once it has been published.
        let (tx, rx) = std::sync::mpsc::sync_channel::<Arc<Control>>(1);

        let loop_runner = runner.clone();
        let handle = builder
            .spawn(move || {
                if let Ok(control) = rx.recv() {
                    drive_loop(&loop_runner, &control);
                }
            })
            .map_err(|e| anyhow!("failed to spawn runner thread {}: {}", cfg.name, e))?;

        let control = Arc::new(Control {
            thread: handle.thread().clone(),
            handle: Mutex::new(None),
            killed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });
        *control.handle.lock() = Some(handle);

        tx.send(control.clone())
            .map_err(|_| anyhow!("runner thread {} exited before starting", cfg.name))?;

        Ok(Self { runner, control })
    }

    /// Flush the active tasks, then stop the thread and wait for it.
    ///
    /// Tasks still in the inbound queue are never started.
    pub fn shutdown(&self) -> Result<(), TaskError> {
        self.runner.close_inbound();
        self.control.shutting_down.store(true, Ordering::SeqCst);
        self.control.thread.unpark();
        self.join()
    }

    /// Stop the thread at the next tick without waiting for active tasks.
    pub fn kill(&self) -> Result<(), TaskError> {
        if !self.control.killed.swap(true, Ordering::SeqCst) {
            tracing::debug!(runner = self.name(), "runner killed");
        }
        self.control.thread.unpark();
        self.join()
    }

    pub fn is_killed(&self) -> bool {
        self.control.killed.load(Ordering::SeqCst)
    }

    /// The underlying runner, for queries. Driving it from another thread
    /// fails with [`TaskError::AlreadyDriving`] while the loop is ticking.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn name(&self) -> &str {
        self.runner.name()
    }

    fn join(&self) -> Result<(), TaskError> {
        // Joining from the runner's own thread would deadlock. The loop exits
        // on its own once the flag is observed.
        if thread::current().id() == self.control.thread.id() {
            return Ok(());
        }

        let Some(handle) = self.control.handle.lock().take() else {
            return Ok(());
        };

        handle
            .join()
            .map_err(|_| TaskError::Internal(anyhow!("runner thread {} panicked", self.name())))
    }
}

impl Schedule for ThreadedRunner {
    fn submit(&self, task: Arc<dyn Advance>) -> Result<(), TaskError> {
        if self.is_killed() {
            return Err(TaskError::Killed {
                runner: self.name().to_string(),
            });
        }

        self.runner.submit(task)?;
        self.control.thread.unpark();
        Ok(())
    }

    fn name(&self) -> &str {
        self.runner.name()
    }
}

impl fmt::Debug for ThreadedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedRunner")
            .field("runner", &self.runner)
            .field("killed", &self.is_killed())
            .finish()
    }
}

fn drive_loop(runner: &Runner, control: &Control) {
    let cfg = runner.cfg();
    tracing::debug!(runner = %cfg.name, "runner thread started");

    while !control.killed.load(Ordering::SeqCst) {
        let started = Instant::now();

        let remaining = match runner.drive_once() {
            Ok(remaining) => remaining,
            Err(e) => {
                // The faulted task is gone, the others keep running.
                tracing::error!(runner = %cfg.name, error = %e, "tick failed");
                runner.num_active()
            }
        };

        if remaining == 0 && control.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        if remaining == 0 && runner.num_pending() == 0 {
            thread::park_timeout(cfg.idle_timeout);
            continue;
        }

        if let Some(interval) = cfg.tick_interval {
            let elapsed = started.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }

    let abandoned = runner.num_active() + runner.num_pending();
    if abandoned > 0 {
        tracing::warn!(runner = %cfg.name, abandoned, "runner thread exiting with unfinished tasks");
    }
    tracing::debug!(runner = %cfg.name, ticks = runner.ticks(), "runner thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::step::{Work, from_iter};
    use crate::task::TaskPool;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(ThreadedRunner: Send, Sync, Clone);

    fn wait_for(signal: &crate::task::Continuation) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if signal.poll() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_threaded_runner_completes_tasks() -> anyhow::Result<()> {
        let runner = Builder::new().name("threaded-test").try_spawn()?;
        let pool = TaskPool::new();

        let signals = (0..4)
            .map(|_| pool.acquire().start(&runner, Work::step(from_iter(0..10))))
            .collect::<Result<Vec<_>, _>>()?;

        for signal in &signals {
            assert!(wait_for(signal));
        }

        runner.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_submit_after_kill_fails() -> anyhow::Result<()> {
        let runner = Builder::new().try_spawn()?;
        runner.kill()?;
        assert!(runner.is_killed());

        let pool = TaskPool::new();
        let task = pool.acquire();
        let err = task
            .start(&runner, Work::step(from_iter(0..1)))
            .unwrap_err();
        assert!(matches!(err, TaskError::Killed { .. }));

        // The failed start handed the slot back.
        assert_eq!(pool.idle(), 1);
        Ok(())
    }

    #[test]
    fn test_thread_is_named_after_runner() -> anyhow::Result<()> {
        let runner = Builder::new().name("named-runner").try_spawn()?;
        assert_eq!(runner.control.thread.name(), Some("named-runner"));
        runner.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
        let runner = Builder::new().try_spawn()?;
        runner.shutdown()?;
        runner.shutdown()?;
        runner.kill()?;
        Ok(())
    }
}
