use crate::runtime::{Builder, ThreadedRunner};
use crate::task::TaskError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};

/// Name of the runner created by [`Schedulers::init`].
pub const STANDARD: &str = "standard";

/// Application-owned set of named threaded runners.
///
/// Nothing is created behind the caller's back: runners exist from `init` or
/// `register` until `teardown`, which is also run on drop.
#[derive(Debug, Default)]
pub struct Schedulers {
    runners: DashMap<String, ThreadedRunner>,

    // Closed on teardown so that no runner is registered while we are
    // killing the others.
    closed: AtomicBool,
}

impl Schedulers {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard runner.
    pub fn init() -> Result<Self, TaskError> {
        let schedulers = Self::new();
        schedulers.spawn(Builder::new().name(STANDARD))?;
        Ok(schedulers)
    }

    /// Spawn a runner from `builder` and register it under its name.
    pub fn spawn(&self, builder: Builder) -> Result<ThreadedRunner, TaskError> {
        let runner = builder.try_spawn()?;

        if let Err(e) = self.register(runner.clone()) {
            // Nobody else holds it, don't leak the thread.
            runner.kill()?;
            return Err(e);
        }

        Ok(runner)
    }

    pub fn register(&self, runner: ThreadedRunner) -> Result<(), TaskError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskError::Killed {
                runner: runner.name().to_string(),
            });
        }

        match self.runners.entry(runner.name().to_string()) {
            Entry::Occupied(_) => Err(TaskError::Config(format!(
                "a runner named {} is already registered",
                runner.name()
            ))),
            Entry::Vacant(vacant) => {
                tracing::debug!(runner = runner.name(), "runner registered");
                vacant.insert(runner);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<ThreadedRunner> {
        self.runners.get(name).map(|runner| runner.value().clone())
    }

    pub fn standard(&self) -> Result<ThreadedRunner, TaskError> {
        self.get(STANDARD)
            .ok_or_else(|| TaskError::Config("standard runner is not initialized".to_string()))
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Kill every runner and wait for its thread. Returns the first error,
    /// after all runners were killed.
    pub fn teardown(&self) -> Result<(), TaskError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let names = self
            .runners
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();

        let mut first_err = None;
        for name in names {
            let Some((_, runner)) = self.runners.remove(&name) else {
                continue;
            };

            if let Err(e) = runner.kill() {
                tracing::error!(runner = %name, error = %e, "failed to kill runner");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Schedulers {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::error!(error = %e, "error during schedulers teardown");
        }
    }
}
