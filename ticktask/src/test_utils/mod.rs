//! Steps and helpers shared by the unit tests.
use crate::step::{Step, StepError, StepResult, Yield};
use anyhow::anyhow;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Install a fmt subscriber once. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Done after `n` advances. Every advance bumps a shared counter, which
/// survives `reset`.
#[derive(Debug)]
pub(crate) struct Counting {
    n: usize,
    advanced: usize,
    counter: Arc<AtomicUsize>,
}

impl Counting {
    pub(crate) fn new(n: usize) -> Self {
        Self::with_counter(n, Arc::new(AtomicUsize::new(0)))
    }

    pub(crate) fn with_counter(n: usize, counter: Arc<AtomicUsize>) -> Self {
        assert!(n > 0, "Counting needs at least one advance");
        Self {
            n,
            advanced: 0,
            counter,
        }
    }

    pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
        self.counter.clone()
    }
}

impl Step for Counting {
    fn advance(&mut self) -> StepResult {
        self.counter.fetch_add(1, Ordering::SeqCst);
        self.advanced += 1;

        if self.advanced >= self.n {
            Ok(Yield::Done)
        } else {
            Ok(Yield::Continue)
        }
    }

    fn is_replayable(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.advanced = 0;
    }
}

/// Fails on its first advance.
#[derive(Debug)]
pub(crate) struct Failing {
    msg: &'static str,
}

impl Failing {
    pub(crate) fn new(msg: &'static str) -> Self {
        Self { msg }
    }
}

impl Step for Failing {
    fn advance(&mut self) -> StepResult {
        Err(StepError::Failed(anyhow!(self.msg)))
    }
}

/// Panics on its first advance.
#[derive(Debug)]
pub(crate) struct Panicking {
    msg: &'static str,
}

impl Panicking {
    pub(crate) fn new(msg: &'static str) -> Self {
        Self { msg }
    }
}

impl Step for Panicking {
    fn advance(&mut self) -> StepResult {
        panic!("{}", self.msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Advance,
    Stop,
    Fail,
}

/// Records which tasks were called, in order, per method.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<usize>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, method: Method, task: usize) {
        self.calls.entry(method).or_default().push(task);
    }

    pub(crate) fn calls(&self, method: Method) -> Vec<usize> {
        self.calls
            .get(&method)
            .map(|calls| calls.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: Method) -> usize {
        self.calls.get(&method).map_or(0, |calls| calls.len())
    }
}
