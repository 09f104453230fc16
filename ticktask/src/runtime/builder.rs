use crate::runtime::{Runner, ThreadedRunner};
use crate::task::TaskError;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const INITIAL_CAPACITY: usize = 64;

const IDLE_TIMEOUT: Duration = Duration::from_millis(10);

fn default_name() -> String {
    static RUNNER_COUNT: AtomicUsize = AtomicUsize::new(0);

    let id = RUNNER_COUNT.fetch_add(1, Ordering::Relaxed);
    format!("ticktask-{}", id)
}

/// Configures and builds runners.
///
/// ```ignore
/// let runner = Builder::new().name("physics").initial_capacity(256).try_build()?;
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    /// Name used in logs and for the thread of a threaded runner.
    name: Option<String>,

    /// Active-set capacity reserved up front.
    initial_capacity: usize,

    /// How long a threaded runner parks when it has nothing to advance.
    /// Submitting a task unparks it early.
    idle_timeout: Duration,

    /// Minimum duration of a threaded tick. `None` ticks as fast as possible.
    tick_interval: Option<Duration>,

    /// Stack size of the thread spawned by a threaded runner.
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: None,
            initial_capacity: INITIAL_CAPACITY,
            idle_timeout: IDLE_TIMEOUT,
            tick_interval: None,
            thread_stack_size: None,
        }
    }

    /// Sets the runner name.
    ///
    /// The default name is "ticktask-{N}" with a monotonically increasing N.
    pub fn name(mut self, val: impl Into<String>) -> Self {
        self.name = Some(val.into());
        self
    }

    #[track_caller]
    pub fn initial_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "initial_capacity must be greater than 0");
        self.initial_capacity = val;
        self
    }

    #[track_caller]
    pub fn idle_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "idle_timeout must be greater than 0");
        self.idle_timeout = val;
        self
    }

    pub fn tick_interval(mut self, val: Duration) -> Self {
        self.tick_interval = Some(val);
        self
    }

    /// Sets the stack size (in bytes) of the driving thread.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates a runner driven by the caller.
    pub fn try_build(self) -> Result<Runner, TaskError> {
        let cfg = RunnerConfig::try_from(self)?;
        Ok(Runner::new(cfg))
    }

    /// Creates a runner driven by its own thread.
    pub fn try_spawn(self) -> Result<ThreadedRunner, TaskError> {
        let cfg = RunnerConfig::try_from(self)?;
        ThreadedRunner::spawn(cfg)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunnerConfig {
    pub(crate) name: String,
    pub(crate) initial_capacity: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) tick_interval: Option<Duration>,
    pub(crate) thread_stack_size: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            name: default_name(),
            initial_capacity: INITIAL_CAPACITY,
            idle_timeout: IDLE_TIMEOUT,
            tick_interval: None,
            thread_stack_size: None,
        }
    }
}

impl RunnerConfig {
    fn validate(&self) -> Result<(), TaskError> {
        if self.name.is_empty() {
            return Err(TaskError::Config("runner name cannot be empty".to_string()));
        }

        // Thread names are passed to the OS as C strings.
        if self.name.contains('\0') {
            return Err(TaskError::Config(format!(
                "runner name {:?} contains a nul byte",
                self.name
            )));
        }

        let max_interval = self.idle_timeout.saturating_mul(1000);
        if self.tick_interval.is_some_and(|interval| interval > max_interval) {
            return Err(TaskError::Config(format!(
                "tick_interval {:?} is unreasonably large compared to idle_timeout {:?}",
                self.tick_interval, self.idle_timeout
            )));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RunnerConfig {
    type Error = TaskError;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RunnerConfig {
            name: builder.name.unwrap_or_else(default_name),
            initial_capacity: builder.initial_capacity,
            idle_timeout: builder.idle_timeout,
            tick_interval: builder.tick_interval,
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
