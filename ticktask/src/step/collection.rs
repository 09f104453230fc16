use crate::step::{
    BreakSignal, MAX_NESTING_DEPTH, Rejection, Step, StepError, StepResult, StepState, Work, Yield,
    advance_guarded,
};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::fmt;

/// How the members of a [`TaskCollection`] are advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// One member at a time, in insertion order. Member `i + 1` is first
    /// advanced on the tick after member `i` reported `Done`.
    Serial,

    /// Every unfinished member is advanced once per tick. The collection is
    /// done once all members are done.
    Parallel,
}

/// Composition of steps executed serially or in parallel.
///
/// Each member runs in its own lane. A member that yields
/// [`Yield::Nested`] pushes the nested work on top of its lane; the lane
/// advances the nested work until it is done and then resumes the member on
/// the following tick.
pub struct TaskCollection {
    kind: CollectionKind,
    lanes: Vec<Lane>,

    /// Serial only: index of the lane currently being advanced.
    cursor: usize,

    /// Break signal that finished the collection, if any.
    signal: BreakSignal,

    finished: bool,
}

impl TaskCollection {
    pub fn serial() -> Self {
        Self::with_capacity(CollectionKind::Serial, 0)
    }

    pub fn parallel() -> Self {
        Self::with_capacity(CollectionKind::Parallel, 0)
    }

    pub fn with_capacity(kind: CollectionKind, capacity: usize) -> Self {
        Self {
            kind,
            lanes: Vec::with_capacity(capacity),
            cursor: 0,
            signal: BreakSignal::None,
            finished: false,
        }
    }

    /// Append a step. Adding to a finished collection revives it.
    pub fn add<S: Step + 'static>(&mut self, step: S) -> &mut Self {
        self.add_boxed(Box::new(step))
    }

    pub fn add_work(&mut self, work: impl Into<Work>) -> &mut Self {
        self.add_boxed(work.into().into_step())
    }

    pub fn add_boxed(&mut self, step: Box<dyn Step>) -> &mut Self {
        self.lanes.push(Lane::new(step));
        self.finished = false;
        self.signal = BreakSignal::None;
        self
    }

    /// Chainable variant of [`TaskCollection::add`].
    pub fn with<S: Step + 'static>(mut self, step: S) -> Self {
        self.add(step);
        self
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Break signal raised during the last advance, `None` if the collection
    /// finished normally or is still running.
    pub fn current_signal(&self) -> BreakSignal {
        self.signal
    }

    /// Drop every member. Capacity is kept so the collection can be refilled
    /// without allocating.
    pub fn clear(&mut self) {
        self.lanes.clear();
        self.cursor = 0;
        self.signal = BreakSignal::None;
        self.finished = false;
    }

    /// Advance the collection one tick.
    pub fn step(&mut self) -> Result<StepState, StepError> {
        if self.finished {
            return Ok(StepState::broken(self.signal));
        }

        let res = match self.kind {
            CollectionKind::Serial => self.step_serial(),
            CollectionKind::Parallel => self.step_parallel(),
        };

        match res {
            Ok(state) => {
                if !state.has_more {
                    self.finish(state.signal);
                }
                Ok(state)
            }
            Err(e) => {
                self.finish(BreakSignal::None);
                Err(e)
            }
        }
    }

    fn step_serial(&mut self) -> Result<StepState, StepError> {
        while self.cursor < self.lanes.len() && self.lanes[self.cursor].done {
            self.cursor += 1;
        }

        let Some(lane) = self.lanes.get_mut(self.cursor) else {
            return Ok(StepState::DONE);
        };

        match lane.advance()? {
            LaneOutcome::More => Ok(StepState::MORE),
            LaneOutcome::Finished => {
                self.cursor += 1;
                if self.cursor < self.lanes.len() {
                    Ok(StepState::MORE)
                } else {
                    Ok(StepState::DONE)
                }
            }
            LaneOutcome::Break(signal) => Ok(StepState::broken(signal)),
        }
    }

    fn step_parallel(&mut self) -> Result<StepState, StepError> {
        let mut has_more = false;

        for lane in self.lanes.iter_mut().filter(|lane| !lane.done) {
            match lane.advance()? {
                LaneOutcome::More => has_more = true,
                LaneOutcome::Finished => {}
                LaneOutcome::Break(signal) => return Ok(StepState::broken(signal)),
            }
        }

        Ok(StepState {
            has_more,
            signal: BreakSignal::None,
        })
    }

    fn finish(&mut self, signal: BreakSignal) {
        self.finished = true;
        self.signal = signal;
    }
}

impl Step for TaskCollection {
    fn advance(&mut self) -> StepResult {
        let state = self.step()?;

        // `Iteration` only aborts this collection; the enclosing one goes on.
        Ok(match (state.has_more, state.signal) {
            (true, _) => Yield::Continue,
            (false, BreakSignal::AndStop) => Yield::Break(BreakSignal::AndStop),
            (false, _) => Yield::Done,
        })
    }

    fn is_replayable(&self) -> bool {
        self.lanes.iter().all(|lane| lane.base.is_replayable())
    }

    fn reset(&mut self) {
        self.lanes.iter_mut().for_each(Lane::reset);
        self.cursor = 0;
        self.signal = BreakSignal::None;
        self.finished = false;
    }

    fn name(&self) -> Cow<'static, str> {
        let kind = match self.kind {
            CollectionKind::Serial => "SerialTaskCollection",
            CollectionKind::Parallel => "ParallelTaskCollection",
        };
        Cow::Owned(format!("{}({})", kind, self.lanes.len()))
    }
}

impl Default for TaskCollection {
    fn default() -> Self {
        Self::serial()
    }
}

impl fmt::Debug for TaskCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCollection")
            .field("kind", &self.kind)
            .field("len", &self.lanes.len())
            .field("cursor", &self.cursor)
            .field("signal", &self.signal)
            .field("finished", &self.finished)
            .finish()
    }
}

enum LaneOutcome {
    More,
    Finished,
    Break(BreakSignal),
}

struct Lane {
    base: Box<dyn Step>,

    // Most steps never nest, and those that do rarely go deeper than a couple
    // of levels.
    nested: SmallVec<[Box<dyn Step>; 2]>,

    done: bool,
}

impl Lane {
    fn new(base: Box<dyn Step>) -> Self {
        Self {
            base,
            nested: SmallVec::new(),
            done: false,
        }
    }

    fn top(&self) -> &dyn Step {
        match self.nested.last() {
            Some(step) => step.as_ref(),
            None => self.base.as_ref(),
        }
    }

    fn top_mut(&mut self) -> &mut dyn Step {
        match self.nested.last_mut() {
            Some(step) => step.as_mut(),
            None => self.base.as_mut(),
        }
    }

    fn advance(&mut self) -> Result<LaneOutcome, StepError> {
        match advance_guarded(self.top_mut())? {
            Yield::Continue | Yield::Break(BreakSignal::None) => Ok(LaneOutcome::More),
            Yield::Done => {
                if self.nested.pop().is_some() {
                    Ok(LaneOutcome::More)
                } else {
                    self.done = true;
                    Ok(LaneOutcome::Finished)
                }
            }
            Yield::Break(signal) => {
                self.nested.clear();
                self.done = true;
                Ok(LaneOutcome::Break(signal))
            }
            Yield::Nested(work) => {
                let depth = self.nested.len() + 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(StepError::Rejected(Rejection {
                        step: self.top().name(),
                        depth,
                    }));
                }

                self.nested.push(work.into_step());
                Ok(LaneOutcome::More)
            }
        }
    }

    fn reset(&mut self) {
        self.nested.clear();
        self.base.reset();
        self.done = false;
    }
}
