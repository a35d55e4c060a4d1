//! Step-by-step prediction over the lanes of a minibatch.
//!
//! Each lane walks `Warmup -> Predicting -> Done`. Unselected rows feed
//! their ground truth into the context window without being predicted;
//! selected rows are predicted and then fed back with either the truth
//! (teacher-forced) or the thresholded prediction (autoregressive).
//!
//! Teacher-forced contexts are known up front, so every selected row of
//! the minibatch goes to the adapter as one batched request. All rows of
//! a question group see the window as it stood before the group; their
//! truths are appended only once the whole group is queued. The
//! autoregressive path advances all lanes in lockstep rounds: each round
//! batches at most one pending query per lane, because the next query of
//! a lane depends on the label just predicted for it.

use std::ops::Range;

use crate::adapter::StepPredictor;
use crate::error::EvalError;
use crate::model::{threshold, Lane, StepMode};
use crate::traits::{QueryFields, Representation, StepInput, StepOutput};
use crate::window::{ContextWindow, WindowSnapshot};

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Run-length scan over repeat flags: each range is one question chunk.
/// A chunk starts at row 0 and at every row whose flag is `false`.
pub fn chunk_bounds(is_repeat: &[bool]) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (i, repeat) in is_repeat.iter().enumerate().skip(1) {
        if !repeat {
            chunks.push(start..i);
            start = i;
        }
    }
    if !is_repeat.is_empty() {
        chunks.push(start..is_repeat.len());
    }
    chunks
}

/// Number of leading rows consumed as warm-up for a train/predict split.
///
/// With `q` chunks the warm-up covers the first `floor(q * ratio)` of them,
/// at least one, and never all of them when there is more than one. A
/// single-chunk sequence has no warm-up.
pub fn warmup_len(is_repeat: &[bool], train_ratio: f64) -> usize {
    let chunks = chunk_bounds(is_repeat);
    let total = chunks.len();
    if total <= 1 {
        return 0;
    }
    let mut train = ((total as f64) * train_ratio).floor() as usize;
    if train == 0 {
        train = 1;
    }
    if train >= total {
        train = total - 1;
    }
    chunks[train].start
}

// ---------------------------------------------------------------------------
// Per-lane pass state
// ---------------------------------------------------------------------------

/// Where a lane is in its walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Predicting,
    Done,
}

/// Explicit state of one in-flight lane, threaded through each round.
#[derive(Debug, Clone)]
pub struct LaneState {
    window: ContextWindow,
    cursor: usize,
    warmup: usize,
    len: usize,
}

impl LaneState {
    pub fn new(lane: &Lane, max_len: usize) -> Self {
        Self {
            window: ContextWindow::new(max_len),
            cursor: 0,
            warmup: lane.warmup(),
            len: lane.interactions.len(),
        }
    }

    pub fn phase(&self) -> Phase {
        if self.cursor >= self.len {
            Phase::Done
        } else if self.cursor < self.warmup {
            Phase::Warmup
        } else {
            Phase::Predicting
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    /// Feeds unselected rows until the cursor rests on a selected row or
    /// the lane is exhausted.
    fn skip_context(mut self, lane: &Lane) -> Self {
        while self.cursor < self.len && !lane.targets[self.cursor].selected {
            let it = &lane.interactions[self.cursor];
            self.window.append(it, it.response);
            self.cursor += 1;
        }
        self
    }

    fn query(&self, lane: &Lane) -> StepInput {
        query_at(lane, self.cursor, self.window.snapshot())
    }

    /// End (exclusive) of the run of selected rows sharing the current
    /// row's group.
    fn group_end(&self, lane: &Lane) -> usize {
        let group = lane.targets[self.cursor].group;
        (self.cursor..self.len)
            .find(|&pos| !lane.targets[pos].selected || lane.targets[pos].group != group)
            .unwrap_or(self.len)
    }

    /// Consumes the current row with the label to feed back.
    fn advance(mut self, lane: &Lane, label: u8) -> Self {
        self.window.append(&lane.interactions[self.cursor], label);
        self.cursor += 1;
        self
    }
}

fn query_at(lane: &Lane, position: usize, history: WindowSnapshot) -> StepInput {
    StepInput {
        sequence_id: lane.sequence_id.clone(),
        position,
        history,
        query: QueryFields::from(&lane.interactions[position]),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Prediction for one selected lane row.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Row index inside the lane.
    pub position: usize,
    pub group: i64,
    pub truth: u8,
    pub probability: f64,
    /// Thresholded prediction.
    pub label: u8,
    pub representation: Option<Representation>,
    /// Window the predictor saw, when history capture is enabled.
    pub history: Option<WindowSnapshot>,
}

/// Records for a lane, or the reason the lane was excluded.
pub type LaneOutcome = Result<Vec<StepRecord>, EvalError>;

// ---------------------------------------------------------------------------
// Stepper
// ---------------------------------------------------------------------------

/// Drives prediction over minibatches of lanes.
pub struct Stepper {
    predictor: StepPredictor,
    mode: StepMode,
    max_len: usize,
    capture_history: bool,
}

impl Stepper {
    pub fn new(predictor: StepPredictor, mode: StepMode, max_len: usize) -> Self {
        Self {
            predictor,
            mode,
            max_len,
            capture_history: false,
        }
    }

    /// Keep a copy of each step's window in its record (for step traces).
    pub fn with_history(mut self, capture: bool) -> Self {
        self.capture_history = capture;
        self
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    /// Runs one minibatch. The outer error aborts the run; an inner error
    /// excludes only its lane.
    pub async fn run_batch(&self, lanes: &[Lane]) -> Result<Vec<LaneOutcome>, EvalError> {
        let mut outcomes: Vec<Option<LaneOutcome>> = lanes
            .iter()
            .map(|lane| self.check_lane(lane).err().map(Err))
            .collect();
        let active: Vec<usize> = (0..lanes.len())
            .filter(|i| outcomes[*i].is_none())
            .collect();

        let records = match self.mode {
            StepMode::TeacherForced => self.teacher_forced(lanes, &active).await?,
            StepMode::Autoregressive => self.autoregressive(lanes, &active).await?,
        };
        for (idx, recs) in active.into_iter().zip(records) {
            outcomes[idx] = Some(Ok(recs));
        }
        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Ok(Vec::new())))
            .collect())
    }

    fn check_lane(&self, lane: &Lane) -> Result<(), EvalError> {
        if lane.targets.len() != lane.interactions.len() {
            return Err(EvalError::Config(format!(
                "lane for sequence {} has {} targets for {} interactions",
                lane.sequence_id,
                lane.targets.len(),
                lane.interactions.len()
            )));
        }
        for (pos, it) in lane.interactions.iter().enumerate() {
            self.predictor.check_input(&lane.sequence_id, pos, it)?;
        }
        Ok(())
    }

    async fn teacher_forced(
        &self,
        lanes: &[Lane],
        active: &[usize],
    ) -> Result<Vec<Vec<StepRecord>>, EvalError> {
        let mut inputs = Vec::new();
        let mut owners = Vec::new();
        for (slot, &idx) in active.iter().enumerate() {
            let lane = &lanes[idx];
            let mut state = LaneState::new(lane, self.max_len);
            loop {
                state = state.skip_context(lane);
                if state.phase() == Phase::Done {
                    break;
                }
                let end = state.group_end(lane);
                let history = state.window.snapshot();
                for pos in state.cursor..end {
                    inputs.push(query_at(lane, pos, history.clone()));
                    owners.push(slot);
                }
                while state.cursor < end {
                    let truth = lane.interactions[state.cursor].response;
                    state = state.advance(lane, truth);
                }
            }
        }

        let outputs = self.predictor.predict_many(&inputs).await?;
        let mut records: Vec<Vec<StepRecord>> = vec![Vec::new(); active.len()];
        for ((input, output), slot) in inputs.into_iter().zip(outputs).zip(owners) {
            let lane = &lanes[active[slot]];
            records[slot].push(self.record(lane, input, output));
        }
        Ok(records)
    }

    async fn autoregressive(
        &self,
        lanes: &[Lane],
        active: &[usize],
    ) -> Result<Vec<Vec<StepRecord>>, EvalError> {
        let mut states: Vec<Option<LaneState>> = active
            .iter()
            .map(|&idx| Some(LaneState::new(&lanes[idx], self.max_len)))
            .collect();
        let mut records: Vec<Vec<StepRecord>> = vec![Vec::new(); active.len()];

        loop {
            let mut inputs = Vec::new();
            let mut owners = Vec::new();
            for (slot, entry) in states.iter_mut().enumerate() {
                let Some(state) = entry.take() else { continue };
                let lane = &lanes[active[slot]];
                let state = state.skip_context(lane);
                if state.phase() == Phase::Done {
                    continue;
                }
                inputs.push(state.query(lane));
                owners.push(slot);
                *entry = Some(state);
            }
            if inputs.is_empty() {
                break;
            }

            let outputs = self.predictor.predict_many(&inputs).await?;
            for ((input, output), slot) in inputs.into_iter().zip(outputs).zip(owners) {
                let lane = &lanes[active[slot]];
                let record = self.record(lane, input, output);
                if let Some(state) = states[slot].take() {
                    states[slot] = Some(state.advance(lane, record.label));
                }
                records[slot].push(record);
            }
        }
        Ok(records)
    }

    fn record(&self, lane: &Lane, input: StepInput, output: StepOutput) -> StepRecord {
        let pos = input.position;
        StepRecord {
            position: pos,
            group: lane.targets[pos].group,
            truth: lane.interactions[pos].response,
            probability: output.probability,
            label: threshold(output.probability),
            representation: output.representation,
            history: self.capture_history.then_some(input.history),
        }
    }
}
