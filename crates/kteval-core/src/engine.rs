//! Central eval engine orchestrator.
//!
//! Drives minibatches through the stepper, reconciles them with group
//! boundaries in the carry-forward buffer, fuses the emitted groups and
//! accumulates metrics. All state is owned by a single pass over the
//! batches, in batch order.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::adapter::StepPredictor;
use crate::dataset::{batches, Dataset, LaneLayout};
use crate::error::EvalError;
use crate::fusion::{fuse, EarlyFusionHead, GroupResult};
use crate::metrics::MetricsAccumulator;
use crate::model::{FieldSet, Lane, StepMode};
use crate::regroup::{regroup, CarryForward, Emission, LaneFrame};
use crate::report::{EvalReport, ExcludedSequence};
use crate::stepper::Stepper;
use crate::trace::TraceWriter;
use crate::traits::Predictor;
use crate::window::DEFAULT_MAX_LEN;

/// Configuration for the eval engine.
#[derive(Debug, Clone)]
pub struct EvalEngineConfig {
    /// Label feedback policy.
    pub mode: StepMode,
    /// Maximum model input length (history plus query).
    pub max_len: usize,
    /// Maximum inputs per predictor call.
    pub batch_size: usize,
    /// Lanes per minibatch.
    pub lanes_per_batch: usize,
    /// Retries on transient predictor errors.
    pub max_retries: u32,
    /// Delay before the first retry; doubles up to 60s.
    pub retry_delay: Duration,
    /// Apply the predictor's early-fusion head when it has one.
    pub early_fusion: bool,
}

impl Default for EvalEngineConfig {
    fn default() -> Self {
        Self {
            mode: StepMode::TeacherForced,
            max_len: DEFAULT_MAX_LEN,
            batch_size: 128,
            lanes_per_batch: 64,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            early_fusion: true,
        }
    }
}

/// Optional trace destinations.
#[derive(Default)]
pub struct TraceSinks {
    pub groups: Option<Box<dyn Write + Send>>,
    pub steps: Option<Box<dyn Write + Send>>,
}

impl TraceSinks {
    /// Opens trace files for the given paths.
    pub fn files(groups: Option<&Path>, steps: Option<&Path>) -> std::io::Result<Self> {
        Ok(Self {
            groups: groups.map(TraceWriter::create_file).transpose()?,
            steps: steps.map(TraceWriter::create_file).transpose()?,
        })
    }

    /// Marks every open sink as truncated before any record was written.
    fn abort(self, early: bool, reason: &str) {
        let writers = [
            self.groups.map(|w| TraceWriter::groups(w, early)),
            self.steps.map(TraceWriter::steps),
        ];
        for writer in writers.into_iter().flatten() {
            match writer {
                Ok(w) => w.abort(reason),
                Err(e) => tracing::error!("could not start trace: {e}"),
            }
        }
    }
}

/// Progress reporting trait.
pub trait ProgressReporter: Send + Sync {
    fn on_batch_start(&self, index: usize, total: usize, lanes: usize);
    fn on_sequence_excluded(&self, sequence_id: &str, reason: &str);
    fn on_batch_complete(&self, index: usize, groups_emitted: usize, lanes_carried: usize);
    fn on_run_complete(&self, groups: usize, elapsed: Duration);
}

/// No-op progress reporter.
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_batch_start(&self, _: usize, _: usize, _: usize) {}
    fn on_sequence_excluded(&self, _: &str, _: &str) {}
    fn on_batch_complete(&self, _: usize, _: usize, _: usize) {}
    fn on_run_complete(&self, _: usize, _: Duration) {}
}

/// Mutable state of one evaluation pass.
struct Pass {
    carry: CarryForward,
    metrics: MetricsAccumulator,
    seen: HashSet<i64>,
    excluded: Vec<ExcludedSequence>,
    excluded_ids: HashSet<String>,
    group_trace: Option<TraceWriter>,
    step_trace: Option<TraceWriter>,
}

impl Pass {
    /// Fuses an emission, checks exactly-once emission and records it.
    fn absorb(
        &mut self,
        emission: &Emission,
        head: Option<&EarlyFusionHead>,
    ) -> Result<Vec<GroupResult>, EvalError> {
        let groups = fuse(&emission.rows, head)?;
        for g in &groups {
            if !self.seen.insert(g.group) {
                return Err(EvalError::integrity(g.group, "emitted twice"));
            }
        }
        self.metrics.extend(&groups);
        if let Some(trace) = self.group_trace.as_mut() {
            for g in &groups {
                trace.write_group(g)?;
            }
            trace.flush()?;
        }
        Ok(groups)
    }

    fn exclude(&mut self, sequence_id: &str, err: &EvalError, progress: &dyn ProgressReporter) {
        if !self.excluded_ids.insert(sequence_id.to_string()) {
            return;
        }
        let reason = err.to_string();
        tracing::warn!(sequence = sequence_id, "excluding sequence: {reason}");
        progress.on_sequence_excluded(sequence_id, &reason);
        self.carry.purge_sequence(sequence_id);
        self.excluded.push(ExcludedSequence {
            sequence_id: sequence_id.to_string(),
            reason,
        });
    }
}

/// The central eval engine.
pub struct EvalEngine {
    predictor: Arc<dyn Predictor>,
    config: EvalEngineConfig,
}

impl EvalEngine {
    pub fn new(predictor: Arc<dyn Predictor>, config: EvalEngineConfig) -> Self {
        Self { predictor, config }
    }

    pub fn config(&self) -> &EvalEngineConfig {
        &self.config
    }

    fn validate(&self, dataset: &Dataset) -> Result<(), EvalError> {
        if self.config.max_len < 2 {
            return Err(EvalError::Config(format!(
                "max_len must be at least 2, got {}",
                self.config.max_len
            )));
        }
        if self.config.batch_size == 0 || self.config.lanes_per_batch == 0 {
            return Err(EvalError::Config(
                "batch_size and lanes_per_batch must be positive".into(),
            ));
        }
        let offered = dataset
            .sequences
            .iter()
            .flat_map(|s| &s.interactions)
            .fold(FieldSet::default(), |acc, it| acc.union(&FieldSet::of(it)));
        let missing = self.predictor.requirements().missing(&offered);
        if !dataset.sequences.is_empty() && !missing.is_empty() {
            return Err(EvalError::Config(format!(
                "predictor '{}' requires {} but the dataset never provides it",
                self.predictor.name(),
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Evaluate a dataset under the given lane layout.
    pub async fn run(
        &self,
        dataset: &Dataset,
        layout: LaneLayout,
        traces: TraceSinks,
        progress: &dyn ProgressReporter,
    ) -> Result<EvalReport, EvalError> {
        let start = Instant::now();
        let head = if self.config.early_fusion {
            self.predictor.fusion_head()
        } else {
            None
        };
        if let Err(e) = self.validate(dataset) {
            traces.abort(head.is_some(), &e.to_string());
            return Err(e);
        }
        let adapter = StepPredictor::new(
            Arc::clone(&self.predictor),
            self.config.batch_size,
            self.config.max_retries,
            self.config.retry_delay,
        );
        // Sequences the predictor cannot read are excluded whole.
        let incompatible: Vec<(String, EvalError)> = dataset
            .sequences
            .iter()
            .filter_map(|seq| {
                seq.interactions
                    .iter()
                    .enumerate()
                    .find_map(|(pos, it)| adapter.check_input(&seq.id, pos, it).err())
                    .map(|err| (seq.id.clone(), err))
            })
            .collect();
        let stepper = Stepper::new(adapter, self.config.mode, self.config.max_len)
            .with_history(traces.steps.is_some());

        let mut pass = Pass {
            carry: CarryForward::new(),
            metrics: MetricsAccumulator::new(),
            seen: HashSet::new(),
            excluded: Vec::new(),
            excluded_ids: HashSet::new(),
            group_trace: traces
                .groups
                .map(|w| TraceWriter::groups(w, head.is_some()))
                .transpose()?,
            step_trace: traces.steps.map(TraceWriter::steps).transpose()?,
        };

        for (sequence_id, err) in &incompatible {
            pass.exclude(sequence_id, err, progress);
        }

        let batches = batches(dataset.lanes(layout), self.config.lanes_per_batch);
        let outcome = self
            .drive(&stepper, batches, head.as_ref(), &mut pass, progress)
            .await
            .and_then(|discarded| Ok((discarded, pass.metrics.finish()?)));

        let (discarded, metrics) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("evaluation aborted: {e}");
                let reason = e.to_string();
                if let Some(t) = pass.group_trace.take() {
                    t.abort(&reason);
                }
                if let Some(t) = pass.step_trace.take() {
                    t.abort(&reason);
                }
                return Err(e);
            }
        };

        if let Some(t) = pass.group_trace.take() {
            t.finish()?;
        }
        if let Some(t) = pass.step_trace.take() {
            t.finish()?;
        }

        let elapsed = start.elapsed();
        progress.on_run_complete(pass.metrics.group_count(), elapsed);

        Ok(EvalReport {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            predictor: self.predictor.name().to_string(),
            mode: self.config.mode,
            layout,
            dataset: dataset.summary(),
            metrics,
            groups: pass.metrics.group_count(),
            interactions: pass.metrics.interaction_count(),
            excluded: pass.excluded,
            discarded_groups: discarded,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Runs every batch, then flushes the residual buffer. Returns the
    /// discarded group ids.
    async fn drive(
        &self,
        stepper: &Stepper,
        batches: Vec<Vec<Lane>>,
        head: Option<&EarlyFusionHead>,
        pass: &mut Pass,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<i64>, EvalError> {
        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let lanes: Vec<Lane> = batch
                .into_iter()
                .filter(|l| !pass.excluded_ids.contains(&l.sequence_id))
                .collect();
            progress.on_batch_start(index, total, lanes.len());

            let outcomes = stepper.run_batch(&lanes).await?;
            let mut finished = Vec::with_capacity(lanes.len());
            for (lane, outcome) in lanes.iter().zip(outcomes) {
                match outcome {
                    Ok(records) => finished.push((lane, records)),
                    Err(e) if e.is_sequence_local() => pass.exclude(&lane.sequence_id, &e, progress),
                    Err(e) => return Err(e),
                }
            }

            let mut frames = Vec::with_capacity(finished.len());
            for (lane, records) in finished {
                if pass.excluded_ids.contains(&lane.sequence_id) {
                    continue;
                }
                if let Some(trace) = pass.step_trace.as_mut() {
                    for r in &records {
                        trace.write_step(lane.row, &lane.sequence_id, r)?;
                    }
                }
                frames.push(LaneFrame::build(lane, records)?);
            }
            if let Some(trace) = pass.step_trace.as_mut() {
                trace.flush()?;
            }

            let carry = std::mem::take(&mut pass.carry);
            let (emission, carry) = regroup(carry, frames);
            pass.carry = carry;
            let groups = pass.absorb(&emission, head)?;

            tracing::debug!(
                batch = index,
                rows = emission.rows.len(),
                groups = groups.len(),
                carried_lanes = pass.carry.lane_count(),
                "batch regrouped"
            );
            progress.on_batch_complete(index, groups.len(), pass.carry.lane_count());
        }

        let carry = std::mem::take(&mut pass.carry);
        let (residual, discarded) = carry.flush();
        if !discarded.is_empty() {
            tracing::warn!(
                "discarding {} incomplete groups left in the carry-forward buffer: {:?}",
                discarded.len(),
                discarded
            );
        }
        pass.absorb(&residual, head)?;
        Ok(discarded)
    }
}
