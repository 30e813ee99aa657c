//! Engine state visible to hooks.

use crate::buffer::Buffer;
use crate::checkpoint::{CheckpointMeta, CheckpointRecord};
use crate::comm::Communicator;
use crate::engine::data::DataSources;
use crate::error::{EngineError, Result};
use crate::stage::{StageSchedule, StageSpec, ValidationPolicy};
use chrono::Utc;
use serde::Serialize;
use stagewise_abstraction::{Metrics, Mode, Model, ModelOutput, Optimizer, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, Span};

/// Buffer key under which models emit predictions for evaluation.
pub const OUTPUT_KEY: &str = "_out";

/// Progress counters. Owned by the engine; hooks only read them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    stage: usize,
    epoch: usize,
    iter: usize,
    start_iter: usize,
}

impl Progress {
    pub(crate) fn resumed(stage: usize, epoch: usize, iter: usize) -> Self {
        Self { stage, epoch, iter, start_iter: iter }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn iter(&self) -> usize {
        self.iter
    }

    /// The iteration this run started (or resumed) from.
    pub fn start_iter(&self) -> usize {
        self.start_iter
    }

    pub(crate) fn next_stage(&mut self) {
        self.stage += 1;
    }

    pub(crate) fn next_epoch(&mut self) {
        self.epoch += 1;
    }

    pub(crate) fn next_iter(&mut self) {
        self.iter += 1;
    }
}

/// Disjoint mutable views of the context, for hooks that need several at once.
pub struct EngineParts<'a> {
    pub model: &'a mut dyn Model,
    pub optimizer: Option<&'a mut dyn Optimizer>,
    pub buffer: &'a mut Buffer,
    pub losses: &'a ModelOutput,
    pub comm: &'a dyn Communicator,
    pub stage: Option<&'a StageSpec>,
}

/// Everything a run owns apart from its hooks.
pub struct EngineContext {
    pub(crate) model: Box<dyn Model>,
    pub(crate) optimizer: Option<Box<dyn Optimizer>>,
    pub(crate) buffer: Buffer,
    pub(crate) losses: ModelOutput,
    pub(crate) stages: StageSchedule,
    pub(crate) progress: Progress,
    pub(crate) mode: Mode,
    pub(crate) iters_per_epoch: usize,
    pub(crate) data: DataSources,
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) work_dir: Option<PathBuf>,
    pub(crate) seed: u64,
    pub(crate) meta: serde_json::Map<String, serde_json::Value>,
    pub(crate) run_id: String,
    pub(crate) span: Span,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("run_id", &self.run_id)
            .field("progress", &self.progress)
            .field("mode", &self.mode)
            .field("stages", &self.stages.max_stages())
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn Model {
        self.model.as_mut()
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer> {
        match &mut self.optimizer {
            Some(optimizer) => Some(optimizer.as_mut()),
            None => None,
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Loss entries of the latest training iteration, including `loss`.
    pub fn losses(&self) -> &ModelOutput {
        &self.losses
    }

    pub fn stages(&self) -> &StageSchedule {
        &self.stages
    }

    /// The stage being run, `None` once the schedule is finished.
    pub fn cur_stage(&self) -> Option<&StageSpec> {
        self.stages.get(self.progress.stage)
    }

    /// Validation settings of the current stage, or of the last one once finished.
    pub fn validation_policy(&self) -> Option<&ValidationPolicy> {
        self.cur_stage()
            .or_else(|| self.stages.stages().last())
            .and_then(|s| s.validation.as_ref())
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn stage(&self) -> usize {
        self.progress.stage
    }

    pub fn epoch(&self) -> usize {
        self.progress.epoch
    }

    pub fn iter(&self) -> usize {
        self.progress.iter
    }

    pub fn start_iter(&self) -> usize {
        self.progress.start_iter
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn max_stages(&self) -> usize {
        self.stages.max_stages()
    }

    pub fn max_epochs(&self) -> usize {
        self.stages.max_epochs()
    }

    pub fn max_iters(&self) -> usize {
        self.stages.max_epochs() * self.iters_per_epoch
    }

    /// Batches per training epoch.
    pub fn iters_per_epoch(&self) -> usize {
        self.iters_per_epoch
    }

    /// Epochs completed within the current stage.
    pub fn epoch_in_stage(&self) -> usize {
        if self.progress.stage < self.stages.max_stages() {
            self.progress.epoch.saturating_sub(self.stages.epochs_before(self.progress.stage))
        } else {
            self.stages.epoch_in_stage(self.progress.epoch)
        }
    }

    /// Iterations completed within the current stage.
    pub fn iter_in_stage(&self) -> usize {
        let before = self.stages.iters_before(self.progress.stage, self.iters_per_epoch);
        self.progress.iter.saturating_sub(before)
    }

    /// Iterations completed within the current epoch.
    pub fn iter_in_epoch(&self) -> usize {
        self.progress.iter.saturating_sub(self.progress.epoch * self.iters_per_epoch)
    }

    pub fn data(&self) -> &DataSources {
        &self.data
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn meta(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.meta
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run span; enter it to attach run fields to log events.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn parts_mut(&mut self) -> EngineParts<'_> {
        let stage = self.stages.get(self.progress.stage);
        EngineParts {
            model: self.model.as_mut(),
            optimizer: match &mut self.optimizer {
                Some(optimizer) => Some(optimizer.as_mut()),
                None => None,
            },
            buffer: &mut self.buffer,
            losses: &self.losses,
            comm: self.comm.as_ref(),
            stage,
        }
    }

    /// Aggregate the predictions collected during an evaluation epoch.
    ///
    /// Drains `_out` from the buffer, gathers it on the coordinator, hands the
    /// rank-ordered concatenation to the evaluated data source and then waits
    /// on the group barrier. Non-coordinating workers return an empty map.
    pub fn evaluate(&mut self) -> Result<Metrics> {
        let outputs: Vec<Value> =
            self.buffer.pop_or(OUTPUT_KEY, Vec::new()).into_iter().map(|(v, _)| v).collect();
        let gathered = self.comm.gather(outputs)?;

        let result = match gathered {
            Some(per_rank) => self.evaluate_gathered(per_rank),
            None => Ok(Metrics::new()),
        };

        // Every worker reaches the barrier, including ones whose evaluation failed.
        self.comm.barrier()?;
        result
    }

    fn evaluate_gathered(&self, per_rank: Vec<Vec<Value>>) -> Result<Metrics> {
        let predictions: Vec<Value> = per_rank.into_iter().flatten().collect();
        let mode = if self.mode == Mode::Test { Mode::Test } else { Mode::Val };
        let source = self
            .data
            .get(mode)
            .ok_or_else(|| EngineError::MissingDataSource(mode.as_str().to_string()))?;
        let config = self.validation_policy().map(ValidationPolicy::evaluation_config).unwrap_or_default();

        debug!(predictions = predictions.len(), mode = %mode, "Evaluating predictions");
        Ok(source.evaluate(&predictions, &config)?)
    }

    /// Snapshot of the run after `completed_epochs` epochs.
    pub fn checkpoint_record(&self, completed_epochs: usize) -> CheckpointRecord {
        CheckpointRecord {
            model_state: self.model.state_dict(),
            optimizer_state: self.optimizer.as_ref().map(|o| o.state_dict()),
            meta: CheckpointMeta {
                stages: self.stages.stages().to_vec(),
                epoch: completed_epochs,
                iter: self.progress.iter,
                run_id: self.run_id.clone(),
                created_at: Utc::now(),
                checksum: None,
                extra: self.meta.clone(),
            },
        }
    }
}
