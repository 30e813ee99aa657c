use crate::checkpoint::{CheckpointRecord, CheckpointSource};
use crate::engine::context::Progress;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use serde::Serialize;
use stagewise_abstraction::CollaboratorError;
use tracing::{info, warn};

/// Outcome of restoring a run from a checkpoint.
///
/// Mismatches are reported here and logged, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub stage: usize,
    pub epoch: usize,
    pub iter: usize,
    /// The configured stages differ from the ones stored in the checkpoint.
    pub schedule_mismatch: bool,
    /// The stored checksum does not match the stored model state.
    pub checksum_mismatch: bool,
    pub optimizer_restored: bool,
}

impl Engine {
    /// Load a checkpoint through the engine's checkpointer and restore from it.
    pub fn resume(&mut self, source: &CheckpointSource) -> Result<ResumeReport> {
        let span = self.ctx.span.clone();
        let _guard = span.enter();

        info!(source = %source, "Resuming from checkpoint");
        let record = self.checkpointer.load(source)?;
        self.restore(record)
    }

    /// Restore model weights, progress counters and optimizer state.
    ///
    /// The stage is re-derived from the restored epoch using the configured
    /// schedule. A schedule that differs from the stored one only produces a
    /// warning.
    pub fn restore(&mut self, record: CheckpointRecord) -> Result<ResumeReport> {
        let checksum_mismatch = !record.verify_checksum()?;
        if checksum_mismatch {
            warn!(run_id = %record.meta.run_id, "Checkpoint checksum does not match its model state");
        }

        self.ctx.model.load_state_dict(&record.model_state)?;

        let (epoch, iter) = (record.meta.epoch, record.meta.iter);
        let stage = self.ctx.stages.stage_of_epoch(epoch);
        self.ctx.progress = Progress::resumed(stage, epoch, iter);

        let schedule_mismatch = record.meta.stages.as_slice() != self.ctx.stages.stages();
        if schedule_mismatch {
            warn!(
                saved_stages = record.meta.stages.len(),
                configured_stages = self.ctx.stages.max_stages(),
                "Stage schedule differs from the checkpoint; continuing with the configured schedule"
            );
        }

        let mut optimizer_restored = false;
        if let Some(state) = &record.optimizer_state {
            let spec = self
                .ctx
                .stages
                .get(stage)
                .or_else(|| self.ctx.stages.stages().last())
                .map(|s| s.optimizer.clone())
                .ok_or_else(|| EngineError::configuration("no stage to build an optimizer for"))?;
            self.build_optimizer(&spec)?;

            let optimizer = self.ctx.optimizer.as_mut().ok_or(EngineError::NoOptimizer)?;
            optimizer.load_state_dict(state).map_err(|e| match e {
                CollaboratorError::ShapeMismatch { .. } => EngineError::OptimizerStateMismatch(e),
                other => EngineError::Collaborator(other),
            })?;
            optimizer_restored = true;
        }

        info!(stage, epoch, iter, optimizer_restored, "Resumed");
        Ok(ResumeReport { stage, epoch, iter, schedule_mismatch, checksum_mismatch, optimizer_restored })
    }
}
