use crate::checkpoint::{Checkpointer, JsonCheckpointer};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use std::path::PathBuf;

/// Saves `epoch_<n>.json` every `interval` training epochs.
///
/// Only the coordinating worker writes. The directory is `out_dir` when set,
/// the run's work directory otherwise.
#[derive(Debug)]
pub struct CheckpointHook {
    name: String,
    priority: HookPriority,
    interval: usize,
    save_optimizer: bool,
    out_dir: Option<PathBuf>,
    checkpointer: Option<JsonCheckpointer>,
}

impl Default for CheckpointHook {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CheckpointHook {
    pub const TYPE: &'static str = "CheckpointHook";

    /// Save after every `interval` completed epochs, optimizer state included.
    pub fn new(interval: usize) -> Self {
        Self {
            name: Self::TYPE.to_string(),
            priority: HookPriority::default(),
            interval,
            save_optimizer: true,
            out_dir: None,
            checkpointer: None,
        }
    }

    /// Reads `interval` (default 1, must be positive), `save_optimizer` and
    /// `out_dir`.
    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        let interval = spec.param_or("interval", 1usize)?;
        if interval == 0 {
            return Err(EngineError::configuration("CheckpointHook interval must be >= 1"));
        }
        Ok(Self {
            name: spec.name_or_type().to_string(),
            priority: spec.priority_or(HookPriority::default()),
            interval,
            save_optimizer: spec.param_or("save_optimizer", true)?,
            out_dir: spec.param("out_dir")?,
            checkpointer: None,
        })
    }

    /// Write checkpoints to `dir` instead of the work directory.
    #[must_use]
    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn save_optimizer(mut self, save: bool) -> Self {
        self.save_optimizer = save;
        self
    }
}

impl Hook for CheckpointHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn on_register(&mut self, ctx: &EngineContext) -> Result<()> {
        let dir = self
            .out_dir
            .clone()
            .or_else(|| ctx.work_dir().map(PathBuf::from))
            .ok_or_else(|| EngineError::configuration("CheckpointHook needs a work_dir or out_dir"))?;
        self.checkpointer = Some(JsonCheckpointer::new(dir));
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let completed = ctx.epoch() + 1;
        if completed % self.interval.max(1) != 0 || !ctx.comm().is_coordinator() {
            return Ok(());
        }
        let checkpointer = self
            .checkpointer
            .as_ref()
            .ok_or_else(|| EngineError::Checkpoint("CheckpointHook used before registration".to_string()))?;

        let mut record = ctx.checkpoint_record(completed);
        if !self.save_optimizer {
            record.optimizer_state = None;
        }
        checkpointer.save(&record, &JsonCheckpointer::epoch_name(completed))?;
        Ok(())
    }
}
