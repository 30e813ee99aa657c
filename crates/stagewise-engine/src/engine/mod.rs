//! The training engine.
//!
//! The engine drives a stage -> epoch -> iteration loop over a `StageSchedule`
//! and fires lifecycle events on its hooks at every level. Numeric work is
//! delegated: the model computes outputs and gradients, hooks such as
//! `OptimizerHook` step the optimizer.

mod builder;
mod context;
mod data;
mod resume;

pub use builder::{Components, DataBuilder, EngineBuilder, ModelBuilder};
pub use context::{EngineContext, EngineParts, OUTPUT_KEY, Progress};
pub use data::DataSources;
pub use resume::ResumeReport;

use crate::checkpoint::Checkpointer;
use crate::error::{EngineError, Result};
use crate::hooks::{Hook, HookEvent, HookFactory, HookRegistry, HookSpec};
use crate::optim::OptimizerRegistry;
use crate::stage::OptimizerSpec;
use stagewise_abstraction::{Batch, CollaboratorError, DataSource, Metrics, Mode, ModelOutput, Value};
use tracing::{debug, info};

/// A hook to register: a live instance or a spec for the hook factory.
pub enum HookSource {
    Instance(Box<dyn Hook>),
    Spec(HookSpec),
}

impl<H: Hook + 'static> From<H> for HookSource {
    fn from(hook: H) -> Self {
        Self::Instance(Box::new(hook))
    }
}

impl From<HookSpec> for HookSource {
    fn from(spec: HookSpec) -> Self {
        Self::Spec(spec)
    }
}

impl From<&str> for HookSource {
    fn from(kind: &str) -> Self {
        Self::Spec(HookSpec::new(kind))
    }
}

/// Runs a stage schedule against a model, dispatching hooks along the way.
pub struct Engine {
    pub(crate) ctx: EngineContext,
    pub(crate) hooks: HookRegistry,
    pub(crate) optimizers: OptimizerRegistry,
    pub(crate) hook_factory: HookFactory,
    pub(crate) checkpointer: Box<dyn Checkpointer>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ctx", &self.ctx)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn progress(&self) -> Progress {
        self.ctx.progress
    }

    /// Register a hook instance, or build one from a spec and register it.
    ///
    /// For specs, `before` falls back to the spec's own `before`. See
    /// `HookRegistry::register` for ordering and overwrite rules.
    pub fn register_hook(
        &mut self,
        hook: impl Into<HookSource>,
        before: Option<&str>,
        overwrite: bool,
    ) -> Result<()> {
        let (mut hook, before) = match hook.into() {
            HookSource::Instance(hook) => (hook, before.map(str::to_string)),
            HookSource::Spec(spec) => {
                let before = before.map(str::to_string).or_else(|| spec.before.clone());
                (self.hook_factory.build(&spec)?, before)
            }
        };

        if let Some(target) = before.as_deref() {
            if !self.hooks.contains(target) {
                return Err(EngineError::HookNotFound(target.to_string()));
            }
        }
        if !overwrite && self.hooks.contains(hook.name()) {
            return Err(EngineError::DuplicateHook(hook.name().to_string()));
        }

        hook.on_register(&self.ctx)?;
        self.hooks.register(hook, before.as_deref(), overwrite)
    }

    /// Dispatch `event` to every hook in registration order.
    pub fn call_hook(&mut self, event: HookEvent) -> Result<()> {
        self.hooks.call(event, &mut self.ctx)
    }

    /// Replace the optimizer with one built from `spec`.
    pub fn build_optimizer(&mut self, spec: &OptimizerSpec) -> Result<()> {
        let optimizer = self.optimizers.build(spec, self.ctx.model.as_ref())?;
        self.ctx.optimizer = Some(optimizer);
        Ok(())
    }

    /// Run every remaining stage.
    pub fn launch(&mut self) -> Result<()> {
        let span = self.ctx.span.clone();
        let _guard = span.enter();

        info!(
            work_dir = ?self.ctx.work_dir,
            stages = self.ctx.max_stages(),
            epochs = self.ctx.max_epochs(),
            iters = self.ctx.max_iters(),
            start_iter = self.ctx.progress.start_iter(),
            "Start running"
        );
        self.call_hook(HookEvent::BeforeLaunch)?;

        while self.ctx.progress.stage() < self.ctx.max_stages() {
            self.run_stage()?;
        }

        self.call_hook(HookEvent::AfterLaunch)?;
        info!(epoch = self.ctx.epoch(), iter = self.ctx.iter(), "Finished running");
        Ok(())
    }

    /// Run the remaining epochs of the current stage.
    pub fn run_stage(&mut self) -> Result<()> {
        let stage = self
            .ctx
            .cur_stage()
            .cloned()
            .ok_or_else(|| EngineError::configuration("no stage left to run"))?;

        // A stage resumed mid-way keeps its restored optimizer.
        if self.ctx.epoch_in_stage() == 0 || self.ctx.optimizer.is_none() {
            self.build_optimizer(&stage.optimizer)?;
        }

        info!(
            stage = self.ctx.stage(),
            epochs = stage.epochs,
            optimizer = %stage.optimizer.kind,
            "Running stage"
        );
        self.call_hook(HookEvent::BeforeStage)?;

        while self.ctx.epoch_in_stage() < stage.epochs {
            self.train_epoch()?;

            let due = stage.validation.as_ref().is_some_and(|v| v.is_due(self.ctx.epoch_in_stage()));
            if due && self.ctx.data.has(Mode::Val) {
                self.val_epoch()?;
            }
        }

        self.call_hook(HookEvent::AfterStage)?;
        self.ctx.progress.next_stage();
        Ok(())
    }

    /// One pass over the training data.
    pub fn train_epoch(&mut self) -> Result<()> {
        self.ctx.mode = Mode::Train;
        self.ctx.model.set_training(true);

        let (slot, mut source) = self.ctx.data.take(Mode::Train)?;
        source.set_state(Mode::Train);
        let result = self.train_batches(source.as_mut());
        self.ctx.data.restore(slot, source);
        result?;

        self.call_hook(HookEvent::AfterTrainEpoch)?;
        self.ctx.progress.next_epoch();
        Ok(())
    }

    fn train_batches(&mut self, source: &mut dyn DataSource) -> Result<()> {
        self.call_hook(HookEvent::BeforeTrainEpoch)?;
        for batch in source.batches() {
            self.train_iter(&batch?)?;
        }
        Ok(())
    }

    /// Forward one training batch and record its outputs.
    ///
    /// Backward and the optimizer step happen in `after_train_iter` hooks.
    pub fn train_iter(&mut self, batch: &Batch) -> Result<()> {
        self.call_hook(HookEvent::BeforeTrainIter)?;

        let output = self.ctx.model.forward(batch, Mode::Train)?;
        let mut losses: ModelOutput =
            output.iter().filter(|(k, _)| k.contains("loss")).map(|(k, v)| (k.clone(), v.clone())).collect();
        if losses.is_empty() {
            return Err(CollaboratorError::Model("training output contains no loss".to_string()).into());
        }

        let iter = self.ctx.progress.iter() as u64;
        if !losses.contains_key("loss") {
            let total = losses
                .iter()
                .map(|(k, v)| {
                    v.as_scalar().ok_or_else(|| CollaboratorError::Model(format!("loss '{k}' is not a scalar")))
                })
                .sum::<std::result::Result<f64, _>>()?;
            losses.insert("loss".to_string(), Value::Scalar(total));
            self.ctx.buffer.update("loss", total, Some(iter));
        }

        for (key, value) in &output {
            self.ctx.buffer.update(key.as_str(), value.detach(), Some(iter));
        }
        self.ctx.losses = losses;

        self.call_hook(HookEvent::AfterTrainIter)?;
        self.ctx.progress.next_iter();
        Ok(())
    }

    /// One pass over the validation data.
    pub fn val_epoch(&mut self) -> Result<()> {
        self.eval_epoch(Mode::Val)
    }

    /// One pass over the test data. Fires the same events as validation.
    pub fn test_epoch(&mut self) -> Result<()> {
        self.eval_epoch(Mode::Test)
    }

    fn eval_epoch(&mut self, mode: Mode) -> Result<()> {
        let span = self.ctx.span.clone();
        let _guard = span.enter();
        info!(mode = %mode, epoch = self.ctx.epoch(), "Evaluating");

        self.ctx.mode = mode;
        self.ctx.model.set_training(false);

        let (slot, mut source) = self.ctx.data.take(mode)?;
        source.set_state(mode);
        let stale = self.ctx.buffer.pop_or(OUTPUT_KEY, Vec::new());
        debug!(dropped = stale.len(), "Cleared stale evaluation outputs");

        let result = self.eval_batches(mode, source.as_mut());
        self.ctx.data.restore(slot, source);
        result?;

        self.call_hook(HookEvent::AfterValEpoch)
    }

    fn eval_batches(&mut self, mode: Mode, source: &mut dyn DataSource) -> Result<()> {
        self.call_hook(HookEvent::BeforeValEpoch)?;
        for batch in source.batches() {
            self.val_iter(&batch?, mode)?;
        }
        Ok(())
    }

    fn val_iter(&mut self, batch: &Batch, mode: Mode) -> Result<()> {
        self.call_hook(HookEvent::BeforeValIter)?;

        let output = self.ctx.model.forward(batch, mode)?;
        let iter = self.ctx.progress.iter() as u64;
        for (key, value) in &output {
            self.ctx.buffer.update(key.as_str(), value.detach(), Some(iter));
        }

        self.call_hook(HookEvent::AfterValIter)
    }

    /// Aggregate evaluation outputs; see `EngineContext::evaluate`.
    pub fn evaluate(&mut self) -> Result<Metrics> {
        self.ctx.evaluate()
    }
}
