use crate::engine::EngineContext;
use crate::error::Result;
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use std::time::Instant;

/// Records `data_time` (time spent waiting for the batch) and `time` (full
/// iteration wall time) in seconds, for training and evaluation iterations.
#[derive(Debug, Clone)]
pub struct IterTimerHook {
    name: String,
    priority: HookPriority,
    last: Option<Instant>,
}

impl Default for IterTimerHook {
    fn default() -> Self {
        Self::new()
    }
}

impl IterTimerHook {
    pub const TYPE: &'static str = "IterTimerHook";

    /// Runs at high priority so its timings bracket the other hooks.
    pub fn new() -> Self {
        Self { name: Self::TYPE.to_string(), priority: HookPriority::HIGH, last: None }
    }

    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        Ok(Self { name: spec.name_or_type().to_string(), priority: spec.priority_or(HookPriority::HIGH), last: None })
    }

    fn start(&mut self) {
        self.last = Some(Instant::now());
    }

    fn before_iter(&self, ctx: &mut EngineContext) {
        if let Some(last) = self.last {
            let iter = ctx.iter() as u64;
            ctx.buffer_mut().update("data_time", last.elapsed().as_secs_f64(), Some(iter));
        }
    }

    fn after_iter(&mut self, ctx: &mut EngineContext) {
        if let Some(last) = self.last {
            let iter = ctx.iter() as u64;
            ctx.buffer_mut().update("time", last.elapsed().as_secs_f64(), Some(iter));
        }
        self.start();
    }
}

impl Hook for IterTimerHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn before_train_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        self.start();
        Ok(())
    }

    fn before_val_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        self.start();
        Ok(())
    }

    fn before_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.before_iter(ctx);
        Ok(())
    }

    fn before_val_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.before_iter(ctx);
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.after_iter(ctx);
        Ok(())
    }

    fn after_val_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.after_iter(ctx);
        Ok(())
    }
}
