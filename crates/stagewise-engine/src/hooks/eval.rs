use crate::engine::EngineContext;
use crate::error::Result;
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use tracing::info;

/// Evaluates gathered predictions after every validation epoch and pushes the
/// resulting metrics into the buffer.
#[derive(Debug, Clone)]
pub struct EvalHook {
    name: String,
    priority: HookPriority,
}

impl Default for EvalHook {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalHook {
    pub const TYPE: &'static str = "EvalHook";

    /// An evaluation hook at default priority.
    pub fn new() -> Self {
        Self { name: Self::TYPE.to_string(), priority: HookPriority::default() }
    }

    /// Only `name` and `priority` are read.
    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        Ok(Self {
            name: spec.name_or_type().to_string(),
            priority: spec.priority_or(HookPriority::default()),
        })
    }
}

impl Hook for EvalHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn after_val_epoch(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let metrics = ctx.evaluate()?;
        if metrics.is_empty() {
            return Ok(());
        }

        let iter = ctx.iter() as u64;
        for (key, value) in &metrics {
            ctx.buffer_mut().update(key.as_str(), value.detach(), Some(iter));
        }
        let summary: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={:.4}", v.mean())).collect();
        info!(epoch = ctx.epoch(), mode = %ctx.mode(), metrics = %summary.join(", "), "Evaluation finished");
        Ok(())
    }
}
