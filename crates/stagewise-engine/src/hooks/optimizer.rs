//! Backward pass and optimizer step after every training iteration.

use crate::comm::Communicator;
use crate::engine::{EngineContext, EngineParts};
use crate::error::{EngineError, Result};
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use crate::optim::clip_grad_norm;
use stagewise_abstraction::Model;

/// Runs zero_grad, backward, optional clipping and step.
#[derive(Debug, Clone)]
pub struct OptimizerHook {
    name: String,
    priority: HookPriority,
}

impl Default for OptimizerHook {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerHook {
    pub const TYPE: &'static str = "OptimizerHook";

    /// Clipping follows the current stage's `grad_clip`.
    pub fn new() -> Self {
        Self { name: Self::TYPE.to_string(), priority: HookPriority::default() }
    }

    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        Ok(Self {
            name: spec.name_or_type().to_string(),
            priority: spec.priority_or(HookPriority::default()),
        })
    }
}

impl Hook for OptimizerHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn after_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        optimize(ctx, false)
    }
}

/// `OptimizerHook` that averages gradients across workers before clipping.
#[derive(Debug, Clone)]
pub struct DistOptimizerHook {
    name: String,
    priority: HookPriority,
}

impl Default for DistOptimizerHook {
    fn default() -> Self {
        Self::new()
    }
}

impl DistOptimizerHook {
    pub const TYPE: &'static str = "DistOptimizerHook";

    /// Every worker of the group must register one, or the gradient
    /// all-reduce deadlocks.
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

impl Hook for DistOptimizerHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn after_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        optimize(ctx, true)
    }
}

fn optimize(ctx: &mut EngineContext, all_reduce: bool) -> Result<()> {
    let iter = ctx.iter() as u64;
    let EngineParts { model, optimizer, buffer, losses, comm, stage } = ctx.parts_mut();
    let stage = stage.ok_or_else(|| EngineError::configuration("optimizer step outside of a stage"))?;
    let optimizer = optimizer.ok_or(EngineError::NoOptimizer)?;

    let loss_key = stage.loss_key();
    if !losses.contains_key(loss_key) {
        return Err(EngineError::configuration(format!(
            "loss key '{loss_key}' not found in model outputs"
        )));
    }

    optimizer.zero_grad(model);
    model.backward(losses, loss_key)?;

    if all_reduce {
        all_reduce_grads(model, comm)?;
    }

    if let Some(clip) = &stage.grad_clip {
        let norm = clip_grad_norm(model, clip.max_norm, clip.norm_type);
        buffer.update("grad_norm", norm, Some(iter));
    }

    optimizer.step(model)?;
    Ok(())
}

/// Average the gradients of trainable parameters across workers.
fn all_reduce_grads(model: &mut dyn Model, comm: &dyn Communicator) -> Result<()> {
    if comm.world_size() <= 1 {
        return Ok(());
    }

    let mut params: Vec<_> = model
        .parameters_mut()
        .into_iter()
        .filter(|p| p.requires_grad && p.grad.is_some())
        .collect();
    let mut flat: Vec<f64> = params.iter().filter_map(|p| p.grad.as_deref()).flatten().copied().collect();

    comm.all_reduce_mean(&mut flat)?;

    let mut offset = 0;
    for param in &mut params {
        if let Some(grad) = param.grad.as_mut() {
            let n = grad.len();
            grad.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }
    }
    Ok(())
}
