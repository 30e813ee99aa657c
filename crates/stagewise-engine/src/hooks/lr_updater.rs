//! Per-iteration learning-rate scheduling.

use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use crate::stage::{LrPolicy, LrSchedule, ScheduleUnit, StageSpec, Warmup, WarmupPolicy};
use std::f64::consts::PI;
use tracing::debug;

/// Applies the stage's `lr_schedule` and `warmup` before each training iteration.
///
/// Base rates are captured at `before_stage`, from the stage optimizer's `lr`
/// parameter when present and from the live optimizer otherwise.
#[derive(Debug, Clone)]
pub struct LrUpdaterHook {
    name: String,
    priority: HookPriority,
    base_lrs: Vec<f64>,
}

impl Default for LrUpdaterHook {
    fn default() -> Self {
        Self::new()
    }
}

impl LrUpdaterHook {
    pub const TYPE: &'static str = "LrUpdaterHook";

    /// Base rates are captured at the start of each stage.
    pub fn new() -> Self {
        Self { name: Self::TYPE.to_string(), priority: HookPriority::default(), base_lrs: Vec::new() }
    }

    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        Ok(Self {
            name: spec.name_or_type().to_string(),
            priority: spec.priority_or(HookPriority::default()),
            base_lrs: Vec::new(),
        })
    }
}

/// Multiplier of the schedule at `progress` out of `total` steps.
fn schedule_factor(schedule: &LrSchedule, progress: usize, total: usize) -> f64 {
    match schedule.policy {
        LrPolicy::Fixed => 1.0,
        LrPolicy::Step => {
            let passed = schedule.step.iter().filter(|&&milestone| progress >= milestone).count();
            schedule.gamma.powi(passed as i32)
        }
        LrPolicy::Cosine => {
            if total == 0 {
                return 1.0;
            }
            let t = (progress as f64 / total as f64).min(1.0);
            0.5 * (1.0 + (PI * t).cos())
        }
    }
}

/// Warmup multiplier, or `None` once warmup is over.
fn warmup_factor(warmup: &Warmup, progress: usize) -> Option<f64> {
    if progress >= warmup.steps {
        return None;
    }
    match warmup.policy {
        WarmupPolicy::Constant => Some(warmup.ratio),
        WarmupPolicy::Linear => {
            let k = (1.0 - progress as f64 / warmup.steps as f64) * (1.0 - warmup.ratio);
            Some(1.0 - k)
        }
    }
}

fn progress_in(unit: ScheduleUnit, ctx: &EngineContext, stage: &StageSpec) -> (usize, usize) {
    match unit {
        ScheduleUnit::Epoch => (ctx.epoch_in_stage(), stage.epochs),
        ScheduleUnit::Iter => (ctx.iter_in_stage(), stage.epochs * ctx.iters_per_epoch()),
    }
}

impl Hook for LrUpdaterHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn before_stage(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let stage_lr = match ctx.cur_stage() {
            Some(stage) => stage.optimizer.param::<f64>("lr")?,
            None => None,
        };
        let optimizer = ctx.optimizer().ok_or(EngineError::NoOptimizer)?;
        let live = optimizer.learning_rates();

        self.base_lrs = match stage_lr {
            Some(lr) => vec![lr; live.len().max(1)],
            None => live,
        };
        debug!(base_lrs = ?self.base_lrs, "Captured base learning rates");
        Ok(())
    }

    fn before_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let Some(stage) = ctx.cur_stage() else {
            return Ok(());
        };

        let mut factor = 1.0;
        if let Some(schedule) = &stage.lr_schedule {
            let (progress, total) = progress_in(schedule.unit, ctx, stage);
            factor *= schedule_factor(schedule, progress, total);
        }
        if let Some(warmup) = &stage.warmup {
            let (progress, _) = progress_in(warmup.unit, ctx, stage);
            factor *= warmup_factor(warmup, progress).unwrap_or(1.0);
        }

        let lrs: Vec<f64> = self.base_lrs.iter().map(|lr| lr * factor).collect();
        let iter = ctx.iter() as u64;
        if let Some(optimizer) = ctx.optimizer_mut() {
            optimizer.set_learning_rates(&lrs);
        }
        if let Some(&lr) = lrs.first() {
            ctx.buffer_mut().update("lr", lr, Some(iter));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(milestones: Vec<usize>) -> LrSchedule {
        LrSchedule { unit: ScheduleUnit::Epoch, policy: LrPolicy::Step, step: milestones, gamma: 0.1 }
    }

    #[test]
    fn test_step_policy_counts_passed_milestones() {
        let schedule = step(vec![2, 4]);
        assert_eq!(schedule_factor(&schedule, 0, 5), 1.0);
        assert_eq!(schedule_factor(&schedule, 1, 5), 1.0);
        assert!((schedule_factor(&schedule, 2, 5) - 0.1).abs() < 1e-12);
        assert!((schedule_factor(&schedule, 4, 5) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_policy_endpoints() {
        let schedule = LrSchedule { policy: LrPolicy::Cosine, ..step(Vec::new()) };
        assert!((schedule_factor(&schedule, 0, 10) - 1.0).abs() < 1e-12);
        assert!((schedule_factor(&schedule, 5, 10) - 0.5).abs() < 1e-12);
        assert!(schedule_factor(&schedule, 10, 10).abs() < 1e-12);
    }

    #[test]
    fn test_linear_warmup_ramps_to_one() {
        let warmup = Warmup { unit: ScheduleUnit::Iter, policy: WarmupPolicy::Linear, steps: 4, ratio: 0.2 };
        assert!((warmup_factor(&warmup, 0).unwrap() - 0.2).abs() < 1e-12);
        assert!((warmup_factor(&warmup, 2).unwrap() - 0.6).abs() < 1e-12);
        assert!(warmup_factor(&warmup, 4).is_none());

        let constant = Warmup { policy: WarmupPolicy::Constant, ..warmup };
        assert_eq!(warmup_factor(&constant, 3), Some(0.2));
    }
}
