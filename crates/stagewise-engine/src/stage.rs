//! Stage schedule model.
//!
//! A schedule is an ordered list of stages, each a contiguous block of epochs
//! sharing one optimizer configuration. Epoch offsets are always derived from
//! cumulative sums of `epochs`, never stored.

use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Deserialize `params[key]`, naming errors after the owning `kind`.
pub(crate) fn lookup_param<T: DeserializeOwned>(
    kind: &str,
    params: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<T>> {
    params
        .get(key)
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|e| EngineError::configuration(format!("{kind}.{key}: {e}")))
        })
        .transpose()
}

/// A `type` name plus free-form parameters, used to build components by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ComponentSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), params: serde_json::Map::new() }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Typed lookup of an optional parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        lookup_param(&self.kind, &self.params, key)
    }

    /// Typed lookup with a fallback.
    pub fn param_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.param(key)?.unwrap_or(default))
    }
}

/// Optimizer construction spec: `type` names a registered builder.
pub type OptimizerSpec = ComponentSpec;

/// Whether a schedule advances per epoch or per iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleUnit {
    #[default]
    Epoch,
    Iter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    #[default]
    Fixed,
    Step,
    Cosine,
}

fn default_gamma() -> f64 {
    0.1
}

/// Learning-rate schedule applied within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    #[serde(rename = "type", default)]
    pub unit: ScheduleUnit,
    #[serde(default)]
    pub policy: LrPolicy,
    /// Milestones for the `step` policy.
    #[serde(default)]
    pub step: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupPolicy {
    #[default]
    Linear,
    Constant,
}

fn default_warmup_ratio() -> f64 {
    0.001
}

/// Warmup applied at the beginning of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warmup {
    #[serde(rename = "type", default = "iter_unit")]
    pub unit: ScheduleUnit,
    #[serde(default)]
    pub policy: WarmupPolicy,
    pub steps: usize,
    #[serde(default = "default_warmup_ratio")]
    pub ratio: f64,
}

fn iter_unit() -> ScheduleUnit {
    ScheduleUnit::Iter
}

fn default_interval() -> usize {
    1
}

/// When to run validation within a stage, plus evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    #[serde(default = "default_interval")]
    pub interval: usize,
    #[serde(default)]
    pub offset: usize,
    /// Settings forwarded to the data source evaluation routine.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self { interval: 1, offset: 0, extra: serde_json::Map::new() }
    }
}

impl ValidationPolicy {
    /// The policy without its scheduling keys.
    pub fn evaluation_config(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut cfg = self.extra.clone();
        cfg.remove("interval");
        cfg.remove("offset");
        cfg
    }

    /// Whether validation is due after `epoch_in_stage` completed epochs.
    pub fn is_due(&self, epoch_in_stage: usize) -> bool {
        self.interval > 0 && epoch_in_stage > self.offset && epoch_in_stage % self.interval == 0
    }
}

fn default_norm_type() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradClip {
    pub max_norm: f64,
    #[serde(default = "default_norm_type")]
    pub norm_type: f64,
}

/// Descriptor of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub epochs: usize,
    pub optimizer: OptimizerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_schedule: Option<LrSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<Warmup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_clip: Option<GradClip>,
    #[serde(rename = "loss", default, skip_serializing_if = "Option::is_none")]
    pub loss_key: Option<String>,
}

impl StageSpec {
    pub fn new(epochs: usize, optimizer: OptimizerSpec) -> Self {
        Self {
            epochs,
            optimizer,
            lr_schedule: None,
            warmup: None,
            validation: None,
            grad_clip: None,
            loss_key: None,
        }
    }

    #[must_use]
    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Output key the optimizer hook back-propagates.
    pub fn loss_key(&self) -> &str {
        self.loss_key.as_deref().unwrap_or("loss")
    }

    pub fn validate(&self, index: usize) -> Result<()> {
        if self.epochs == 0 {
            return Err(EngineError::configuration(format!("stage {index}: epochs must be >= 1")));
        }
        if self.optimizer.kind.trim().is_empty() {
            return Err(EngineError::configuration(format!(
                "stage {index}: optimizer type is required"
            )));
        }
        Ok(())
    }
}

/// The ordered stage plan an engine executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageSchedule {
    stages: Vec<StageSpec>,
}

impl StageSchedule {
    /// Build a schedule, rejecting empty plans and zero-epoch stages.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self> {
        if stages.is_empty() {
            return Err(EngineError::configuration("stage schedule must not be empty"));
        }
        for (i, stage) in stages.iter().enumerate() {
            stage.validate(i)?;
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn get(&self, stage: usize) -> Option<&StageSpec> {
        self.stages.get(stage)
    }

    pub fn max_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn max_epochs(&self) -> usize {
        self.stages.iter().map(|s| s.epochs).sum()
    }

    /// Total epochs of all stages before `stage`.
    pub fn epochs_before(&self, stage: usize) -> usize {
        self.stages.iter().take(stage).map(|s| s.epochs).sum()
    }

    /// Total iterations of all stages before `stage`.
    pub fn iters_before(&self, stage: usize, iters_per_epoch: usize) -> usize {
        self.epochs_before(stage) * iters_per_epoch
    }

    /// The stage containing global `epoch` and the epoch offset within it.
    ///
    /// Picks the first stage where `epochs_before + epochs >= epoch + 1`. An
    /// epoch past the end of the plan maps to `(max_stages, 0)`.
    pub fn locate(&self, epoch: usize) -> (usize, usize) {
        let mut cumsum = 0;
        for (i, stage) in self.stages.iter().enumerate() {
            if cumsum + stage.epochs > epoch {
                return (i, epoch - cumsum);
            }
            cumsum += stage.epochs;
        }
        (self.stages.len(), 0)
    }

    pub fn stage_of_epoch(&self, epoch: usize) -> usize {
        self.locate(epoch).0
    }

    /// Epochs completed within the stage containing `epoch`.
    ///
    /// Once the plan is exhausted this is the last stage's epoch count.
    pub fn epoch_in_stage(&self, epoch: usize) -> usize {
        match self.locate(epoch) {
            (stage, offset) if stage < self.stages.len() => offset,
            _ => self.stages.last().map_or(0, |s| s.epochs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgd() -> OptimizerSpec {
        ComponentSpec::new("sgd").with_param("lr", 0.1)
    }

    fn schedule(epochs: &[usize]) -> StageSchedule {
        StageSchedule::new(epochs.iter().map(|&e| StageSpec::new(e, sgd())).collect()).unwrap()
    }

    #[test]
    fn test_locate_uses_cumulative_boundaries() {
        let s = schedule(&[2, 3]);
        assert_eq!(s.locate(0), (0, 0));
        assert_eq!(s.locate(1), (0, 1));
        assert_eq!(s.locate(2), (1, 0));
        assert_eq!(s.locate(3), (1, 1));
        assert_eq!(s.locate(4), (1, 2));
        assert_eq!(s.locate(5), (2, 0));
        assert_eq!(s.epoch_in_stage(3), 1);
        assert_eq!(s.epoch_in_stage(5), 3);
        assert_eq!(s.max_epochs(), 5);
        assert_eq!(s.iters_before(1, 10), 20);
    }

    #[test]
    fn test_rejects_empty_and_zero_epoch_plans() {
        assert!(StageSchedule::new(Vec::new()).is_err());
        assert!(StageSchedule::new(vec![StageSpec::new(0, sgd())]).is_err());
        assert!(StageSchedule::new(vec![StageSpec::new(1, ComponentSpec::new(" "))]).is_err());
    }

    #[test]
    fn test_param_errors_name_the_component() {
        let spec = ComponentSpec::new("SGD").with_param("lr", "fast");
        assert_eq!(spec.param::<f64>("momentum").unwrap(), None);
        assert_eq!(spec.param_or("momentum", 0.9).unwrap(), 0.9);

        let err = spec.param::<f64>("lr").unwrap_err();
        assert!(matches!(&err, EngineError::Configuration(msg) if msg.starts_with("SGD.lr: ")));
    }

    #[test]
    fn test_validation_policy_due() {
        let policy = ValidationPolicy { interval: 2, offset: 1, ..Default::default() };
        assert!(!policy.is_due(1));
        assert!(policy.is_due(2));
        assert!(!policy.is_due(3));
        assert!(policy.is_due(4));

        let never = ValidationPolicy { interval: 0, ..Default::default() };
        assert!(!never.is_due(1));
    }

    #[test]
    fn test_stage_spec_from_toml() {
        let stage: StageSpec = toml::from_str(
            r#"
            epochs = 5
            loss = "cls_loss"
            optimizer = { type = "sgd", lr = 0.01, momentum = 0.9 }
            lr_schedule = { type = "epoch", policy = "step", step = [2, 4] }
            warmup = { policy = "linear", steps = 500, ratio = 0.001 }
            validation = { interval = 1, metric = "mse" }
            "#,
        )
        .unwrap();

        assert_eq!(stage.epochs, 5);
        assert_eq!(stage.loss_key(), "cls_loss");
        assert_eq!(stage.optimizer.param::<f64>("momentum").unwrap(), Some(0.9));
        assert_eq!(stage.lr_schedule.as_ref().unwrap().step, vec![2, 4]);
        assert_eq!(stage.warmup.as_ref().unwrap().unit, ScheduleUnit::Iter);

        let cfg = stage.validation.as_ref().unwrap().evaluation_config();
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg["metric"], "mse");
    }
}
