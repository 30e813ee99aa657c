//! Shared stub collaborators for the engine integration tests.
#![allow(dead_code)]

use stagewise_engine::abstraction::{
    Batch, CollaboratorError, DataSource, Metrics, Mode, Model, ModelOutput, Parameter, Result, Tensor,
    Value,
};
use stagewise_engine::{EngineContext, Hook, HookPriority, OUTPUT_KEY, OptimizerSpec, StageSpec, ValidationPolicy};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Send engine logs to the test harness output. `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// `y = w * x (+ b)` fitted with mean squared error.
pub struct Linear {
    params: Vec<Parameter>,
    last: Option<(Vec<f64>, Vec<f64>)>,
    /// Loss keys to emit instead of `loss`.
    loss_keys: Vec<&'static str>,
}

impl Linear {
    pub fn new() -> Self {
        Self { params: vec![Parameter::new("w", vec![1], vec![0.0])], last: None, loss_keys: vec!["loss"] }
    }

    pub fn with_bias() -> Self {
        let mut model = Self::new();
        model.params.push(Parameter::new("b", vec![1], vec![0.0]));
        model
    }

    pub fn with_loss_keys(keys: Vec<&'static str>) -> Self {
        Self { loss_keys: keys, ..Self::new() }
    }

    pub fn weight(&self) -> f64 {
        self.params[0].data[0]
    }

    fn predict(&self, xs: &[f64]) -> Vec<f64> {
        let b = self.params.get(1).map_or(0.0, |p| p.data[0]);
        xs.iter().map(|x| self.params[0].data[0] * x + b).collect()
    }
}

impl Model for Linear {
    fn forward(&mut self, batch: &Batch, mode: Mode) -> Result<ModelOutput> {
        let xs = batch[0].as_tensor().map(|t| t.data().to_vec()).unwrap_or_default();
        let ys = batch[1].as_tensor().map(|t| t.data().to_vec()).unwrap_or_default();
        let preds = self.predict(&xs);
        let mse = preds.iter().zip(&ys).map(|(p, y)| (p - y).powi(2)).sum::<f64>() / xs.len().max(1) as f64;

        let mut output = ModelOutput::new();
        for key in &self.loss_keys {
            output.insert((*key).to_string(), Value::Scalar(mse));
        }
        if mode != Mode::Train {
            output.insert(OUTPUT_KEY.to_string(), Value::Tensor(Tensor::from_vec(preds)));
        }
        self.last = Some((xs, ys));
        Ok(output)
    }

    fn set_training(&mut self, _training: bool) {}

    fn backward(&mut self, losses: &ModelOutput, loss_key: &str) -> Result<()> {
        if !losses.contains_key(loss_key) {
            return Err(CollaboratorError::Model(format!("no loss '{loss_key}'")));
        }
        let (xs, ys) = self.last.clone().ok_or_else(|| CollaboratorError::Model("backward before forward".into()))?;
        let preds = self.predict(&xs);
        let n = xs.len().max(1) as f64;
        let residuals: Vec<f64> = preds.iter().zip(&ys).map(|(p, y)| 2.0 * (p - y) / n).collect();

        let grad_w = residuals.iter().zip(&xs).map(|(r, x)| r * x).sum();
        let grad_b = residuals.iter().sum();
        self.params[0].grad = Some(vec![grad_w]);
        if let Some(bias) = self.params.get_mut(1) {
            bias.grad = Some(vec![grad_b]);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.params.iter().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.params.iter_mut().collect()
    }
}

/// A fixed list of batches. Evaluation reports how many predictions it saw.
pub struct Batches {
    batches: Vec<Batch>,
}

impl Batches {
    /// `n` batches of `[x, 2x]` pairs starting at `start`.
    pub fn new(n: usize, start: f64) -> Self {
        let batches = (0..n)
            .map(|i| {
                let xs = vec![start + i as f64, start + i as f64 + 0.5];
                let ys = xs.iter().map(|x| 2.0 * x).collect();
                vec![Value::Tensor(Tensor::from_vec(xs)), Value::Tensor(Tensor::from_vec(ys))]
            })
            .collect();
        Self { batches }
    }
}

impl DataSource for Batches {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }

    fn evaluate(&self, predictions: &[Value], config: &serde_json::Map<String, serde_json::Value>) -> Result<Metrics> {
        let count: usize = predictions.iter().map(|p| p.as_tensor().map_or(1, Tensor::numel)).sum();
        let mut metrics = Metrics::new();
        metrics.insert("count".to_string(), Value::Int(count as i64));
        metrics.insert("config_keys".to_string(), Value::Int(config.len() as i64));
        Ok(metrics)
    }
}

/// Appends `"<name>:<event>"` for every event it sees.
pub struct Recorder {
    name: String,
    priority: HookPriority,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self { name: name.to_string(), priority: HookPriority::default(), log: Arc::clone(log) }
    }

    pub fn with_priority(mut self, priority: HookPriority) -> Self {
        self.priority = priority;
        self
    }

    fn record(&self, event: &str) -> stagewise_engine::Result<()> {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
        Ok(())
    }
}

impl Hook for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn before_launch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_launch")
    }

    fn after_launch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_launch")
    }

    fn before_stage(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_stage")
    }

    fn after_stage(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_stage")
    }

    fn before_train_epoch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_train_epoch")
    }

    fn after_train_epoch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_train_epoch")
    }

    fn before_val_epoch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_val_epoch")
    }

    fn after_val_epoch(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_val_epoch")
    }

    fn before_train_iter(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_train_iter")
    }

    fn after_train_iter(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_train_iter")
    }

    fn before_val_iter(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("before_val_iter")
    }

    fn after_val_iter(&mut self, _ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        self.record("after_val_iter")
    }
}

/// `(stage, epoch_in_stage, iter_in_stage, iter_in_epoch)` seen by a hook.
pub type Counters = (usize, usize, usize, usize);

/// Records the context counters after every training iteration.
pub struct CounterTrace {
    trace: Arc<Mutex<Vec<Counters>>>,
}

impl CounterTrace {
    pub fn new(trace: &Arc<Mutex<Vec<Counters>>>) -> Self {
        Self { trace: Arc::clone(trace) }
    }
}

impl Hook for CounterTrace {
    fn name(&self) -> &str {
        "CounterTrace"
    }

    fn after_train_iter(&mut self, ctx: &mut EngineContext) -> stagewise_engine::Result<()> {
        let counters = (ctx.stage(), ctx.epoch_in_stage(), ctx.iter_in_stage(), ctx.iter_in_epoch());
        self.trace.lock().unwrap().push(counters);
        Ok(())
    }
}

pub fn new_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn sgd(lr: f64) -> OptimizerSpec {
    OptimizerSpec::new("sgd").with_param("lr", lr)
}

/// A stage of `epochs` epochs validating after every epoch.
pub fn stage(epochs: usize, lr: f64) -> StageSpec {
    StageSpec::new(epochs, sgd(lr)).with_validation(ValidationPolicy::default())
}
