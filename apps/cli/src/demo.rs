//! Built-in toy collaborators so configured schedules can run end to end.
//!
//! `ToyRegression` is a linear model fitted with mean squared error and
//! `Synthetic` yields noisy samples of a fixed random linear function.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stagewise_abstraction::{
    Batch, CollaboratorError, DataSource, Metrics, Mode, Model, ModelOutput, Parameter, Result, Tensor, Value,
};
use stagewise_engine::{ComponentSpec, Components, OUTPUT_KEY};

/// Linear regression `y = x . weight + bias`.
pub struct ToyRegression {
    features: usize,
    params: Vec<Parameter>,
    last: Option<(Vec<f64>, Vec<f64>)>,
}

impl ToyRegression {
    pub const TYPE: &'static str = "ToyRegression";

    pub fn new(features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = (0..features).map(|_| rng.gen_range(-0.1..0.1)).collect();
        Self {
            features,
            params: vec![
                Parameter::new("weight", vec![features], weight),
                Parameter::new("bias", vec![1], vec![0.0]),
            ],
            last: None,
        }
    }

    fn predict(&self, inputs: &[f64]) -> Vec<f64> {
        let weight = &self.params[0].data;
        let bias = self.params[1].data[0];
        inputs.chunks(self.features).map(|row| row.iter().zip(weight).map(|(x, w)| x * w).sum::<f64>() + bias).collect()
    }

    fn unpack(&self, batch: &Batch) -> Result<(Vec<f64>, Vec<f64>)> {
        let [inputs, targets] = batch.as_slice() else {
            return Err(CollaboratorError::Model(format!("expected [inputs, targets], got {} values", batch.len())));
        };
        let inputs = inputs
            .as_tensor()
            .ok_or_else(|| CollaboratorError::Model("inputs must be a tensor".to_string()))?;
        let targets = targets
            .as_tensor()
            .ok_or_else(|| CollaboratorError::Model("targets must be a tensor".to_string()))?;
        if inputs.numel() != targets.numel() * self.features {
            return Err(CollaboratorError::ShapeMismatch {
                what: "inputs".to_string(),
                expected: targets.numel() * self.features,
                found: inputs.numel(),
            });
        }
        Ok((inputs.data().to_vec(), targets.data().to_vec()))
    }
}

impl Model for ToyRegression {
    fn forward(&mut self, batch: &Batch, mode: Mode) -> Result<ModelOutput> {
        let (inputs, targets) = self.unpack(batch)?;
        let preds = self.predict(&inputs);
        let n = targets.len().max(1) as f64;
        let mse = preds.iter().zip(&targets).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / n;

        let mut output = ModelOutput::from([("loss".to_string(), Value::Scalar(mse))]);
        if mode != Mode::Train {
            let pairs = preds.iter().zip(&targets).flat_map(|(p, t)| [*p, *t]).collect();
            output.insert(OUTPUT_KEY.to_string(), Value::Tensor(Tensor::new(vec![preds.len(), 2], pairs)?));
        }
        self.last = Some((inputs, targets));
        Ok(output)
    }

    fn set_training(&mut self, _training: bool) {}

    fn backward(&mut self, _losses: &ModelOutput, _loss_key: &str) -> Result<()> {
        let (inputs, targets) = self
            .last
            .as_ref()
            .ok_or_else(|| CollaboratorError::Model("backward called before forward".to_string()))?;
        let preds = self.predict(inputs);
        let n = targets.len().max(1) as f64;

        let mut grad_w = vec![0.0; self.features];
        let mut grad_b = 0.0;
        for ((row, p), t) in inputs.chunks(self.features).zip(&preds).zip(targets) {
            let r = 2.0 * (p - t) / n;
            for (g, x) in grad_w.iter_mut().zip(row) {
                *g += r * x;
            }
            grad_b += r;
        }
        self.params[0].grad = Some(grad_w);
        self.params[1].grad = Some(vec![grad_b]);
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.params.iter().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.params.iter_mut().collect()
    }
}

/// Noisy samples of `y = x . w* + b*` with `w*` and `b*` drawn from the run seed.
pub struct Synthetic {
    batches: Vec<Batch>,
}

impl Synthetic {
    pub const TYPE: &'static str = "Synthetic";

    pub fn new(batches: usize, batch_size: usize, features: usize, noise: f64, seed: u64, mode: Mode) -> Self {
        let mut truth = StdRng::seed_from_u64(seed);
        let weight: Vec<f64> = (0..features).map(|_| truth.gen_range(-2.0..2.0)).collect();
        let bias: f64 = truth.gen_range(-1.0..1.0);

        let stream = match mode {
            Mode::Train => 1,
            Mode::Val => 2,
            Mode::Test => 3,
        };
        let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31).wrapping_add(stream));
        let batches = (0..batches)
            .map(|_| {
                let inputs: Vec<f64> = (0..batch_size * features).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let targets: Vec<f64> = inputs
                    .chunks(features)
                    .map(|row| {
                        let clean: f64 = row.iter().zip(&weight).map(|(x, w)| x * w).sum::<f64>() + bias;
                        clean + noise * rng.gen_range(-1.0..1.0)
                    })
                    .collect();
                vec![Value::Tensor(Tensor::from_vec(inputs)), Value::Tensor(Tensor::from_vec(targets))]
            })
            .collect();
        Self { batches }
    }
}

impl DataSource for Synthetic {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }

    fn evaluate(&self, predictions: &[Value], config: &serde_json::Map<String, serde_json::Value>) -> Result<Metrics> {
        let tensors: Vec<Tensor> = predictions.iter().filter_map(Value::as_tensor).cloned().collect();
        let pairs = Tensor::concat(&tensors)?;
        let rows = pairs.data().chunks(2);
        let n = rows.len().max(1) as f64;

        let (mut se, mut ae) = (0.0, 0.0);
        for pair in rows {
            if let [p, t] = pair {
                se += (p - t).powi(2);
                ae += (p - t).abs();
            }
        }

        let mut metrics = Metrics::from([("val_mse".to_string(), Value::Scalar(se / n))]);
        if config.get("mae").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            metrics.insert("val_mae".to_string(), Value::Scalar(ae / n));
        }
        Ok(metrics)
    }
}

fn build_model(spec: &ComponentSpec, seed: u64) -> stagewise_engine::Result<Box<dyn Model>> {
    let features = spec.param_or("features", 4usize)?;
    Ok(Box::new(ToyRegression::new(features, seed)))
}

fn build_data(spec: &ComponentSpec, mode: Mode, seed: u64) -> stagewise_engine::Result<Box<dyn DataSource>> {
    Ok(Box::new(Synthetic::new(
        spec.param_or("batches", 16usize)?,
        spec.param_or("batch_size", 8usize)?,
        spec.param_or("features", 4usize)?,
        spec.param_or("noise", 0.1)?,
        seed,
        mode,
    )))
}

/// Components with the demo model and data source registered.
pub fn components() -> stagewise_engine::Result<Components> {
    let mut components = Components::new();
    components.register_model(ToyRegression::TYPE, build_model)?;
    components.register_data(Synthetic::TYPE, build_data)?;
    Ok(components)
}
