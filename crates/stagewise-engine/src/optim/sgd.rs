//! Reference stochastic gradient descent.

use crate::error::Result;
use crate::stage::OptimizerSpec;
use serde::{Deserialize, Serialize};
use stagewise_abstraction::{CollaboratorError, Model, Optimizer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: Vec<Vec<f64>>,
}

/// SGD with optional momentum and L2 weight decay, one parameter group.
///
/// Each step applies `v = momentum * v + (g + weight_decay * p)` and then
/// `p -= lr * v`. With zero momentum this is plain gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    /// One buffer per trainable parameter, in `parameters()` order.
    velocity: Vec<Vec<f64>>,
}

impl Sgd {
    /// Bind a new optimizer to the trainable parameters of `model`.
    ///
    /// Velocity buffers start at zero, sized from the parameters that
    /// require gradients.
    pub fn new(model: &dyn Model, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        let velocity = model
            .parameters()
            .into_iter()
            .filter(|p| p.requires_grad)
            .map(|p| vec![0.0; p.numel()])
            .collect();
        Self { lr, momentum, weight_decay, velocity }
    }

    /// Builder used by the optimizer registry.
    ///
    /// `lr` is required; `momentum` and `weight_decay` default to zero.
    pub fn from_spec(spec: &OptimizerSpec, model: &dyn Model) -> Result<Self> {
        let lr = spec.param::<f64>("lr")?.ok_or_else(|| {
            crate::EngineError::configuration("sgd requires a learning rate 'lr'")
        })?;
        let momentum = spec.param_or("momentum", 0.0)?;
        let weight_decay = spec.param_or("weight_decay", 0.0)?;
        Ok(Self::new(model, lr, momentum, weight_decay))
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut dyn Model) -> stagewise_abstraction::Result<()> {
        let params = model.parameters_mut().into_iter().filter(|p| p.requires_grad);
        for (param, velocity) in params.zip(self.velocity.iter_mut()) {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            if grad.len() != param.data.len() || velocity.len() != param.data.len() {
                return Err(CollaboratorError::ShapeMismatch {
                    what: param.name.clone(),
                    expected: param.data.len(),
                    found: grad.len(),
                });
            }
            for ((w, g), v) in param.data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                let g = g + self.weight_decay * *w;
                *v = self.momentum * *v + g;
                *w -= self.lr * *v;
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> serde_json::Value {
        let state = SgdState {
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            velocity: self.velocity.clone(),
        };
        serde_json::to_value(state).unwrap_or(serde_json::Value::Null)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> stagewise_abstraction::Result<()> {
        let state: SgdState = serde_json::from_value(state.clone())
            .map_err(|e| CollaboratorError::Optimizer(format!("invalid sgd state: {e}")))?;

        if state.velocity.len() != self.velocity.len() {
            return Err(CollaboratorError::ShapeMismatch {
                what: "sgd parameter count".to_string(),
                expected: self.velocity.len(),
                found: state.velocity.len(),
            });
        }
        for (i, (live, saved)) in self.velocity.iter().zip(&state.velocity).enumerate() {
            if live.len() != saved.len() {
                return Err(CollaboratorError::ShapeMismatch {
                    what: format!("sgd momentum buffer {i}"),
                    expected: live.len(),
                    found: saved.len(),
                });
            }
        }

        self.lr = state.lr;
        self.momentum = state.momentum;
        self.weight_decay = state.weight_decay;
        self.velocity = state.velocity;
        Ok(())
    }

    fn learning_rates(&self) -> Vec<f64> {
        vec![self.lr]
    }

    fn set_learning_rates(&mut self, lrs: &[f64]) {
        if let Some(&lr) = lrs.first() {
            self.lr = lr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ComponentSpec;
    use stagewise_abstraction::{Batch, Mode, ModelOutput, Parameter};

    struct Linear {
        params: Vec<Parameter>,
    }

    impl Linear {
        fn new(n: usize) -> Self {
            Self { params: vec![Parameter::new("w", vec![n], vec![1.0; n])] }
        }
    }

    impl Model for Linear {
        fn forward(&mut self, _batch: &Batch, _mode: Mode) -> stagewise_abstraction::Result<ModelOutput> {
            Ok(ModelOutput::new())
        }

        fn set_training(&mut self, _training: bool) {}

        fn backward(&mut self, _losses: &ModelOutput, _key: &str) -> stagewise_abstraction::Result<()> {
            let n = self.params[0].numel();
            self.params[0].grad = Some(vec![1.0; n]);
            Ok(())
        }

        fn parameters(&self) -> Vec<&Parameter> {
            self.params.iter().collect()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.params.iter_mut().collect()
        }
    }

    #[test]
    fn test_step_with_momentum() {
        let mut model = Linear::new(2);
        let mut sgd = Sgd::new(&model, 0.1, 0.9, 0.0);

        model.backward(&ModelOutput::new(), "loss").unwrap();
        sgd.step(&mut model).unwrap();
        assert!((model.params[0].data[0] - 0.9).abs() < 1e-12);

        sgd.step(&mut model).unwrap();
        // v = 0.9 * 1 + 1 = 1.9
        assert!((model.params[0].data[0] - 0.71).abs() < 1e-12);
    }

    #[test]
    fn test_zero_grad_skips_update() {
        let mut model = Linear::new(2);
        let mut sgd = Sgd::new(&model, 0.1, 0.0, 0.0);
        model.backward(&ModelOutput::new(), "loss").unwrap();
        sgd.zero_grad(&mut model);
        sgd.step(&mut model).unwrap();
        assert_eq!(model.params[0].data, vec![1.0, 1.0]);
    }

    #[test]
    fn test_from_spec_requires_lr() {
        let model = Linear::new(1);
        assert!(Sgd::from_spec(&ComponentSpec::new("sgd"), &model).is_err());
        let sgd = Sgd::from_spec(&ComponentSpec::new("sgd").with_param("lr", 0.5), &model).unwrap();
        assert_eq!(sgd.learning_rates(), vec![0.5]);
    }

    #[test]
    fn test_load_state_rejects_other_shapes() {
        let small = Sgd::new(&Linear::new(2), 0.1, 0.9, 0.0);
        let mut large = Sgd::new(&Linear::new(3), 0.1, 0.9, 0.0);
        let err = large.load_state_dict(&small.state_dict()).unwrap_err();
        assert!(matches!(err, CollaboratorError::ShapeMismatch { expected: 3, found: 2, .. }));

        let mut same = Sgd::new(&Linear::new(2), 0.5, 0.0, 0.0);
        same.load_state_dict(&small.state_dict()).unwrap();
        assert_eq!(same.learning_rates(), vec![0.1]);
    }
}
