use stagewise_abstraction::Model;

/// Scale the gradients of trainable parameters so their total norm is at most `max_norm`.
///
/// Returns the norm measured before clipping. `norm_type` of infinity selects
/// the max-norm.
pub fn clip_grad_norm(model: &mut dyn Model, max_norm: f64, norm_type: f64) -> f64 {
    let mut params: Vec<_> = model
        .parameters_mut()
        .into_iter()
        .filter(|p| p.requires_grad && p.grad.is_some())
        .collect();

    let grads = params.iter().filter_map(|p| p.grad.as_deref()).flatten();
    let total = if norm_type.is_infinite() {
        grads.fold(0.0_f64, |acc, g| acc.max(g.abs()))
    } else {
        grads.map(|g| g.abs().powf(norm_type)).sum::<f64>().powf(norm_type.recip())
    };

    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for param in &mut params {
            if let Some(grad) = param.grad.as_mut() {
                grad.iter_mut().for_each(|g| *g *= coef);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewise_abstraction::{Batch, Mode, ModelOutput, Parameter, Result};

    struct Grads(Vec<Parameter>);

    impl Model for Grads {
        fn forward(&mut self, _batch: &Batch, _mode: Mode) -> Result<ModelOutput> {
            Ok(ModelOutput::new())
        }

        fn set_training(&mut self, _training: bool) {}

        fn backward(&mut self, _losses: &ModelOutput, _key: &str) -> Result<()> {
            Ok(())
        }

        fn parameters(&self) -> Vec<&Parameter> {
            self.0.iter().collect()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.0.iter_mut().collect()
        }
    }

    fn model(grad: Vec<f64>) -> Grads {
        let mut p = Parameter::new("w", vec![grad.len()], vec![0.0; grad.len()]);
        p.grad = Some(grad);
        Grads(vec![p])
    }

    #[test]
    fn test_clips_l2_norm() {
        let mut m = model(vec![3.0, 4.0]);
        let norm = clip_grad_norm(&mut m, 1.0, 2.0);
        assert!((norm - 5.0).abs() < 1e-9);

        let grad = m.0[0].grad.as_ref().unwrap();
        let clipped = (grad[0].powi(2) + grad[1].powi(2)).sqrt();
        assert!((clipped - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_small_gradients_untouched() {
        let mut m = model(vec![0.1, 0.1]);
        clip_grad_norm(&mut m, 10.0, 2.0);
        assert_eq!(m.0[0].grad.as_deref(), Some(&[0.1, 0.1][..]));
    }

    #[test]
    fn test_inf_norm() {
        let mut m = model(vec![-7.0, 2.0]);
        assert_eq!(clip_grad_norm(&mut m, 100.0, f64::INFINITY), 7.0);
    }
}
