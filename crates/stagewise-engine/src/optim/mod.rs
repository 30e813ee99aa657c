//! Optimizer construction.
//!
//! Stages name their optimizer by type; the registry turns that name plus the
//! stage's parameters into an optimizer bound to the model.

mod clip;
mod sgd;

pub use clip::clip_grad_norm;
pub use sgd::Sgd;

use crate::error::Result;
use crate::registry::Registry;
use crate::stage::OptimizerSpec;
use stagewise_abstraction::{Model, Optimizer};
use tracing::debug;

/// Builds an optimizer from its spec, bound to the model's parameters.
pub type OptimizerBuilder =
    Box<dyn Fn(&OptimizerSpec, &dyn Model) -> Result<Box<dyn Optimizer>> + Send + Sync>;

fn build_sgd(spec: &OptimizerSpec, model: &dyn Model) -> Result<Box<dyn Optimizer>> {
    Ok(Box::new(Sgd::from_spec(spec, model)?))
}

/// Optimizer types known to an engine.
pub struct OptimizerRegistry {
    builders: Registry<OptimizerBuilder>,
}

impl std::fmt::Debug for OptimizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerRegistry").field("builders", &self.builders).finish()
    }
}

impl Default for OptimizerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl OptimizerRegistry {
    /// A registry with no optimizer types.
    pub fn empty() -> Self {
        Self { builders: Registry::new("optimizer") }
    }

    /// A registry with the built-in `sgd`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.builders.insert("sgd", Box::new(build_sgd));
        registry
    }

    /// Register an optimizer type.
    ///
    /// A prebuilt optimizer can be supplied by registering a builder that
    /// returns it under its own name.
    pub fn register<F>(&mut self, name: &str, builder: F) -> Result<()>
    where
        F: Fn(&OptimizerSpec, &dyn Model) -> Result<Box<dyn Optimizer>> + Send + Sync + 'static,
    {
        self.builders.register(name, Box::new(builder))
    }

    /// Whether `name` is registered, ignoring case.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains(name)
    }

    /// Build the optimizer described by `spec` for `model`.
    pub fn build(&self, spec: &OptimizerSpec, model: &dyn Model) -> Result<Box<dyn Optimizer>> {
        debug!(optimizer = %spec.kind, "Building optimizer");
        (self.builders.get(&spec.kind)?)(spec, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ComponentSpec;
    use crate::EngineError;
    use stagewise_abstraction::{Batch, Mode, ModelOutput, Parameter};

    struct Empty;

    impl Model for Empty {
        fn forward(&mut self, _batch: &Batch, _mode: Mode) -> stagewise_abstraction::Result<ModelOutput> {
            Ok(ModelOutput::new())
        }

        fn set_training(&mut self, _training: bool) {}

        fn backward(&mut self, _losses: &ModelOutput, _key: &str) -> stagewise_abstraction::Result<()> {
            Ok(())
        }

        fn parameters(&self) -> Vec<&Parameter> {
            Vec::new()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            Vec::new()
        }
    }

    #[test]
    fn test_builds_sgd_case_insensitively() {
        let registry = OptimizerRegistry::default();
        let spec = ComponentSpec::new("SGD").with_param("lr", 0.01);
        let opt = registry.build(&spec, &Empty).unwrap();
        assert_eq!(opt.learning_rates(), vec![0.01]);
    }

    #[test]
    fn test_unknown_and_duplicate_types() {
        let mut registry = OptimizerRegistry::default();
        let err = registry.build(&ComponentSpec::new("adamw"), &Empty).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));

        let dup = registry.register("sgd", |spec, model| {
            Ok(Box::new(Sgd::from_spec(spec, model)?) as Box<dyn Optimizer>)
        });
        assert!(dup.is_err());
    }
}
