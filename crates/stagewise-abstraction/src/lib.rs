//! Collaborator abstraction layer for Stagewise.
//!
//! This crate defines the contracts the engine imposes on the pieces it does
//! not own: the model doing numeric work, the data sources feeding it, and the
//! optimizer updating its parameters. Nothing here drives a training run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod value;

pub use value::{Device, Tensor, Value};

/// A batch as yielded by a data source, e.g. `[inputs, targets]`.
pub type Batch = Vec<Value>;

/// Named outputs of a single model invocation.
pub type ModelOutput = BTreeMap<String, Value>;

/// Named metrics returned by a data source evaluation routine.
pub type Metrics = BTreeMap<String, Value>;

/// Errors raised by collaborators (model, data source, optimizer).
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollaboratorError {
    /// The model failed during forward or backward.
    #[error("Model Error: {0}")]
    Model(String),

    /// The data source failed to produce or evaluate data.
    #[error("Data Error: {0}")]
    Data(String),

    /// The optimizer failed to construct or step.
    #[error("Optimizer Error: {0}")]
    Optimizer(String),

    /// Stored state does not fit the live structure.
    #[error("Shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// What was being matched (parameter name, state entry, ...).
        what: String,
        /// The size the live structure requires.
        expected: usize,
        /// The size that was supplied.
        found: usize,
    },

    /// The collaborator does not implement the requested capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Other unexpected errors.
    #[error("Other Collaborator Error: {0}")]
    Other(String),
}

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// The phase a model or data source is being used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Val,
    Test,
}

impl Mode {
    /// Get the string representation of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trainable (or frozen) parameter owned by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Unique name within the model.
    pub name: String,
    /// Logical shape; `data.len()` equals its product.
    pub shape: Vec<usize>,
    /// Current values, row-major.
    pub data: Vec<f64>,
    /// Accumulated gradient, if any was computed since the last reset.
    #[serde(skip)]
    pub grad: Option<Vec<f64>>,
    /// Whether the optimizer should update this parameter.
    pub requires_grad: bool,
}

impl Parameter {
    /// Create a trainable parameter.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self { name: name.into(), shape, data, grad: None, requires_grad: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// The model collaborator.
///
/// A model turns a batch into named outputs. In `Train` and `Val` mode the
/// outputs must contain at least one key with `"loss"` in its name.
pub trait Model: Send {
    /// Run the model on one batch.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if the batch cannot be processed.
    fn forward(&mut self, batch: &Batch, mode: Mode) -> Result<ModelOutput>;

    /// Switch between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    /// Accumulate gradients of `losses[loss_key]` into the parameters.
    fn backward(&mut self, losses: &ModelOutput, loss_key: &str) -> Result<()>;

    /// All parameters in a stable order.
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable access to all parameters, in the same order as `parameters`.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Serializable snapshot of the model weights.
    fn state_dict(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .parameters()
            .into_iter()
            .map(|p| {
                (p.name.clone(), serde_json::json!({ "shape": p.shape, "data": p.data }))
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Restore weights produced by `state_dict`.
    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        for param in self.parameters_mut() {
            let entry = state
                .get(&param.name)
                .and_then(|e| e.get("data"))
                .ok_or_else(|| CollaboratorError::Model(format!("missing parameter: {}", param.name)))?;
            let data: Vec<f64> = serde_json::from_value(entry.clone())
                .map_err(|e| CollaboratorError::Model(format!("{}: {}", param.name, e)))?;
            if data.len() != param.numel() {
                return Err(CollaboratorError::ShapeMismatch {
                    what: param.name.clone(),
                    expected: param.numel(),
                    found: data.len(),
                });
            }
            param.data = data;
        }
        Ok(())
    }
}

/// The data source collaborator.
pub trait DataSource: Send {
    /// Number of batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over one epoch worth of batches.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    /// Called once per epoch before iteration starts.
    fn set_state(&mut self, _mode: Mode) {}

    /// Compute metrics from the predictions gathered over an evaluation epoch.
    ///
    /// `config` carries the stage validation settings minus the scheduling keys.
    fn evaluate(
        &self,
        _predictions: &[Value],
        _config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Metrics> {
        Err(CollaboratorError::Unsupported("evaluate".to_string()))
    }
}

/// The optimizer collaborator, bound to a model's parameters at construction.
pub trait Optimizer: Send {
    /// Clear accumulated gradients.
    fn zero_grad(&mut self, model: &mut dyn Model) {
        for param in model.parameters_mut() {
            param.grad = None;
        }
    }

    /// Apply one update using the gradients currently held by `model`.
    fn step(&mut self, model: &mut dyn Model) -> Result<()>;

    /// Serializable optimizer state (buffers and hyper-parameters).
    fn state_dict(&self) -> serde_json::Value;

    /// Restore state produced by `state_dict`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the state does not fit the bound parameters.
    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()>;

    /// Current learning rate of every parameter group.
    fn learning_rates(&self) -> Vec<f64>;

    /// Overwrite the learning rate of every parameter group.
    fn set_learning_rates(&mut self, lrs: &[f64]);
}
