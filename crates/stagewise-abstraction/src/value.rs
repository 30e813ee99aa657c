//! Host-side values produced by models and consumed by the engine.

use crate::CollaboratorError;
use serde::{Deserialize, Serialize};

/// Where the storage of a tensor lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Host memory.
    #[default]
    Host,
    /// Accelerator memory, identified by ordinal.
    Accelerator(u32),
}

/// A dense, row-major tensor of `f64` values.
///
/// The engine never does arithmetic on tensors beyond reductions used for
/// metric tracking; numeric work belongs to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
    #[serde(default)]
    device: Device,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, CollaboratorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CollaboratorError::ShapeMismatch {
                what: format!("tensor of shape {:?}", shape),
                expected,
                found: data.len(),
            });
        }
        Ok(Self { shape, data, device: Device::Host })
    }

    /// Create a one-dimensional tensor.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { shape: vec![data.len()], data, device: Device::Host }
    }

    /// Create a zero-dimensional tensor holding a single value.
    pub fn scalar(value: f64) -> Self {
        Self { shape: Vec::new(), data: vec![value], device: Device::Host }
    }

    /// Tag the tensor as living on `device`.
    #[must_use]
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The single element of a one-element tensor.
    pub fn item(&self) -> Option<f64> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Arithmetic mean of all elements, `None` for an empty tensor.
    pub fn mean(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.iter().sum::<f64>() / self.data.len() as f64)
    }

    /// A host-memory copy of this tensor.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self { shape: self.shape.clone(), data: self.data.clone(), device: Device::Host }
    }

    /// Concatenate tensors along their first dimension.
    ///
    /// Zero-dimensional tensors are treated as one-element vectors.
    pub fn concat(tensors: &[Tensor]) -> Result<Self, CollaboratorError> {
        let Some(first) = tensors.first() else {
            return Ok(Self::from_vec(Vec::new()));
        };
        let trailing = first.shape.get(1..).unwrap_or(&[]).to_vec();

        let mut rows = 0;
        let mut data = Vec::with_capacity(tensors.iter().map(Tensor::numel).sum());
        for tensor in tensors {
            let tail = tensor.shape.get(1..).unwrap_or(&[]);
            if tail != trailing.as_slice() {
                return Err(CollaboratorError::Other(format!(
                    "cannot concatenate tensor of shape {:?} with trailing dims {:?}",
                    tensor.shape, trailing
                )));
            }
            rows += tensor.shape.first().copied().unwrap_or(1);
            data.extend_from_slice(&tensor.data);
        }

        let mut shape = vec![rows];
        shape.extend(trailing);
        Self::new(shape, data)
    }
}

/// A single model output or metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Scalar(f64),
    Tensor(Tensor),
}

impl Value {
    /// The value as a plain number, if it holds exactly one element.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Scalar(v) => Some(*v),
            Self::Tensor(t) => t.item(),
        }
    }

    /// Mean over every element; an empty tensor reduces to `0.0`.
    pub fn mean(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Scalar(v) => *v,
            Self::Tensor(t) => t.mean().unwrap_or(0.0),
        }
    }

    /// Copy the value into host memory. Scalars are returned as-is.
    #[must_use]
    pub fn detach(&self) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.detach()),
            other => other.clone(),
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Scalar(f64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Tensor> for Value {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_new_rejects_bad_shape() {
        let err = Tensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, CollaboratorError::ShapeMismatch { expected: 6, found: 5, .. }));
    }

    #[test]
    fn test_concat_along_first_dim() {
        let a = Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::new(vec![2, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = Tensor::concat(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_rejects_mismatched_trailing_dims() {
        let a = Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::new(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        assert!(Tensor::concat(&[a, b]).is_err());
    }

    #[test]
    fn test_detach_moves_to_host() {
        let t = Tensor::from_vec(vec![1.0, 3.0]).on_device(Device::Accelerator(0));
        let detached = Value::Tensor(t).detach();
        assert_eq!(detached.as_tensor().unwrap().device(), Device::Host);
        assert_eq!(detached.mean(), 2.0);
    }

    #[test]
    fn test_scalar_views() {
        assert_eq!(Value::Int(3).as_scalar(), Some(3.0));
        assert_eq!(Value::Tensor(Tensor::scalar(0.5)).as_scalar(), Some(0.5));
        assert_eq!(Value::Tensor(Tensor::from_vec(vec![1.0, 2.0])).as_scalar(), None);
        assert_eq!(Value::Tensor(Tensor::from_vec(Vec::new())).mean(), 0.0);
    }

    #[test]
    fn test_untagged_roundtrip_keeps_ints() {
        let json = serde_json::to_string(&Value::Int(4)).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), Value::Int(4));
    }
}
