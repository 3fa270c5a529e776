// rust/runtime-core/src/state.rs

//! Training state and the parameter update.
//!
//! Tensors are opaque numeric blobs to the coordination core: a shape and a
//! flat `f32` buffer. Maps are ordered so every worker iterates parameters
//! and gradients in the same order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(RuntimeError::collective(format!(
                "tensor of shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub type Parameters = BTreeMap<String, Tensor>;
pub type Gradients = BTreeMap<String, Tensor>;

/// Everything needed to resume training: the step counter, the epoch it
/// falls in, and the model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Number of completed optimization steps.
    pub step: u64,
    pub epoch: u64,
    pub parameters: Parameters,
}

impl TrainingState {
    pub fn initial(parameters: Parameters) -> Self {
        Self {
            step: 0,
            epoch: 0,
            parameters,
        }
    }
}

/// Applies an aggregated gradient to the parameters.
///
/// Implementations must be deterministic: workers that apply the same
/// aggregate to the same parameters must end with bit-identical results.
pub trait Optimizer: Send + Sync {
    fn apply(&self, parameters: &mut Parameters, gradients: &Gradients) -> Result<()>;
}

/// Plain stochastic gradient descent.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn apply(&self, parameters: &mut Parameters, gradients: &Gradients) -> Result<()> {
        // Validate everything before touching anything, so a bad gradient
        // never leaves parameters half-updated.
        for (name, grad) in gradients {
            let param = parameters.get(name).ok_or_else(|| {
                RuntimeError::collective(format!("gradient for unknown parameter '{name}'"))
            })?;
            if param.shape != grad.shape || param.data.len() != grad.data.len() {
                return Err(RuntimeError::collective(format!(
                    "gradient shape {:?} does not match parameter '{name}' shape {:?}",
                    grad.shape, param.shape
                )));
            }
        }

        for (name, grad) in gradients {
            if let Some(param) = parameters.get_mut(name) {
                for (p, g) in param.data.iter_mut().zip(&grad.data) {
                    *p -= self.learning_rate * g;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        let mut p = Parameters::new();
        p.insert("w".to_string(), Tensor::vector(vec![1.0, 2.0]));
        p.insert("b".to_string(), Tensor::scalar(0.5));
        p
    }

    #[test]
    fn test_tensor_new_checks_shape() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert_eq!(Tensor::zeros(vec![2, 2]).len(), 4);
        assert_eq!(Tensor::scalar(3.0).shape, Vec::<usize>::new());
    }

    #[test]
    fn test_sgd_apply() {
        let mut p = params();
        let mut g = Gradients::new();
        g.insert("w".to_string(), Tensor::vector(vec![10.0, -10.0]));

        Sgd::new(0.1).apply(&mut p, &g).unwrap();

        assert_eq!(p["w"].data, vec![0.0, 3.0]);
        // parameters without a gradient are left alone
        assert_eq!(p["b"].data, vec![0.5]);
    }

    #[test]
    fn test_sgd_rejects_unknown_parameter() {
        let mut p = params();
        let mut g = Gradients::new();
        g.insert("w".to_string(), Tensor::vector(vec![1.0, 1.0]));
        g.insert("missing".to_string(), Tensor::scalar(1.0));

        assert!(Sgd::new(0.1).apply(&mut p, &g).is_err());
        // no partial update
        assert_eq!(p, params());
    }

    #[test]
    fn test_sgd_rejects_shape_mismatch() {
        let mut p = params();
        let mut g = Gradients::new();
        g.insert("w".to_string(), Tensor::vector(vec![1.0, 1.0, 1.0]));

        assert!(Sgd::new(0.1).apply(&mut p, &g).is_err());
    }

    #[test]
    fn test_state_serialization() {
        let state = TrainingState {
            step: 7,
            epoch: 1,
            parameters: params(),
        };
        let bytes = bincode::serialize(&state).unwrap();
        let decoded: TrainingState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, state);
    }
}
