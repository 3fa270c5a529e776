//! Built-in demo workload: fit `y = w * x + b` to synthetic points.

use synctrain_core::state::{Gradients, Parameters, Tensor};
use synctrain_core::trainer::{StepOutput, TrainingStep};
use synctrain_core::{Result, RuntimeError, VecDataset};

const TRUE_W: f32 = 3.0;
const TRUE_B: f32 = -1.0;

/// Points on `y = 3x - 1` with a small deterministic wobble, so every
/// worker builds the same dataset without sharing files.
pub fn synthetic_dataset(size: usize) -> VecDataset<(f32, f32)> {
    let points = (0..size)
        .map(|i| {
            let x = (i as f32 / size.max(1) as f32) * 2.0 - 1.0;
            let noise = ((i * 7919) % 101) as f32 / 1010.0 - 0.05;
            (x, TRUE_W * x + TRUE_B + noise)
        })
        .collect();
    VecDataset::new(points)
}

/// Mean squared error linear regression.
pub struct SyntheticRegression;

impl TrainingStep<(f32, f32)> for SyntheticRegression {
    fn initial_parameters(&self) -> Result<Parameters> {
        let mut parameters = Parameters::new();
        parameters.insert("w".to_string(), Tensor::scalar(0.0));
        parameters.insert("b".to_string(), Tensor::scalar(0.0));
        Ok(parameters)
    }

    fn compute_gradients(&self, parameters: &Parameters, batch: &[(f32, f32)]) -> Result<StepOutput> {
        let scalar = |name: &str| {
            parameters
                .get(name)
                .and_then(|t| t.data.first().copied())
                .ok_or_else(|| RuntimeError::collective(format!("missing parameter '{name}'")))
        };
        let w = scalar("w")?;
        let b = scalar("b")?;

        let n = batch.len().max(1) as f32;
        let (mut dw, mut db, mut loss) = (0.0f32, 0.0f32, 0.0f32);
        for &(x, y) in batch {
            let err = w * x + b - y;
            dw += err * x;
            db += err;
            loss += err * err;
        }

        let mut gradients = Gradients::new();
        gradients.insert("w".to_string(), Tensor::scalar(2.0 * dw / n));
        gradients.insert("b".to_string(), Tensor::scalar(2.0 * db / n));
        Ok(StepOutput {
            gradients,
            loss: loss / n,
        })
    }
}
