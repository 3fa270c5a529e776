// rust/runtime-core/src/collective/reduce.rs

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::state::Gradients;

/// Element-wise reduction applied to the contributions of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Reduces contributions in the order given.
///
/// Floating-point addition is not associative, so callers must pass the
/// contributions in ascending worker order; every worker then produces a
/// bit-identical aggregate.
pub fn reduce<'a>(
    op: ReduceOp,
    contributions: impl IntoIterator<Item = (usize, &'a Gradients)>,
) -> Result<Gradients> {
    let mut iter = contributions.into_iter();
    let (first_worker, first) = iter
        .next()
        .ok_or_else(|| RuntimeError::collective("cannot reduce an empty round"))?;

    let mut acc = first.clone();
    let mut count = 1usize;

    for (worker, gradients) in iter {
        if gradients.len() != acc.len() || gradients.keys().ne(acc.keys()) {
            return Err(RuntimeError::collective(format!(
                "worker {worker} contributed tensors {:?}, worker {first_worker} contributed {:?}",
                gradients.keys().collect::<Vec<_>>(),
                acc.keys().collect::<Vec<_>>()
            )));
        }
        for (name, tensor) in gradients {
            // keys were just checked to match
            let Some(total) = acc.get_mut(name) else { continue };
            if total.shape != tensor.shape || total.data.len() != tensor.data.len() {
                return Err(RuntimeError::collective(format!(
                    "worker {worker} contributed '{name}' with shape {:?}, expected {:?}",
                    tensor.shape, total.shape
                )));
            }
            for (a, b) in total.data.iter_mut().zip(&tensor.data) {
                *a += *b;
            }
        }
        count += 1;
    }

    if op == ReduceOp::Mean && count > 1 {
        let scale = count as f32;
        for tensor in acc.values_mut() {
            for value in &mut tensor.data {
                *value /= scale;
            }
        }
    }

    Ok(acc)
}
