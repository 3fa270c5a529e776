// rust/runtime-core/src/dataset/traits.rs

use crate::error::{Result, RuntimeError};

/// Random-access dataset of known cardinality.
///
/// Every worker must see the same elements at the same indices; the shard
/// assigner only hands out indices.
pub trait Dataset: Send + Sync {
    type Item: Clone + Send;

    /// Number of elements.
    fn cardinality(&self) -> usize;

    /// Element at `index`, which is always below `cardinality()`.
    fn element_at(&self, index: usize) -> Result<Self::Item>;

    /// Fetches a batch of elements by index.
    fn batch(&self, indices: &[usize]) -> Result<Vec<Self::Item>> {
        indices.iter().map(|&i| self.element_at(i)).collect()
    }
}

/// In-memory dataset
#[derive(Debug, Clone)]
pub struct VecDataset<T> {
    elements: Vec<T>,
}

impl<T> VecDataset<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { elements }
    }
}

impl<T> From<Vec<T>> for VecDataset<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::new(elements)
    }
}

impl<T: Clone + Send + Sync> Dataset for VecDataset<T> {
    type Item = T;

    fn cardinality(&self) -> usize {
        self.elements.len()
    }

    fn element_at(&self, index: usize) -> Result<T> {
        self.elements.get(index).cloned().ok_or_else(|| {
            RuntimeError::dataset(format!(
                "index {index} out of range for dataset of {} elements",
                self.elements.len()
            ))
        })
    }
}
