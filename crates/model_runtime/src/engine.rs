//! Engine — фабрика тензоров поверх общего аллокатора.

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, RuntimeError};
use crate::tensor::{element_count, MemoryInfo, MemoryTracker, OwnedTensor, TensorAllocator};

#[derive(Clone)]
pub struct Engine {
    allocator: Arc<dyn TensorAllocator>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(MemoryTracker::new()))
    }
}

impl Engine {
    pub fn new(allocator: Arc<dyn TensorAllocator>) -> Self {
        Self { allocator }
    }

    pub fn memory(&self) -> MemoryInfo {
        self.allocator.memory()
    }

    pub fn tensor(&self, data: ArrayD<f32>) -> OwnedTensor {
        OwnedTensor::new(data, Arc::clone(&self.allocator))
    }

    /// Тензор из плоского вектора. Длина должна совпадать с произведением измерений.
    pub fn from_vec(&self, shape: &[usize], values: Vec<f32>) -> Result<OwnedTensor> {
        let expected = element_count(shape)
            .ok_or_else(|| RuntimeError::InvalidInput(format!("shape {shape:?} is too large")))?;
        if values.len() != expected {
            return Err(RuntimeError::InvalidInput(format!(
                "{} values for shape {:?} (expected {})",
                values.len(),
                shape,
                expected
            )));
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| RuntimeError::InvalidInput(e.to_string()))?;
        Ok(self.tensor(data))
    }

    pub fn zeros(&self, shape: &[usize]) -> OwnedTensor {
        self.tensor(ArrayD::zeros(IxDyn(shape)))
    }

    /// Случайная выборка N(mean, std_dev) (аналог `tf.randomNormal`). С `seed` результат детерминирован.
    pub fn random_normal(
        &self,
        shape: &[usize],
        mean: f32,
        std_dev: f32,
        seed: Option<u64>,
    ) -> Result<OwnedTensor> {
        let dist = Normal::new(mean, std_dev)
            .map_err(|e| RuntimeError::InvalidInput(format!("normal distribution: {e}")))?;
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let count = element_count(shape)
            .ok_or_else(|| RuntimeError::InvalidInput(format!("shape {shape:?} is too large")))?;
        let values: Vec<f32> = (0..count).map(|_| dist.sample(&mut rng)).collect();
        self.from_vec(shape, values)
    }
}
