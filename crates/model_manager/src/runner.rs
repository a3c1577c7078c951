//! InferenceRunner — один прямой проход по готовой модели.
//!
//! Каждый буфер, созданный внутри вызова, освобождается ровно один раз на любом пути выхода.

use model_runtime::{element_count, Engine, OwnedTensor};
use serde::{Deserialize, Serialize};

use crate::error::ModelManagerError;
use crate::handle::ModelHandle;
use crate::manager::ModelManager;

/// Чем заполнить входной тензор.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSpec {
    /// Выборка N(mean, std_dev); с `seed` — детерминированная.
    RandomNormal {
        mean: f32,
        std_dev: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Значения признаков в порядке row-major; длина = произведение формы входа.
    Values { values: Vec<f32> },
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec::random_normal(None)
    }
}

impl InputSpec {
    pub fn random_normal(seed: Option<u64>) -> Self {
        InputSpec::RandomNormal {
            mean: 0.0,
            std_dev: 1.0,
            seed,
        }
    }

    pub fn values(values: Vec<f32>) -> Self {
        InputSpec::Values { values }
    }
}

/// Первая строка выхода модели. Пустой, если выход не двумерный.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InferenceResult {
    values: Vec<f32>,
}

impl InferenceResult {
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f32>> for InferenceResult {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

#[derive(Clone)]
pub struct InferenceRunner {
    engine: Engine,
}

impl InferenceRunner {
    /// `engine` должен быть тем же, в котором загружены веса модели.
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Прогон на текущей модели менеджера. Вне Ready — `NotReady` без аллокаций.
    /// Модель занята на чтение до конца вызова.
    pub async fn run(
        &self,
        manager: &ModelManager,
        input: &InputSpec,
    ) -> Result<InferenceResult, ModelManagerError> {
        let handle = manager.borrow_ready().await?;
        self.run_with(&handle, input).await
    }

    pub async fn run_with(
        &self,
        handle: &ModelHandle,
        input: &InputSpec,
    ) -> Result<InferenceResult, ModelManagerError> {
        let input_tensor = match self.allocate_input(handle.input_shape(), input) {
            Ok(tensor) => tensor,
            Err(ModelManagerError::ShapeMismatch { expected, actual }) => {
                tracing::warn!(
                    source = %handle.source(),
                    expected = ?expected,
                    actual = ?actual,
                    "input does not match model input; returning empty result"
                );
                return Ok(InferenceResult::default());
            }
            Err(e) => return Err(e),
        };
        let predicted = handle.model().predict(&self.engine, &input_tensor).await;
        input_tensor.dispose();

        let output = predicted.map_err(|e| {
            tracing::error!(source = %handle.source(), error = %e, "inference failed");
            ModelManagerError::InferenceFailed(e.to_string())
        })?;

        let nested = output.array().await;
        let shape = output.shape().to_vec();
        output.dispose();

        match nested.first_row() {
            Some(row) => {
                tracing::debug!(source = %handle.source(), output_shape = ?shape, len = row.len(), "prediction extracted");
                Ok(InferenceResult::from(row))
            }
            None => {
                tracing::warn!(
                    source = %handle.source(),
                    output_shape = ?shape,
                    "prediction output is not 2-D; returning empty result"
                );
                Ok(InferenceResult::default())
            }
        }
    }

    fn allocate_input(&self, shape: &[usize], input: &InputSpec) -> Result<OwnedTensor, ModelManagerError> {
        match input {
            InputSpec::RandomNormal { mean, std_dev, seed } => self
                .engine
                .random_normal(shape, *mean, *std_dev, *seed)
                .map_err(|e| {
                    tracing::error!(error = %e, "input sampling failed");
                    ModelManagerError::InferenceFailed(e.to_string())
                }),
            InputSpec::Values { values } => {
                if element_count(shape) != Some(values.len()) {
                    return Err(ModelManagerError::ShapeMismatch {
                        expected: shape.to_vec(),
                        actual: vec![values.len()],
                    });
                }
                self.engine
                    .from_vec(shape, values.clone())
                    .map_err(|e| ModelManagerError::InferenceFailed(e.to_string()))
            }
        }
    }
}
