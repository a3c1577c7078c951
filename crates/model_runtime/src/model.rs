//! Модель и загрузчик: единый интерфейс рантайма для менеджера жизненного цикла.
//!
//! `LayersModel` — Sequential-граф из `model.json`; веса живут в тензорах движка,
//! поэтому `dispose()` возвращает счётчики памяти к исходным значениям.

use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use serde::Serialize;

use crate::artifact::{decode_weights, ModelArtifact};
use crate::compile::CompileConfig;
use crate::engine::Engine;
use crate::error::{Result, RuntimeError};
use crate::fetch::{resolve_relative, ArtifactFetcher};
use crate::layers::{Layer, LayerSpec, WeightStore};
use crate::tensor::OwnedTensor;

/// Строка сводки модели (аналог `model.summary()`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub class_name: String,
    pub output_shape: Vec<usize>,
    pub params: usize,
}

/// Загруженная модель. Менеджер владеет ею эксклюзивно; раннер получает `&dyn Model` на время вызова.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Входная сигнатура из артефакта (`None` в измерении — любое значение).
    fn declared_input_shape(&self) -> Option<&[Option<usize>]>;

    /// Форма входа после `build`.
    fn input_shape(&self) -> Option<&[usize]>;

    fn output_shape(&self) -> Option<&[usize]>;

    /// Строгая проверка формы входа против сигнатуры и весов.
    async fn build(&mut self, input_shape: &[usize]) -> Result<()>;

    async fn compile(&mut self, config: &CompileConfig) -> Result<()>;

    fn compiled(&self) -> Option<&CompileConfig>;

    /// Прямой проход. Промежуточные буферы освобождаются внутри; вызывающий владеет результатом.
    async fn predict(&self, engine: &Engine, input: &OwnedTensor) -> Result<OwnedTensor>;

    fn summary(&self) -> Vec<LayerSummary>;

    /// Освобождает веса. Повторный вызов ничего не делает.
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}

/// Загрузка и десериализация модели по адресу.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, source: &str) -> Result<Box<dyn Model>>;
}

pub struct LayersModel {
    name: String,
    layers: Vec<Layer>,
    declared_input: Option<Vec<Option<usize>>>,
    input_shape: Option<Vec<usize>>,
    output_shape: Option<Vec<usize>>,
    compiled: Option<CompileConfig>,
    disposed: bool,
}

impl LayersModel {
    /// Собирает модель из артефакта и уже декодированных весов.
    pub(crate) fn from_parts(artifact: &ModelArtifact, weights: &mut WeightStore) -> Result<Self> {
        let specs = artifact
            .layer_values()?
            .iter()
            .enumerate()
            .map(|(i, v)| LayerSpec::from_value(i, v))
            .collect::<Result<Vec<_>>>()?;
        if specs.is_empty() {
            return Err(RuntimeError::InvalidArtifact("model has no layers".into()));
        }
        let declared_input = specs.first().and_then(|s| s.batch_input_shape.clone());
        let layers = specs
            .iter()
            .map(|s| Layer::from_spec(s, weights))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: artifact.model_name().unwrap_or("sequential").to_string(),
            layers,
            declared_input,
            input_shape: None,
            output_shape: None,
            compiled: None,
            disposed: false,
        })
    }

    fn check_signature(&self, input_shape: &[usize]) -> Result<()> {
        let Some(declared) = &self.declared_input else {
            return Ok(());
        };
        let compatible = declared.len() == input_shape.len()
            && declared
                .iter()
                .zip(input_shape)
                .all(|(d, a)| d.map_or(true, |d| d == *a));
        if compatible {
            return Ok(());
        }
        let expected: Vec<usize> = declared
            .iter()
            .enumerate()
            .map(|(i, d)| d.unwrap_or_else(|| input_shape.get(i).copied().unwrap_or(0)))
            .collect();
        Err(RuntimeError::shape("input signature", &expected, input_shape))
    }
}

#[async_trait]
impl Model for LayersModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared_input_shape(&self) -> Option<&[Option<usize>]> {
        self.declared_input.as_deref()
    }

    fn input_shape(&self) -> Option<&[usize]> {
        self.input_shape.as_deref()
    }

    fn output_shape(&self) -> Option<&[usize]> {
        self.output_shape.as_deref()
    }

    async fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        if input_shape.is_empty() || input_shape.contains(&0) {
            return Err(RuntimeError::InvalidInput(format!(
                "input shape {input_shape:?} must be non-empty with positive dimensions"
            )));
        }
        self.check_signature(input_shape)?;
        let mut shape = input_shape.to_vec();
        for layer in &mut self.layers {
            shape = layer.build(&shape)?;
            tracing::debug!(layer = %layer.name(), output_shape = ?shape, "layer built");
        }
        self.input_shape = Some(input_shape.to_vec());
        self.output_shape = Some(shape);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn compile(&mut self, config: &CompileConfig) -> Result<()> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        config.validate()?;
        self.compiled = Some(config.clone());
        tokio::task::yield_now().await;
        Ok(())
    }

    fn compiled(&self) -> Option<&CompileConfig> {
        self.compiled.as_ref()
    }

    async fn predict(&self, engine: &Engine, input: &OwnedTensor) -> Result<OwnedTensor> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        let expected = self.input_shape.as_deref().ok_or(RuntimeError::NotBuilt)?;
        if input.shape() != expected {
            return Err(RuntimeError::shape("predict input", expected, input.shape()));
        }

        let mut current: Option<OwnedTensor> = None;
        for layer in &self.layers {
            let x = current.as_ref().map_or(input.data(), OwnedTensor::data);
            let y = layer.forward(x)?;
            // предыдущая активация освобождается здесь
            current = Some(engine.tensor(y));
            tokio::task::yield_now().await;
        }
        Ok(match current {
            Some(t) => t,
            None => engine.tensor(input.data().clone()),
        })
    }

    fn summary(&self) -> Vec<LayerSummary> {
        self.layers
            .iter()
            .map(|l| LayerSummary {
                name: l.name().to_string(),
                class_name: l.class_name().to_string(),
                output_shape: l.output_shape().map(<[usize]>::to_vec).unwrap_or_default(),
                params: l.param_count(),
            })
            .collect()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.layers.clear();
        self.disposed = true;
        tracing::debug!(model = %self.name, "model weights released");
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

/// Загрузчик layers-моделей: `model.json` → шарды весов → граф.
pub struct LayersModelLoader {
    fetcher: Arc<dyn ArtifactFetcher>,
    engine: Engine,
}

impl LayersModelLoader {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, engine: Engine) -> Self {
        Self { fetcher, engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn load_layers_model(&self, source: &str) -> Result<LayersModel> {
        let descriptor = self.fetcher.fetch(source).await?;
        let artifact = ModelArtifact::from_slice(&descriptor)?;
        tracing::debug!(
            source = %source,
            format = ?artifact.format,
            generated_by = ?artifact.generated_by,
            converted_by = ?artifact.converted_by,
            groups = artifact.weights_manifest.len(),
            "model descriptor parsed"
        );

        let mut store = WeightStore::default();
        for group in &artifact.weights_manifest {
            let mut buffer = Vec::new();
            for (idx, path) in group.paths.iter().enumerate() {
                let location = resolve_relative(source, path);
                let shard = self.fetcher.fetch(&location).await?;
                tracing::debug!(shard = %location, index = idx + 1, count = group.paths.len(), bytes = shard.len(), "weight shard fetched");
                buffer.extend_from_slice(&shard);
            }
            for weight in decode_weights(group, &buffer)? {
                let data = ArrayD::from_shape_vec(IxDyn(&weight.shape), weight.values)
                    .map_err(|e| RuntimeError::InvalidArtifact(format!("{}: {e}", weight.name)))?;
                store.insert(weight.name, self.engine.tensor(data));
            }
        }

        let model = LayersModel::from_parts(&artifact, &mut store)?;
        let unused = store.leftover_names();
        if !unused.is_empty() {
            tracing::warn!(source = %source, unused = ?unused, "weights not bound to any layer were dropped");
        }
        Ok(model)
    }
}

#[async_trait]
impl ModelLoader for LayersModelLoader {
    async fn load(&self, source: &str) -> Result<Box<dyn Model>> {
        let model = self.load_layers_model(source).await?;
        Ok(Box::new(model))
    }
}
