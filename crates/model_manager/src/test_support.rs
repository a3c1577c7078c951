//! Тестовые двойники: аллокатор с журналом, управляемый загрузчик, модели-заглушки.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use model_runtime::{
    CompileConfig, Engine, LayerSummary, MemoryInfo, Model, ModelLoader, OwnedTensor, Result,
    RuntimeError, TensorAllocator, TensorId,
};
use tokio::sync::oneshot;

use crate::config::ModelConfig;

/// Аллокатор, который помнит каждый живой буфер и ловит повторное освобождение.
#[derive(Default)]
pub(crate) struct RecordingAllocator {
    next_id: AtomicU64,
    live: Mutex<HashMap<TensorId, usize>>,
    allocations: AtomicU64,
    releases: AtomicU64,
    double_releases: AtomicU64,
}

impl RecordingAllocator {
    pub(crate) fn live(&self) -> usize {
        self.live.lock().expect("allocator lock").len()
    }

    pub(crate) fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn double_releases(&self) -> u64 {
        self.double_releases.load(Ordering::SeqCst)
    }
}

impl TensorAllocator for RecordingAllocator {
    fn allocate(&self, shape: &[usize]) -> TensorId {
        let id = TensorId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let bytes = shape.iter().product::<usize>() * 4;
        self.live.lock().expect("allocator lock").insert(id, bytes);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        id
    }

    fn release(&self, id: TensorId, _shape: &[usize]) {
        if self.live.lock().expect("allocator lock").remove(&id).is_none() {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn memory(&self) -> MemoryInfo {
        let live = self.live.lock().expect("allocator lock");
        MemoryInfo {
            num_tensors: live.len(),
            num_bytes: live.values().sum(),
            allocations: self.allocations(),
            releases: self.releases(),
        }
    }
}

/// Что заглушка отдаёт из `predict`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StubOutput {
    /// Матрица `[batch, n]`.
    Matrix(usize),
    /// Скаляр (форма `[]`).
    Scalar,
    Fail(&'static str),
}

pub(crate) struct StubModel {
    declared: Option<Vec<Option<usize>>>,
    input_shape: Option<Vec<usize>>,
    output_shape: Option<Vec<usize>>,
    output: StubOutput,
    compiled: Option<CompileConfig>,
    weights: Option<OwnedTensor>,
    disposals: Arc<AtomicUsize>,
}

#[async_trait]
impl Model for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    fn declared_input_shape(&self) -> Option<&[Option<usize>]> {
        self.declared.as_deref()
    }

    fn input_shape(&self) -> Option<&[usize]> {
        self.input_shape.as_deref()
    }

    fn output_shape(&self) -> Option<&[usize]> {
        self.output_shape.as_deref()
    }

    async fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        tokio::task::yield_now().await;
        if let Some(declared) = &self.declared {
            let ok = declared.len() == input_shape.len()
                && declared.iter().zip(input_shape).all(|(d, a)| d.map_or(true, |d| d == *a));
            if !ok {
                return Err(RuntimeError::ShapeMismatch {
                    context: "input signature".into(),
                    expected: declared.iter().map(|d| d.unwrap_or(0)).collect(),
                    actual: input_shape.to_vec(),
                });
            }
        }
        let batch = input_shape.first().copied().unwrap_or(1);
        self.output_shape = Some(match self.output {
            StubOutput::Matrix(n) => vec![batch, n],
            StubOutput::Scalar => vec![],
            StubOutput::Fail(_) => vec![batch, 1],
        });
        self.input_shape = Some(input_shape.to_vec());
        Ok(())
    }

    async fn compile(&mut self, config: &CompileConfig) -> Result<()> {
        tokio::task::yield_now().await;
        config.validate()?;
        self.compiled = Some(config.clone());
        Ok(())
    }

    fn compiled(&self) -> Option<&CompileConfig> {
        self.compiled.as_ref()
    }

    async fn predict(&self, engine: &Engine, input: &OwnedTensor) -> Result<OwnedTensor> {
        if self.weights.is_none() {
            return Err(RuntimeError::Disposed);
        }
        let expected = self.input_shape.as_deref().ok_or(RuntimeError::NotBuilt)?;
        if input.shape() != expected {
            return Err(RuntimeError::ShapeMismatch {
                context: "predict input".into(),
                expected: expected.to_vec(),
                actual: input.shape().to_vec(),
            });
        }
        // промежуточный буфер, как у настоящего графа
        let hidden = engine.zeros(input.shape());
        tokio::task::yield_now().await;
        drop(hidden);
        match self.output {
            StubOutput::Matrix(n) => {
                let batch = expected.first().copied().unwrap_or(1);
                let values = (0..batch * n).map(|i| i as f32 * 0.5).collect();
                engine.from_vec(&[batch, n], values)
            }
            StubOutput::Scalar => engine.from_vec(&[], vec![0.25]),
            StubOutput::Fail(message) => Err(RuntimeError::Execution(message.to_string())),
        }
    }

    fn summary(&self) -> Vec<LayerSummary> {
        vec![LayerSummary {
            name: "stub_dense".into(),
            class_name: "Dense".into(),
            output_shape: self.output_shape.clone().unwrap_or_default(),
            params: 4,
        }]
    }

    fn dispose(&mut self) {
        if self.weights.take().is_some() {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_disposed(&self) -> bool {
        self.weights.is_none()
    }
}

type Gate = oneshot::Receiver<std::result::Result<(), String>>;

/// Загрузчик заглушек. Источник можно «придержать» до сигнала через `gate`.
pub(crate) struct StubLoader {
    engine: Engine,
    output: StubOutput,
    declared: Option<Vec<Option<usize>>>,
    gates: Mutex<HashMap<String, Gate>>,
    missing: Vec<String>,
    disposals: Arc<AtomicUsize>,
    loads: AtomicUsize,
}

impl StubLoader {
    pub(crate) fn new(engine: Engine, output: StubOutput) -> Self {
        Self {
            engine,
            output,
            declared: None,
            gates: Mutex::new(HashMap::new()),
            missing: Vec::new(),
            disposals: Arc::new(AtomicUsize::new(0)),
            loads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_declared_input(mut self, shape: Vec<Option<usize>>) -> Self {
        self.declared = Some(shape);
        self
    }

    /// Источник отвечает 404.
    pub(crate) fn with_missing(mut self, source: &str) -> Self {
        self.missing.push(source.to_string());
        self
    }

    /// Следующая загрузка `source` ждёт, пока в отправитель не придёт `Ok(())` или `Err(message)`.
    pub(crate) fn gate(&self, source: &str) -> oneshot::Sender<std::result::Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().expect("gates lock").insert(source.to_string(), rx);
        tx
    }

    pub(crate) fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for StubLoader {
    async fn load(&self, source: &str) -> Result<Box<dyn Model>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().expect("gates lock").remove(source);
        if let Some(gate) = gate {
            match gate.await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => return Err(RuntimeError::Fetch(message)),
                Err(_) => return Err(RuntimeError::Fetch("gate dropped".into())),
            }
        }
        if self.missing.iter().any(|m| m == source) {
            return Err(RuntimeError::HttpStatus {
                status: 404,
                url: source.to_string(),
            });
        }
        Ok(Box::new(StubModel {
            declared: self.declared.clone(),
            input_shape: None,
            output_shape: None,
            output: self.output,
            compiled: None,
            weights: Some(self.engine.zeros(&[2, 2])),
            disposals: Arc::clone(&self.disposals),
        }))
    }
}

pub(crate) fn small_config() -> ModelConfig {
    ModelConfig {
        input_shape: vec![1, 3],
        ..ModelConfig::default()
    }
}

/// Движок на записывающем аллокаторе.
pub(crate) fn recording_engine() -> (Arc<RecordingAllocator>, Engine) {
    let allocator = Arc::new(RecordingAllocator::default());
    let engine = Engine::new(allocator.clone());
    (allocator, engine)
}
