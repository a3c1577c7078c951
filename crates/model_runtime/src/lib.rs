//! Model Runtime — in-memory рантайм для layers-моделей (`model.json` + шарды весов).
//!
//! Тензоры, учёт памяти, загрузка артефактов (HTTP / файлы), Sequential-граф
//! с `build` → `compile` → `predict` → `dispose`.

mod artifact;
mod compile;
mod engine;
mod error;
mod fetch;
mod layers;
mod model;
mod tensor;

pub use artifact::{decode_weights, ModelArtifact, NamedWeight, WeightEntry, WeightGroup};
pub use compile::CompileConfig;
pub use engine::Engine;
pub use error::{Result, RuntimeError};
pub use fetch::{is_remote, resolve_relative, ArtifactFetcher, FsFetcher, HttpFetcher, SourceFetcher};
pub use layers::{Activation, Layer, LayerSpec, Padding};
pub use model::{LayerSummary, LayersModel, Model, ModelLoader, LayersModelLoader};
pub use tensor::{element_count, MemoryInfo, MemoryTracker, NestedValue, OwnedTensor, TensorAllocator, TensorId};
