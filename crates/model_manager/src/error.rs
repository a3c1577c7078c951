//! Ошибки менеджера модели.
//!
//! Ошибки загрузки фиксируются в фазе Failed; ошибки инференса не меняют фазу.

use thiserror::Error;

use crate::phase::LoadPhase;

#[derive(Error, Debug)]
pub enum ModelManagerError {
    /// Сеть, десериализация, build или compile. Повторяется новым `load()`.
    #[error("Model failed to load: {0}")]
    LoadFailed(String),

    #[error("model is not ready (phase: {0})")]
    NotReady(LoadPhase),

    /// Ошибка прямого прохода; модель остаётся Ready.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}
