//! Ошибки рантайма: загрузка артефакта, декодирование, формы, выполнение.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("unsupported layer: {0}")]
    UnsupportedLayer(String),

    #[error("unsupported activation: {0}")]
    UnsupportedActivation(String),

    #[error("unsupported dtype {dtype} for weight {name}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("missing weight: {0}")]
    MissingWeight(String),

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("compile failed: {0}")]
    Compile(String),

    #[error("model is not built")]
    NotBuilt,

    #[error("model is disposed")]
    Disposed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        RuntimeError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
