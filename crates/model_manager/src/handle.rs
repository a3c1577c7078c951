//! Загруженная и скомпилированная модель, которой владеет менеджер.

use std::fmt;

use model_runtime::{CompileConfig, LayerSummary, Model};

use crate::phase::LoadToken;

/// Создаётся только успешным `load()`. Раннер получает `&ModelHandle` на время одного вызова.
pub struct ModelHandle {
    model: Box<dyn Model>,
    source: String,
    token: LoadToken,
    input_shape: Vec<usize>,
    summary: Vec<LayerSummary>,
}

impl ModelHandle {
    pub(crate) fn new(
        model: Box<dyn Model>,
        source: String,
        token: LoadToken,
        input_shape: Vec<usize>,
    ) -> Self {
        let summary = model.summary();
        Self {
            model,
            source,
            token,
            input_shape,
            summary,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn token(&self) -> LoadToken {
        self.token
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Конфигурация, с которой модель скомпилирована.
    pub fn compile_config(&self) -> Option<&CompileConfig> {
        self.model.compiled()
    }

    pub fn output_shape(&self) -> Option<&[usize]> {
        self.model.output_shape()
    }

    pub fn summary(&self) -> &[LayerSummary] {
        &self.summary
    }

    pub fn is_disposed(&self) -> bool {
        self.model.is_disposed()
    }

    pub(crate) fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub(crate) fn dispose(&mut self) {
        if !self.model.is_disposed() {
            tracing::debug!(source = %self.source, token = %self.token, "model handle disposed");
        }
        self.model.dispose();
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.model.name())
            .field("source", &self.source)
            .field("token", &self.token)
            .field("input_shape", &self.input_shape)
            .field("compile", &self.model.compiled())
            .field("disposed", &self.model.is_disposed())
            .finish()
    }
}
