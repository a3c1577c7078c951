//! Конфигурация менеджера (~/.model_loader/config.json): адрес модели, форма входа, compile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use model_runtime::{CompileConfig, SourceFetcher};
use serde::{Deserialize, Serialize};

use crate::error::ModelManagerError;

pub const DEFAULT_MODEL_URL: &str = "/web_model/model.json";
pub const DEFAULT_INPUT_SHAPE: [usize; 4] = [1, 55, 47, 3];
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const CONFIG_DIR: &str = ".model_loader";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub model_url: String,
    /// Ожидаемая форма входа, включая batch. Сверяется с сигнатурой модели при загрузке.
    pub input_shape: Vec<usize>,
    pub optimizer: String,
    pub loss: String,
    pub metrics: Vec<String>,
    /// Корень для путей вида `/web_model/model.json`.
    pub asset_root: PathBuf,
    pub http_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let compile = CompileConfig::default();
        Self {
            model_url: DEFAULT_MODEL_URL.to_string(),
            input_shape: DEFAULT_INPUT_SHAPE.to_vec(),
            optimizer: compile.optimizer,
            loss: compile.loss,
            metrics: compile.metrics,
            asset_root: PathBuf::from("."),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl ModelConfig {
    /// Путь к файлу конфига.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Загружает конфиг из файла по умолчанию. Нет файла — значения по умолчанию.
    pub fn load() -> Result<Self, ModelManagerError> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ModelManagerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&s)
            .map_err(|e| ModelManagerError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ModelManagerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ModelManagerError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModelManagerError> {
        if self.model_url.trim().is_empty() {
            return Err(ModelManagerError::Config("modelUrl is empty".into()));
        }
        if self.input_shape.is_empty() {
            return Err(ModelManagerError::Config("inputShape is empty".into()));
        }
        if self.input_shape.contains(&0) {
            return Err(ModelManagerError::Config(format!(
                "inputShape {:?} has a zero dimension",
                self.input_shape
            )));
        }
        if self.optimizer.trim().is_empty() || self.loss.trim().is_empty() {
            return Err(ModelManagerError::Config("optimizer and loss are required".into()));
        }
        Ok(())
    }

    pub fn compile_config(&self) -> CompileConfig {
        CompileConfig {
            optimizer: self.optimizer.clone(),
            loss: self.loss.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Загрузчик артефактов: HTTP(S) или файлы от `asset_root`.
    pub fn fetcher(&self) -> Result<SourceFetcher, ModelManagerError> {
        SourceFetcher::new(self.asset_root.clone(), self.http_timeout())
            .map_err(|e| ModelManagerError::Config(e.to_string()))
    }
}
