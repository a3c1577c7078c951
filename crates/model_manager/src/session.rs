//! ModelSession — то, что видит наблюдатель: фаза, сообщение об ошибке, `run()`.
//!
//! Тензоры наружу не отдаются.

use std::sync::Arc;

use model_runtime::{Engine, MemoryInfo};

use crate::config::ModelConfig;
use crate::error::ModelManagerError;
use crate::manager::{LoadOutcome, ModelManager, PhaseListener, SubscriptionId};
use crate::phase::{LoadPhase, ModelStatus};
use crate::runner::{InferenceResult, InferenceRunner, InputSpec};

pub struct ModelSession {
    manager: Arc<ModelManager>,
    runner: InferenceRunner,
    input: InputSpec,
}

impl ModelSession {
    pub fn new(manager: Arc<ModelManager>, runner: InferenceRunner, input: InputSpec) -> Self {
        Self {
            manager,
            runner,
            input,
        }
    }

    /// Менеджер и раннер на общем движке.
    pub fn from_config(config: ModelConfig, input: InputSpec) -> Result<Self, ModelManagerError> {
        let engine = Engine::default();
        let manager = ModelManager::from_config(config, engine.clone())?;
        Ok(Self::new(Arc::new(manager), InferenceRunner::new(engine), input))
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn phase(&self) -> LoadPhase {
        self.manager.phase()
    }

    pub fn error_message(&self) -> Option<String> {
        self.manager.error_message()
    }

    pub fn status(&self) -> ModelStatus {
        self.manager.status()
    }

    /// Загрузка по `modelUrl` из конфига.
    pub async fn load(&self) -> LoadOutcome {
        let source = self.manager.config().model_url.clone();
        self.manager.load(&source).await
    }

    pub async fn load_source(&self, source: &str) -> LoadOutcome {
        self.manager.load(source).await
    }

    /// Прогон на входе сессии. Ошибка логируется, результат — `None`.
    pub async fn run(&self) -> Option<InferenceResult> {
        match self.runner.run(&self.manager, &self.input).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(error = %e, phase = %self.manager.phase(), "run rejected");
                None
            }
        }
    }

    pub async fn run_with(&self, input: &InputSpec) -> Result<InferenceResult, ModelManagerError> {
        self.runner.run(&self.manager, input).await
    }

    pub fn subscribe(&self, listener: PhaseListener) -> SubscriptionId {
        self.manager.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.manager.unsubscribe(id)
    }

    pub async fn dispose(&self) {
        self.manager.dispose().await;
    }

    pub fn memory(&self) -> MemoryInfo {
        self.runner.engine().memory()
    }
}
