//! ModelManager — жизненный цикл модели: load → build → compile → Ready | Failed, dispose.
//!
//! Фаза, токен и источник живут под одним мьютексом; слот с моделью — под `RwLock`,
//! который раннер держит на чтение всё время вызова. Побеждает последняя загрузка:
//! результат применяется, только если токен загрузки всё ещё текущий.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use model_runtime::{Engine, LayerSummary, LayersModelLoader, Model, ModelLoader, RuntimeError};
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::config::ModelConfig;
use crate::error::ModelManagerError;
use crate::handle::ModelHandle;
use crate::phase::{LoadPhase, LoadToken, ModelStatus, PhaseEvent, PhaseTrigger};

/// Подписчик на смену фазы. Вызывается синхронно, в порядке переходов.
/// Не должен вызывать `load`/`dispose` того же менеджера изнутри.
pub type PhaseListener = Arc<dyn Fn(&PhaseEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Итог вызова `load()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Ready { token: LoadToken },
    Failed { token: LoadToken, message: String },
    /// Пока шла загрузка, началась другая (или был dispose); результат отброшен.
    Superseded { token: LoadToken },
    /// Этот источник уже грузится.
    AlreadyLoading,
    /// Этот источник уже загружен.
    AlreadyLoaded,
}

impl LoadOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadOutcome::Ready { .. } | LoadOutcome::AlreadyLoaded)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Применяет переход и записывает событие. `update` дописывает поля статуса.
fn apply(
    status: &mut ModelStatus,
    trigger: PhaseTrigger,
    events: &mut Vec<PhaseEvent>,
    update: impl FnOnce(&mut ModelStatus),
) -> bool {
    let previous = status.phase;
    match previous.next(trigger) {
        Ok(next) => {
            status.phase = next;
            update(status);
            events.push(PhaseEvent {
                previous,
                status: status.clone(),
            });
            true
        }
        Err(e) => {
            tracing::error!(error = %e, token = %status.token, "phase transition rejected");
            false
        }
    }
}

fn log_summary(source: &str, token: LoadToken, summary: &[LayerSummary]) {
    for layer in summary {
        tracing::info!(
            layer = %layer.name,
            class = %layer.class_name,
            output_shape = ?layer.output_shape,
            params = layer.params,
            "model summary"
        );
    }
    let params: usize = summary.iter().map(|l| l.params).sum();
    tracing::info!(source = %source, token = %token, layers = summary.len(), params, "model ready");
}

/// Живёт на стеке `load()`. После commit/fail/supersede фаза уже не Loading с этим
/// токеном, и drop ничего не делает.
struct LoadGuard<'a> {
    manager: &'a ModelManager,
    source: &'a str,
    token: LoadToken,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.manager.cancel(self.source, self.token);
    }
}

pub struct ModelManager {
    config: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    status: Mutex<ModelStatus>,
    /// Держится от перехода до конца уведомления: подписчики видят фазы в порядке применения.
    notify_order: Mutex<()>,
    handle: RwLock<Option<ModelHandle>>,
    listeners: Mutex<Vec<(SubscriptionId, PhaseListener)>>,
    next_subscription: AtomicU64,
}

impl ModelManager {
    pub fn new(config: ModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            config,
            loader,
            status: Mutex::new(ModelStatus::default()),
            notify_order: Mutex::new(()),
            handle: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Менеджер с загрузчиком layers-моделей (HTTP или файлы от `assetRoot`).
    /// Веса аллоцируются в `engine`; раннер должен использовать тот же движок.
    pub fn from_config(config: ModelConfig, engine: Engine) -> Result<Self, ModelManagerError> {
        config.validate()?;
        let fetcher = Arc::new(config.fetcher()?);
        let loader = Arc::new(LayersModelLoader::new(fetcher, engine));
        Ok(Self::new(config, loader))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn status(&self) -> ModelStatus {
        lock(&self.status).clone()
    }

    pub fn phase(&self) -> LoadPhase {
        lock(&self.status).phase
    }

    pub fn error_message(&self) -> Option<String> {
        lock(&self.status).error_message.clone()
    }

    pub fn subscribe(&self, listener: PhaseListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// `false`, если такой подписки нет.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Загружает модель из `source`, строит её под сконфигурированную форму входа и компилирует.
    ///
    /// Ошибка любого шага переводит в Failed с сообщением `Model failed to load: <cause>`;
    /// частично собранная модель освобождается. Если во время загрузки начата другая
    /// (или вызван `dispose`), результат отбрасывается. Если future бросили до конца
    /// (таймаут, `select!`), загрузка завершается как Failed с `load cancelled`.
    pub async fn load(&self, source: &str) -> LoadOutcome {
        let token = match self.begin(source) {
            Ok(token) => token,
            Err(outcome) => {
                tracing::debug!(source = %source, outcome = ?outcome, "load request ignored");
                return outcome;
            }
        };
        tracing::info!(source = %source, token = %token, "model load started");
        let _guard = LoadGuard {
            manager: self,
            source,
            token,
        };
        self.release_previous(token).await;

        match self.load_compiled(source, token).await {
            Ok(Some(model)) => self.commit(source, token, model).await,
            Ok(None) => {
                tracing::warn!(source = %source, token = %token, "load superseded; result dropped");
                LoadOutcome::Superseded { token }
            }
            Err(e) => self.fail(source, token, e),
        }
    }

    /// Освобождает текущую модель. Повторный вызов ничего не делает.
    /// Ждёт завершения идущих `run`. Незавершённая загрузка становится устаревшей.
    pub async fn dispose(&self) {
        let mut slot = self.handle.write().await;
        self.transition(|status, events| match status.phase {
            LoadPhase::Ready => {
                apply(status, PhaseTrigger::Reset, events, |s| s.source = None);
            }
            LoadPhase::Loading => {
                let token = status.token.next();
                apply(status, PhaseTrigger::Reset, events, |s| {
                    s.token = token;
                    s.source = None;
                });
            }
            LoadPhase::Idle | LoadPhase::Failed => {}
        });
        let old = slot.take();
        drop(slot);
        if let Some(mut old) = old {
            tracing::info!(source = %old.source(), token = %old.token(), "model disposed");
            old.dispose();
        }
    }

    /// Доступ на чтение к готовой модели. Пока guard жив, `dispose` и смена источника ждут.
    pub async fn borrow_ready(&self) -> Result<RwLockReadGuard<'_, ModelHandle>, ModelManagerError> {
        let phase = self.phase();
        if phase != LoadPhase::Ready {
            return Err(ModelManagerError::NotReady(phase));
        }
        let guard = self.handle.read().await;
        let status = self.status();
        if status.phase != LoadPhase::Ready {
            return Err(ModelManagerError::NotReady(status.phase));
        }
        RwLockReadGuard::try_map(guard, |slot| {
            slot.as_ref().filter(|h| h.token() == status.token)
        })
        .map_err(|_| ModelManagerError::NotReady(status.phase))
    }

    fn transition<R>(&self, f: impl FnOnce(&mut ModelStatus, &mut Vec<PhaseEvent>) -> R) -> R {
        let _order = lock(&self.notify_order);
        let mut events = Vec::new();
        let result = {
            let mut status = lock(&self.status);
            f(&mut status, &mut events)
        };
        self.notify(&events);
        result
    }

    fn notify(&self, events: &[PhaseEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<PhaseListener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for event in events {
            tracing::debug!(
                previous = %event.previous,
                phase = %event.phase(),
                token = %event.token(),
                "phase changed"
            );
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn begin(&self, source: &str) -> Result<LoadToken, LoadOutcome> {
        self.transition(|status, events| {
            let same_source = status.source.as_deref() == Some(source);
            match status.phase {
                LoadPhase::Loading if same_source => return Err(LoadOutcome::AlreadyLoading),
                LoadPhase::Ready if same_source => return Err(LoadOutcome::AlreadyLoaded),
                LoadPhase::Ready => {
                    apply(status, PhaseTrigger::Reset, events, |s| s.source = None);
                }
                LoadPhase::Idle | LoadPhase::Loading | LoadPhase::Failed => {}
            }
            let token = status.token.next();
            apply(status, PhaseTrigger::Begin, events, |s| {
                s.token = token;
                s.source = Some(source.to_string());
                s.error_message = None;
            });
            Ok(token)
        })
    }

    /// Брошенная на полпути загрузка: если она всё ещё текущая, фаза уходит в Failed.
    fn cancel(&self, source: &str, token: LoadToken) {
        let message = ModelManagerError::LoadFailed("load cancelled".to_string()).to_string();
        let applied = self.transition(|status, events| {
            if status.token != token || status.phase != LoadPhase::Loading {
                return false;
            }
            apply(status, PhaseTrigger::Fail, events, |s| {
                s.error_message = Some(message);
            })
        });
        if applied {
            tracing::warn!(source = %source, token = %token, "model load cancelled");
        }
    }

    fn is_current(&self, token: LoadToken) -> bool {
        let status = lock(&self.status);
        status.token == token && status.phase == LoadPhase::Loading
    }

    /// Прежняя модель освобождается до начала новой загрузки.
    async fn release_previous(&self, token: LoadToken) {
        let old = {
            let mut slot = self.handle.write().await;
            if slot.as_ref().is_some_and(|h| h.token() < token) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(mut old) = old {
            tracing::info!(source = %old.source(), token = %old.token(), "previous model released");
            old.dispose();
        }
    }

    /// `Ok(None)` — загрузка устарела, модель уже освобождена.
    async fn load_compiled(
        &self,
        source: &str,
        token: LoadToken,
    ) -> Result<Option<Box<dyn Model>>, RuntimeError> {
        let mut model = self.loader.load(source).await?;
        if !self.is_current(token) {
            model.dispose();
            return Ok(None);
        }
        let prepared = self.prepare(model.as_mut(), token).await;
        match prepared {
            Ok(true) => Ok(Some(model)),
            Ok(false) => {
                model.dispose();
                Ok(None)
            }
            Err(e) => {
                model.dispose();
                Err(e)
            }
        }
    }

    async fn prepare(&self, model: &mut dyn Model, token: LoadToken) -> Result<bool, RuntimeError> {
        tracing::debug!(
            token = %token,
            model = %model.name(),
            declared_input_shape = ?model.declared_input_shape(),
            "building model"
        );
        model.build(&self.config.input_shape).await?;
        tracing::debug!(token = %token, input_shape = ?self.config.input_shape, "model built");
        if !self.is_current(token) {
            return Ok(false);
        }
        let compile = self.config.compile_config();
        model.compile(&compile).await?;
        tracing::debug!(
            token = %token,
            optimizer = %compile.optimizer,
            loss = %compile.loss,
            metrics = ?compile.metrics,
            "model compiled"
        );
        Ok(self.is_current(token))
    }

    async fn commit(&self, source: &str, token: LoadToken, model: Box<dyn Model>) -> LoadOutcome {
        let handle = ModelHandle::new(
            model,
            source.to_string(),
            token,
            self.config.input_shape.clone(),
        );
        let summary = handle.summary().to_vec();
        let mut pending = Some(handle);

        let mut slot = self.handle.write().await;
        let installed = self.transition(|status, events| {
            if status.token != token || status.phase != LoadPhase::Loading {
                return false;
            }
            *slot = pending.take();
            apply(status, PhaseTrigger::Succeed, events, |_| {})
        });
        drop(slot);

        if let Some(mut stale) = pending {
            stale.dispose();
            tracing::warn!(source = %source, token = %token, "load superseded; result dropped");
            return LoadOutcome::Superseded { token };
        }
        if installed {
            log_summary(source, token, &summary);
        }
        LoadOutcome::Ready { token }
    }

    fn fail(&self, source: &str, token: LoadToken, error: RuntimeError) -> LoadOutcome {
        let message = ModelManagerError::LoadFailed(error.to_string()).to_string();
        let applied = self.transition(|status, events| {
            if status.token != token || status.phase != LoadPhase::Loading {
                return false;
            }
            apply(status, PhaseTrigger::Fail, events, |s| {
                s.error_message = Some(message.clone());
            })
        });
        if applied {
            tracing::error!(source = %source, token = %token, error = %error, "model load failed");
            LoadOutcome::Failed { token, message }
        } else {
            tracing::warn!(source = %source, token = %token, error = %error, "superseded load failed; error ignored");
            LoadOutcome::Superseded { token }
        }
    }
}
