//! Model Manager — жизненный цикл модели и инференс.
//!
//! `ModelManager` ведёт загрузку (Idle → Loading → Ready | Failed) и владеет моделью;
//! `InferenceRunner` берёт её на чтение на один прогон; `ModelSession` — фасад для наблюдателя.

mod config;
mod error;
mod handle;
mod manager;
mod phase;
mod runner;
mod session;

#[cfg(test)]
mod test_support;

pub use config::{ModelConfig, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_INPUT_SHAPE, DEFAULT_MODEL_URL};
pub use error::ModelManagerError;
pub use handle::ModelHandle;
pub use manager::{LoadOutcome, ModelManager, PhaseListener, SubscriptionId};
pub use phase::{InvalidTransition, LoadPhase, LoadToken, ModelStatus, PhaseEvent, PhaseTrigger};
pub use runner::{InferenceResult, InferenceRunner, InputSpec};
pub use session::ModelSession;
