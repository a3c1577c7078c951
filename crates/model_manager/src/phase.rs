//! Фазы жизненного цикла модели и функция переходов.
//!
//! Idle → Loading → Ready | Failed; Ready → Idle при dispose или смене источника;
//! из Failed — только новой загрузкой.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::Loading => "loading",
            LoadPhase::Ready => "ready",
            LoadPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Событие, двигающее автомат.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTrigger {
    /// Начата загрузка (в т.ч. новая загрузка поверх незавершённой).
    Begin,
    Succeed,
    Fail,
    /// Освобождение модели или смена источника.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition: {from} on {trigger:?}")]
pub struct InvalidTransition {
    pub from: LoadPhase,
    pub trigger: PhaseTrigger,
}

impl LoadPhase {
    pub fn next(self, trigger: PhaseTrigger) -> Result<LoadPhase, InvalidTransition> {
        use LoadPhase::*;
        use PhaseTrigger::*;
        match (self, trigger) {
            (Idle | Failed | Loading, Begin) => Ok(Loading),
            (Loading, Succeed) => Ok(Ready),
            (Loading, Fail) => Ok(Failed),
            (Ready | Loading, Reset) => Ok(Idle),
            (from, trigger) => Err(InvalidTransition { from, trigger }),
        }
    }
}

/// Монотонный номер загрузки. Результат загрузки применяется, только если её токен последний.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LoadToken(pub u64);

impl LoadToken {
    pub fn next(self) -> LoadToken {
        LoadToken(self.0 + 1)
    }
}

impl fmt::Display for LoadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Снимок состояния менеджера для наблюдателей.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ModelStatus {
    pub phase: LoadPhase,
    pub token: LoadToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Уведомление подписчику: из какой фазы и в какое состояние перешли.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseEvent {
    pub previous: LoadPhase,
    #[serde(flatten)]
    pub status: ModelStatus,
}

impl PhaseEvent {
    pub fn phase(&self) -> LoadPhase {
        self.status.phase
    }

    pub fn token(&self) -> LoadToken {
        self.status.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let p = LoadPhase::Idle.next(PhaseTrigger::Begin).expect("idle → loading");
        assert_eq!(p, LoadPhase::Loading);
        assert_eq!(p.next(PhaseTrigger::Succeed), Ok(LoadPhase::Ready));
        assert_eq!(LoadPhase::Ready.next(PhaseTrigger::Reset), Ok(LoadPhase::Idle));
    }

    #[test]
    fn test_failed_only_leaves_by_new_load() {
        assert_eq!(LoadPhase::Failed.next(PhaseTrigger::Begin), Ok(LoadPhase::Loading));
        for trigger in [PhaseTrigger::Succeed, PhaseTrigger::Fail, PhaseTrigger::Reset] {
            assert!(LoadPhase::Failed.next(trigger).is_err());
        }
    }

    #[test]
    fn test_terminal_phases_need_loading_first() {
        for trigger in [PhaseTrigger::Succeed, PhaseTrigger::Fail] {
            assert!(LoadPhase::Idle.next(trigger).is_err());
            assert!(LoadPhase::Ready.next(trigger).is_err());
        }
        assert!(LoadPhase::Ready.next(PhaseTrigger::Begin).is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let status = ModelStatus {
            phase: LoadPhase::Failed,
            token: LoadToken(3),
            source: None,
            error_message: Some("Model failed to load: HTTP 404".into()),
        };
        let json = serde_json::to_value(&status).expect("serializable");
        assert_eq!(json["phase"], "failed");
        assert_eq!(json["token"], 3);
        assert!(json.get("source").is_none());
    }
}
