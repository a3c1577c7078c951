//! Параметры компиляции: оптимизатор, функция потерь, метрики.
//!
//! Обучение не поддерживается, поэтому компиляция сводится к проверке идентификаторов.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

const OPTIMIZERS: &[&str] = &["sgd", "momentum", "adam", "adamax", "adagrad", "adadelta", "rmsprop"];

const LOSSES: &[&str] = &[
    "meanSquaredError",
    "meanAbsoluteError",
    "meanAbsolutePercentageError",
    "meanSquaredLogarithmicError",
    "binaryCrossentropy",
    "categoricalCrossentropy",
    "sparseCategoricalCrossentropy",
    "kullbackLeiblerDivergence",
    "categoricalHinge",
    "hinge",
    "squaredHinge",
    "huberLoss",
    "logLoss",
    "logcosh",
    "poisson",
    "cosineProximity",
];

const METRICS: &[&str] = &[
    "accuracy",
    "acc",
    "binaryAccuracy",
    "categoricalAccuracy",
    "sparseCategoricalAccuracy",
    "topKCategoricalAccuracy",
    "precision",
    "recall",
    "meanSquaredError",
    "meanAbsoluteError",
    "meanAbsolutePercentageError",
    "mse",
    "mae",
    "mape",
    "cosineProximity",
];

/// `mean_squared_error` и `meanSquaredError` — один идентификатор.
fn canonical(id: &str) -> String {
    id.chars().filter(|c| *c != '_').flat_map(char::to_lowercase).collect()
}

fn known(list: &[&str], id: &str) -> bool {
    let id = canonical(id);
    list.iter().any(|k| canonical(k) == id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileConfig {
    pub optimizer: String,
    pub loss: String,
    pub metrics: Vec<String>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            optimizer: "adam".to_string(),
            loss: "meanSquaredError".to_string(),
            metrics: vec!["accuracy".to_string()],
        }
    }
}

impl CompileConfig {
    pub fn validate(&self) -> Result<()> {
        if !known(OPTIMIZERS, &self.optimizer) {
            return Err(RuntimeError::Compile(format!("unknown optimizer: {}", self.optimizer)));
        }
        if !known(LOSSES, &self.loss) {
            return Err(RuntimeError::Compile(format!("unknown loss: {}", self.loss)));
        }
        if let Some(m) = self.metrics.iter().find(|m| !known(METRICS, m)) {
            return Err(RuntimeError::Compile(format!("unknown metric: {m}")));
        }
        Ok(())
    }
}
