//! Формат артефакта: `model.json` (layers-model) + бинарные шарды весов.
//!
//! Шарды одной группы конкатенируются в порядке `paths`, веса читаются подряд (float32, little-endian).

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::tensor::element_count;

/// Содержимое `model.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifact {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub generated_by: Option<String>,
    #[serde(default)]
    pub converted_by: Option<String>,
    pub model_topology: Value,
    #[serde(default)]
    pub weights_manifest: Vec<WeightGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "float32".to_string()
}

/// Декодированный вес.
#[derive(Debug, Clone)]
pub struct NamedWeight {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ModelArtifact {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Конфиг модели: `modelTopology.model_config` (формат Keras) или сам `modelTopology`.
    pub fn model_config(&self) -> &Value {
        self.model_topology
            .get("model_config")
            .unwrap_or(&self.model_topology)
    }

    pub fn model_class(&self) -> Option<&str> {
        self.model_config().get("class_name").and_then(Value::as_str)
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_config()
            .get("config")
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
    }

    /// Описания слоёв Sequential-модели. `config` бывает объектом с `layers` или сразу массивом.
    pub fn layer_values(&self) -> Result<&[Value]> {
        match self.model_class() {
            Some("Sequential") => {}
            Some(other) => {
                return Err(RuntimeError::UnsupportedLayer(format!(
                    "model class {other} (only Sequential is supported)"
                )))
            }
            None => {
                return Err(RuntimeError::InvalidArtifact(
                    "modelTopology has no class_name".into(),
                ))
            }
        }
        let config = self
            .model_config()
            .get("config")
            .ok_or_else(|| RuntimeError::InvalidArtifact("model config is missing".into()))?;
        let layers = match config {
            Value::Array(items) => items,
            _ => config
                .get("layers")
                .and_then(Value::as_array)
                .ok_or_else(|| RuntimeError::InvalidArtifact("model config has no layers".into()))?,
        };
        Ok(layers.as_slice())
    }
}

/// Разбирает буфер группы на веса по манифесту.
pub fn decode_weights(group: &WeightGroup, buffer: &[u8]) -> Result<Vec<NamedWeight>> {
    let mut offset = 0usize;
    let mut out = Vec::with_capacity(group.weights.len());
    for entry in &group.weights {
        if entry.dtype != "float32" {
            return Err(RuntimeError::UnsupportedDtype {
                name: entry.name.clone(),
                dtype: entry.dtype.clone(),
            });
        }
        let len = element_count(&entry.shape)
            .and_then(|count| count.checked_mul(4))
            .ok_or_else(|| {
                RuntimeError::InvalidArtifact(format!("weight {} has an oversized shape {:?}", entry.name, entry.shape))
            })?;
        let end = offset.checked_add(len).filter(|end| *end <= buffer.len());
        let Some(end) = end else {
            return Err(RuntimeError::InvalidArtifact(format!(
                "weight data too short for {} (need {} bytes at offset {}, have {})",
                entry.name,
                len,
                offset,
                buffer.len()
            )));
        };
        let values = buffer[offset..end]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        out.push(NamedWeight {
            name: entry.name.clone(),
            shape: entry.shape.clone(),
            values,
        });
        offset = end;
    }
    if offset != buffer.len() {
        tracing::warn!(
            unused = buffer.len() - offset,
            "weight group has trailing bytes"
        );
    }
    Ok(out)
}
