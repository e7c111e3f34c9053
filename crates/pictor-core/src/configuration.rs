//! Generation configuration carried opaquely on the wire

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A LoRA applied on top of the base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRA {
    /// File name, either human-chosen or content-addressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Blend weight
    #[serde(default = "default_lora_weight")]
    pub weight: f32,
}

impl LoRA {
    /// Create a LoRA reference
    pub fn new(file: impl Into<String>, weight: f32) -> Self {
        Self {
            file: Some(file.into()),
            weight,
        }
    }
}

fn default_lora_weight() -> f32 {
    0.6
}

/// Generation configuration
///
/// Only the fields the serving layer inspects are typed. Everything else is
/// kept in `extra` so a rewritten configuration round-trips keys this crate
/// does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfiguration {
    /// Denoising steps
    #[serde(default)]
    pub steps: u32,
    /// Base model file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// LoRAs in application order
    #[serde(default)]
    pub loras: Vec<LoRA>,
    /// Seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    /// Output width in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Output height in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Remaining, uninterpreted fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GenerationConfiguration {
    fn default() -> Self {
        Self {
            steps: 20,
            model: None,
            loras: Vec::new(),
            seed: None,
            width: None,
            height: None,
            extra: Map::new(),
        }
    }
}

impl GenerationConfiguration {
    /// Decode from wire bytes.
    ///
    /// An empty payload decodes to the default configuration.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(data).map_err(|e| CoreError::InvalidConfiguration(e.to_string()))
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::InvalidConfiguration(e.to_string()))
    }

    /// Set the base model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set step count
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Append a LoRA
    pub fn with_lora(mut self, lora: LoRA) -> Self {
        self.loras.push(lora);
        self
    }

    /// LoRA file names, skipping entries without a file
    pub fn lora_files(&self) -> Vec<&str> {
        self.loras.iter().filter_map(|l| l.file.as_deref()).collect()
    }

    /// Produce a copy whose LoRA file names are mapped through `rename`.
    ///
    /// Entries without a file are dropped.
    pub fn map_lora_files(&self, rename: impl Fn(&str) -> String) -> Self {
        let loras = self
            .loras
            .iter()
            .filter_map(|lora| {
                lora.file.as_deref().map(|file| LoRA {
                    file: Some(rename(file)),
                    weight: lora.weight,
                })
            })
            .collect();

        Self {
            loras,
            ..self.clone()
        }
    }
}
