//! Pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result};

/// Options shared by the format registry and the extract/rebuild pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// File name of the persisted weight store.
    #[serde(default = "default_weights_file")]
    pub weights_file: String,

    /// File name of the persisted metadata record.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,

    /// File name of the persisted architecture descriptor.
    #[serde(default = "default_architecture_file")]
    pub architecture_file: String,

    /// Top-level keys tried, in order, for a nested state dict.
    #[serde(default = "default_nested_keys")]
    pub nested_keys: Vec<String>,
}

fn default_weights_file() -> String {
    "weights.safetensors".to_string()
}

fn default_metadata_file() -> String {
    "metadata.json".to_string()
}

fn default_architecture_file() -> String {
    "architecture.json".to_string()
}

fn default_nested_keys() -> Vec<String> {
    vec!["state_dict".to_string(), "model_state_dict".to_string()]
}

impl Default for Options {
    fn default() -> Self {
        Self {
            weights_file: default_weights_file(),
            metadata_file: default_metadata_file(),
            architecture_file: default_architecture_file(),
            nested_keys: default_nested_keys(),
        }
    }
}

impl Options {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).at(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
