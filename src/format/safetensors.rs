use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::error::{IoContext, Result};
use crate::format::{foreign_descriptor, CheckpointFormat, Format};
use crate::ir::{Architecture, Metadata, ModelIR, WeightStore};

pub const MARKER: &str = "direct_safetensors";

/// The identity case: the archive already is a weight store.
pub struct SafetensorsFormat;

impl CheckpointFormat for SafetensorsFormat {
    fn format(&self) -> Format {
        Format::SafeTensors
    }

    fn extract(&self, path: &Path) -> Result<ModelIR> {
        let bytes = std::fs::read(path).at(path)?;
        let size = bytes.len();
        let weights = WeightStore::from_bytes(bytes)?;
        info!(
            path = %path.display(),
            bytes = size,
            tensors = weights.len(),
            "adopted safetensors archive"
        );

        let mut metadata = Metadata::new();
        metadata.insert("info".to_string(), Value::String(MARKER.to_string()));
        Ok(ModelIR::new(weights, Architecture::FlatArchive, metadata))
    }

    fn rebuild(&self, ir: &ModelIR, output: &Path) -> Result<()> {
        if ir.architecture != Architecture::FlatArchive {
            return Err(foreign_descriptor(self.format(), &ir.architecture));
        }
        ir.weights.save(output)
    }
}
