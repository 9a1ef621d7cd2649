//! `.keras` v3 zip archives.
//!
//! ```text
//! metadata.json               keras version, save date
//! config.json                 model config, training state under `compile_config`
//! model.weights.safetensors   variables keyed by their layer path
//! ```
//!
//! Archives whose variables live in `model.weights.h5` are recognized but not
//! read.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{LayeredBackend, LayeredModel};
use crate::error::{Error, IoContext, Result};
use crate::ir::{DataType, Tensor, WeightStore};

pub const METADATA_ENTRY: &str = "metadata.json";
pub const CONFIG_ENTRY: &str = "config.json";
pub const WEIGHTS_ENTRY: &str = "model.weights.safetensors";
const HDF5_WEIGHTS_ENTRY: &str = "model.weights.h5";
const COMPILE_CONFIG_KEY: &str = "compile_config";

/// What this backend stores as the model topology: the archive's config
/// without its training state, plus the variable list needed to
/// re-instantiate the weights.
#[derive(Debug, Serialize, Deserialize)]
struct Topology {
    config: Value,
    #[serde(default)]
    metadata: Map<String, Value>,
    variables: Vec<VariableDecl>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VariableDecl {
    name: String,
    shape: Vec<usize>,
    dtype: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KerasArchiveBackend;

fn parse_topology(topology: &str) -> Result<Topology> {
    serde_json::from_str(topology)
        .map_err(|e| Error::Backend(format!("unreadable .keras topology: {}", e)))
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    path: &Path,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data).at(path)?;
    Ok(Some(data))
}

impl LayeredBackend for KerasArchiveBackend {
    fn name(&self) -> &str {
        "keras_v3"
    }

    fn load(&self, path: &Path) -> Result<LayeredModel> {
        let file = File::open(path).at(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| {
            Error::Backend(format!("{} is not a .keras archive: {}", path.display(), e))
        })?;

        let mut config: Value = match read_entry(&mut archive, CONFIG_ENTRY, path)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => {
                return Err(Error::Backend(format!(
                    "{} has no {}",
                    path.display(),
                    CONFIG_ENTRY
                )))
            }
        };
        let metadata = match read_entry(&mut archive, METADATA_ENTRY, path)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Map::new(),
        };

        let weights = match read_entry(&mut archive, WEIGHTS_ENTRY, path)? {
            Some(raw) => WeightStore::from_bytes(raw)?,
            None if archive.file_names().any(|n| n == HDF5_WEIGHTS_ENTRY) => {
                return Err(Error::Backend(format!(
                    "{} keeps its variables in {}, which this backend cannot read",
                    path.display(),
                    HDF5_WEIGHTS_ENTRY
                )))
            }
            None => WeightStore::new(),
        };

        let training_config = config
            .as_object_mut()
            .and_then(|c| c.remove(COMPILE_CONFIG_KEY))
            .filter(|v| !v.is_null());

        let variables = weights
            .iter()
            .map(|t| VariableDecl {
                name: t.name.clone(),
                shape: t.shape.clone(),
                dtype: t.data_type.name().to_string(),
            })
            .collect();
        let topology = serde_json::to_string(&Topology {
            config,
            metadata,
            variables,
        })?;
        debug!(path = %path.display(), variables = weights.len(), "read .keras archive");

        Ok(LayeredModel {
            topology,
            training_config,
            weights: weights.iter().cloned().collect(),
        })
    }

    fn from_topology(&self, topology: &str) -> Result<LayeredModel> {
        let parsed = parse_topology(topology)?;
        let weights = parsed
            .variables
            .into_iter()
            .map(|v| {
                let data_type = DataType::from_name(&v.dtype).ok_or_else(|| {
                    Error::Backend(format!("variable '{}' has unknown dtype {}", v.name, v.dtype))
                })?;
                let len = v.shape.iter().product::<usize>() * data_type.size();
                Ok(Tensor {
                    name: v.name,
                    shape: v.shape,
                    data_type,
                    data: vec![0; len],
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LayeredModel {
            topology: topology.to_string(),
            training_config: None,
            weights,
        })
    }

    fn save(&self, model: &LayeredModel, path: &Path) -> Result<()> {
        let parsed = parse_topology(&model.topology)?;
        let mut config = parsed.config;
        if let (Some(training), Some(object)) = (&model.training_config, config.as_object_mut()) {
            object.insert(COMPILE_CONFIG_KEY.to_string(), training.clone());
        }
        let mut weights = WeightStore::new();
        for tensor in &model.weights {
            weights.insert(tensor.clone())?;
        }

        let file = File::create(path).at(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec(&parsed.metadata)?).at(path)?;
        zip.start_file(CONFIG_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec(&config)?).at(path)?;
        zip.start_file(WEIGHTS_ENTRY, options)?;
        zip.write_all(&weights.to_bytes()?).at(path)?;
        zip.finish()?;
        Ok(())
    }
}
