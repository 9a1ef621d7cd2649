//! Layered models rebuilt from a serialized topology.
//!
//! Reading and writing the on-disk container (HDF5, `.keras` zip, SavedModel
//! directories) is delegated to a [`LayeredBackend`]; this module owns the
//! mapping between the backend's positional weight list and the store.
//! [`archive::KerasArchiveBackend`] handles `.keras` v3 zips.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::{foreign_descriptor, CheckpointFormat, Format};
use crate::ir::{Architecture, Metadata, ModelIR, Tensor, WeightStore};

pub mod archive;

pub use archive::KerasArchiveBackend;

pub const TRAINING_CONFIG_KEY: &str = "training_config";

/// A layered model as a backend sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LayeredModel {
    /// Opaque serialized topology, sufficient to re-instantiate the model.
    pub topology: String,
    pub training_config: Option<Value>,
    /// Variables in the model's own enumeration order, under their runtime
    /// names (e.g. `dense/kernel:0`).
    pub weights: Vec<Tensor>,
}

pub trait LayeredBackend {
    fn name(&self) -> &str;

    fn load(&self, path: &Path) -> Result<LayeredModel>;

    /// Instantiate a fresh model whose weight list has the shapes and dtypes
    /// the topology declares.
    fn from_topology(&self, topology: &str) -> Result<LayeredModel>;

    fn save(&self, model: &LayeredModel, path: &Path) -> Result<()>;
}

/// `"<index>/<variable name>"` with a trailing `:<digits>` output suffix
/// removed. The index keeps repeated variable names apart.
pub fn composite_name(index: usize, variable: &str) -> String {
    let base = match variable.rsplit_once(':') {
        Some((head, suffix))
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            head
        }
        _ => variable,
    };
    format!("{}/{}", index, base)
}

pub struct KerasFormat {
    backend: Box<dyn LayeredBackend>,
}

impl KerasFormat {
    pub fn new(backend: Box<dyn LayeredBackend>) -> Self {
        Self { backend }
    }
}

impl CheckpointFormat for KerasFormat {
    fn format(&self) -> Format {
        Format::Keras
    }

    fn extract(&self, path: &Path) -> Result<ModelIR> {
        let model = self.backend.load(path)?;

        let mut weights = WeightStore::new();
        for (i, tensor) in model.weights.into_iter().enumerate() {
            let name = composite_name(i, &tensor.name);
            weights.insert(tensor.with_name(name))?;
        }

        let mut metadata = Metadata::new();
        metadata.insert(
            TRAINING_CONFIG_KEY.to_string(),
            model.training_config.unwrap_or(Value::Null),
        );

        info!(
            path = %path.display(),
            backend = self.backend.name(),
            weights = weights.len(),
            "extracted layered model"
        );
        let weight_keys = weights.names().into_iter().map(String::from).collect();
        Ok(ModelIR::new(
            weights,
            Architecture::Graph {
                topology: model.topology,
                weight_keys,
            },
            metadata,
        ))
    }

    fn rebuild(&self, ir: &ModelIR, output: &Path) -> Result<()> {
        let (topology, weight_keys) = match &ir.architecture {
            Architecture::Graph {
                topology,
                weight_keys,
            } => (topology, weight_keys),
            other => return Err(foreign_descriptor(self.format(), other)),
        };

        let mut model = self.backend.from_topology(topology)?;
        if model.weights.len() != weight_keys.len() {
            return Err(Error::ShapeMismatch {
                name: "weight list".to_string(),
                expected: format!("{} variables declared by the topology", model.weights.len()),
                actual: format!("{} weight keys", weight_keys.len()),
            });
        }

        // Binding is positional: the i-th variable takes the i-th key.
        for (slot, key) in model.weights.iter_mut().zip(weight_keys) {
            let stored = ir.weights.require(key)?;
            if slot.shape != stored.shape || slot.data_type != stored.data_type {
                return Err(Error::ShapeMismatch {
                    name: key.clone(),
                    expected: format!("{:?} {}", slot.shape, slot.data_type),
                    actual: format!("{:?} {}", stored.shape, stored.data_type),
                });
            }
            debug!(variable = %slot.name, key = %key, "assigned weight");
            slot.data = stored.data.clone();
        }

        if let Some(config) = ir.metadata.get(TRAINING_CONFIG_KEY) {
            if !config.is_null() {
                model.training_config = Some(config.clone());
            }
        }

        self.backend.save(&model, output)?;
        info!(path = %output.display(), backend = self.backend.name(), "wrote layered model");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoContext;
    use crate::ir::DataType;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tempfile::tempdir;

    /// Stores a layered model as one JSON document. Topologies are
    /// `{"variables": [{"name": .., "shape": [..]}]}` with float32 weights.
    struct JsonBackend;

    #[derive(Serialize, Deserialize)]
    struct Variable {
        name: String,
        shape: Vec<usize>,
        #[serde(default)]
        values: Vec<f32>,
    }

    #[derive(Serialize, Deserialize)]
    struct Topology {
        variables: Vec<Variable>,
    }

    #[derive(Serialize, Deserialize)]
    struct Document {
        topology: String,
        training_config: Option<Value>,
        variables: Vec<Variable>,
    }

    fn to_tensor(v: Variable) -> Tensor {
        let numel: usize = v.shape.iter().product();
        let values = if v.values.is_empty() { vec![0.0; numel] } else { v.values };
        Tensor {
            name: v.name,
            shape: v.shape,
            data_type: DataType::F32,
            data: values.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    impl LayeredBackend for JsonBackend {
        fn name(&self) -> &str {
            "json"
        }

        fn load(&self, path: &Path) -> Result<LayeredModel> {
            let raw = std::fs::read_to_string(path).at(path)?;
            let doc: Document = serde_json::from_str(&raw)?;
            Ok(LayeredModel {
                topology: doc.topology,
                training_config: doc.training_config,
                weights: doc.variables.into_iter().map(to_tensor).collect(),
            })
        }

        fn from_topology(&self, topology: &str) -> Result<LayeredModel> {
            let parsed: Topology = serde_json::from_str(topology)
                .map_err(|e| Error::Backend(format!("bad topology: {}", e)))?;
            Ok(LayeredModel {
                topology: topology.to_string(),
                training_config: None,
                weights: parsed.variables.into_iter().map(to_tensor).collect(),
            })
        }

        fn save(&self, model: &LayeredModel, path: &Path) -> Result<()> {
            let variables = model
                .weights
                .iter()
                .map(|t| Variable {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    values: t
                        .data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                })
                .collect();
            let doc = Document {
                topology: model.topology.clone(),
                training_config: model.training_config.clone(),
                variables,
            };
            std::fs::write(path, serde_json::to_vec(&doc)?).at(path)
        }
    }

    fn topology() -> String {
        json!({"variables": [
            {"name": "dense/kernel:0", "shape": [2, 1]},
            {"name": "dense/bias:0", "shape": [1]},
            {"name": "dense/kernel:0", "shape": [1, 1]},
        ]})
        .to_string()
    }

    fn write_model(path: &Path) {
        let doc = json!({
            "topology": topology(),
            "training_config": {"optimizer": "adam", "loss": "mse"},
            "variables": [
                {"name": "dense/kernel:0", "shape": [2, 1], "values": [0.5, 1.5]},
                {"name": "dense/bias:0", "shape": [1], "values": [0.25]},
                {"name": "dense/kernel:0", "shape": [1, 1], "values": [2.0]},
            ]
        });
        std::fs::write(path, doc.to_string()).unwrap();
    }

    #[test]
    fn test_composite_names() {
        assert_eq!(composite_name(0, "dense/kernel:0"), "0/dense/kernel");
        assert_eq!(composite_name(3, "conv:0/bias:12"), "3/conv:0/bias");
        assert_eq!(composite_name(1, "embedding"), "1/embedding");
        assert_eq!(composite_name(2, "odd:name"), "2/odd:name");
    }

    #[test]
    fn test_extract_and_rebuild_roundtrip() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("model.keras");
        write_model(&input);

        let format = KerasFormat::new(Box::new(JsonBackend));
        let ir = format.extract(&input).unwrap();
        assert_eq!(
            ir.weights.names(),
            vec!["0/dense/kernel", "1/dense/bias", "2/dense/kernel"]
        );
        assert_eq!(
            ir.metadata[TRAINING_CONFIG_KEY],
            json!({"optimizer": "adam", "loss": "mse"})
        );

        let output = dir.path().join("rebuilt.keras");
        format.rebuild(&ir, &output).unwrap();
        let rebuilt = JsonBackend.load(&output).unwrap();
        let original = JsonBackend.load(&input).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_rebuild_rejects_count_mismatch() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("model.h5");
        write_model(&input);
        let format = KerasFormat::new(Box::new(JsonBackend));
        let mut ir = format.extract(&input).unwrap();
        if let Architecture::Graph { weight_keys, .. } = &mut ir.architecture {
            weight_keys.pop();
        }

        let output = dir.path().join("rebuilt.h5");
        assert!(matches!(
            format.rebuild(&ir, &output),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_rebuild_rejects_shape_mismatch() {
        let dir = tempdir().unwrap();
        let format = KerasFormat::new(Box::new(JsonBackend));
        let mut weights = WeightStore::new();
        weights
            .insert(Tensor {
                name: "0/w".to_string(),
                shape: vec![3],
                data_type: DataType::F32,
                data: vec![0; 12],
            })
            .unwrap();
        let ir = ModelIR::new(
            weights,
            Architecture::Graph {
                topology: json!({"variables": [{"name": "w:0", "shape": [2]}]}).to_string(),
                weight_keys: vec!["0/w".to_string()],
            },
            Metadata::new(),
        );
        let result = format.rebuild(&ir, &dir.path().join("out.keras"));
        assert!(matches!(result, Err(Error::ShapeMismatch { name, .. }) if name == "0/w"));
    }

    #[test]
    fn test_rebuild_rejects_foreign_descriptor() {
        let dir = tempdir().unwrap();
        let format = KerasFormat::new(Box::new(JsonBackend));
        let ir = ModelIR::new(
            WeightStore::new(),
            Architecture::ComputationGraph {
                onnx_path: dir.path().join("model.onnx"),
            },
            Metadata::new(),
        );
        assert!(matches!(
            format.rebuild(&ir, &dir.path().join("out.keras")),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
