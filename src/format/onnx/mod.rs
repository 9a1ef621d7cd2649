use std::io::ErrorKind;
use std::path::Path;

use prost::Message;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, IoContext, Result};
use crate::format::{foreign_descriptor, CheckpointFormat, Format};
use crate::ir::{Architecture, DataType, Metadata, ModelIR, Tensor, WeightStore};

pub mod patch;
pub mod proto;

use proto::tensor_proto;

/// Computation graphs whose initializers hold the weights. Rebuild patches
/// the referenced graph file rather than regenerating it.
pub struct OnnxFormat;

pub(crate) fn dtype_from_onnx(value: i32) -> Option<DataType> {
    use tensor_proto::DataType as T;
    Some(match T::try_from(value).ok()? {
        T::Float => DataType::F32,
        T::Double => DataType::F64,
        T::Float16 => DataType::F16,
        T::Bfloat16 => DataType::BF16,
        T::Int64 => DataType::I64,
        T::Int32 => DataType::I32,
        T::Int16 => DataType::I16,
        T::Int8 => DataType::I8,
        T::Uint64 => DataType::U64,
        T::Uint32 => DataType::U32,
        T::Uint16 => DataType::U16,
        T::Uint8 => DataType::U8,
        T::Bool => DataType::Bool,
        T::Float8e4m3fn => DataType::F8E4M3,
        T::Float8e5m2 => DataType::F8E5M2,
        T::Undefined
        | T::String
        | T::Complex64
        | T::Complex128
        | T::Float8e4m3fnuz
        | T::Float8e5m2fnuz => return None,
    })
}

/// Little-endian bytes of an initializer, taken from `raw_data` or from
/// whichever typed field the dtype uses.
fn initializer_bytes(init: &proto::TensorProto, data_type: DataType) -> Vec<u8> {
    if let Some(raw) = &init.raw_data {
        return raw.clone();
    }
    match data_type {
        DataType::F32 => init.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DataType::F64 => init.double_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DataType::I64 => init.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DataType::U64 => init.uint64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DataType::U32 => init
            .uint64_data
            .iter()
            .flat_map(|&v| (v as u32).to_le_bytes())
            .collect(),
        DataType::I32 => init.int32_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        // Narrow types and half floats are carried in int32_data.
        DataType::I16 | DataType::U16 | DataType::F16 | DataType::BF16 => init
            .int32_data
            .iter()
            .flat_map(|&v| (v as u16).to_le_bytes())
            .collect(),
        DataType::I8
        | DataType::U8
        | DataType::Bool
        | DataType::F8E4M3
        | DataType::F8E5M2 => init.int32_data.iter().map(|&v| v as u8).collect(),
    }
}

impl CheckpointFormat for OnnxFormat {
    fn format(&self) -> Format {
        Format::Onnx
    }

    fn extract(&self, path: &Path) -> Result<ModelIR> {
        let bytes = std::fs::read(path).at(path)?;
        let model = proto::ModelProto::decode(bytes.as_slice())?;

        let mut weights = WeightStore::new();
        for init in model.graph.iter().flat_map(|g| &g.initializer) {
            let name = match &init.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    warn!("skipping unnamed initializer");
                    continue;
                }
            };
            if init.data_location == Some(tensor_proto::DataLocation::External as i32) {
                warn!(name, "skipping externally stored initializer");
                continue;
            }
            let data_type = match init.data_type.and_then(dtype_from_onnx) {
                Some(data_type) => data_type,
                None => {
                    warn!(name, data_type = ?init.data_type, "skipping non-numeric initializer");
                    continue;
                }
            };
            let shape = init
                .dims
                .iter()
                .map(|&d| usize::try_from(d))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| {
                    Error::invalid(Format::Onnx, format!("negative dimension in '{}'", name))
                })?;
            let data = initializer_bytes(init, data_type);
            weights.insert(Tensor {
                name,
                shape,
                data_type,
                data,
            })?;
        }

        let mut metadata = Metadata::new();
        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
            .or_else(|| model.opset_import.first())
            .and_then(|o| o.version);
        if let Some(opset) = opset {
            metadata.insert("opset".to_string(), Value::from(opset));
        }
        if let Some(ir_version) = model.ir_version {
            metadata.insert("ir_version".to_string(), Value::from(ir_version));
        }
        if let Some(producer) = &model.producer_name {
            metadata.insert("producer_name".to_string(), Value::from(producer.clone()));
        }

        let onnx_path = std::fs::canonicalize(path).at(path)?;
        info!(path = %onnx_path.display(), initializers = weights.len(), "extracted onnx graph");
        Ok(ModelIR::new(
            weights,
            Architecture::ComputationGraph { onnx_path },
            metadata,
        ))
    }

    fn rebuild(&self, ir: &ModelIR, output: &Path) -> Result<()> {
        let onnx_path = match &ir.architecture {
            Architecture::ComputationGraph { onnx_path } => onnx_path,
            other => return Err(foreign_descriptor(self.format(), other)),
        };

        let source = match std::fs::read(onnx_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::MissingReference {
                    path: onnx_path.clone(),
                })
            }
            Err(source) => {
                return Err(Error::Io {
                    path: onnx_path.clone(),
                    source,
                })
            }
        };

        let (patched, replaced) = patch::replace_initializers(&source, &ir.weights)?;
        if replaced == 0 && !ir.weights.is_empty() {
            warn!(
                path = %onnx_path.display(),
                "no initializer of the referenced graph matches the weight store"
            );
            return Err(Error::MissingReference {
                path: onnx_path.clone(),
            });
        }

        std::fs::write(output, patched).at(output)?;
        info!(path = %output.display(), replaced, "wrote onnx graph");
        Ok(())
    }
}
