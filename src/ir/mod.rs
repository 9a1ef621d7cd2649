use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::format::Format;

pub mod metadata;
pub mod weight_store;

pub use metadata::{sanitize, Metadata, ToMetadata};
pub use weight_store::WeightStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U64,
    U32,
    U16,
    U8,
    Bool,
    /// 8-bit float, 4 exponent bits, finite-only.
    F8E4M3,
    F8E5M2,
}

impl DataType {
    pub const ALL: [DataType; 15] = [
        DataType::F64,
        DataType::F32,
        DataType::F16,
        DataType::BF16,
        DataType::I64,
        DataType::I32,
        DataType::I16,
        DataType::I8,
        DataType::U64,
        DataType::U32,
        DataType::U16,
        DataType::U8,
        DataType::Bool,
        DataType::F8E4M3,
        DataType::F8E5M2,
    ];

    /// Inverse of [`DataType::name`].
    pub fn from_name(name: &str) -> Option<DataType> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }

    /// Bytes per element.
    pub fn size(&self) -> usize {
        match self {
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F16 | DataType::BF16 | DataType::I16 | DataType::U16 => 2,
            DataType::I8
            | DataType::U8
            | DataType::Bool
            | DataType::F8E4M3
            | DataType::F8E5M2 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F64 => "float64",
            DataType::F32 => "float32",
            DataType::F16 => "float16",
            DataType::BF16 => "bfloat16",
            DataType::I64 => "int64",
            DataType::I32 => "int32",
            DataType::I16 => "int16",
            DataType::I8 => "int8",
            DataType::U64 => "uint64",
            DataType::U32 => "uint32",
            DataType::U16 => "uint16",
            DataType::U8 => "uint8",
            DataType::Bool => "bool",
            DataType::F8E4M3 => "float8_e4m3fn",
            DataType::F8E5M2 => "float8_e5m2",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dense tensor in little-endian row-major layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Byte length implied by shape and dtype.
    pub fn expected_len(&self) -> usize {
        self.numel() * self.data_type.size()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Which branch of the state-dict classifier produced the tensor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateDictLayout {
    /// Tensors lived in a sub-mapping under `key`; siblings are metadata.
    Nested { key: String },
    /// Every top-level value was a tensor.
    Flat,
    /// Tensors and non-tensor values shared the top level.
    Mixed,
}

impl Default for StateDictLayout {
    fn default() -> Self {
        StateDictLayout::Nested {
            key: "state_dict".to_string(),
        }
    }
}

/// Format-tagged recipe for reassembling a native checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Architecture {
    #[serde(rename = "pytorch")]
    StateDict {
        tensor_keys: Vec<String>,
        #[serde(default)]
        layout: StateDictLayout,
    },
    #[serde(rename = "keras")]
    Graph {
        #[serde(rename = "architecture")]
        topology: String,
        weight_keys: Vec<String>,
    },
    #[serde(rename = "onnx")]
    ComputationGraph { onnx_path: PathBuf },
    #[serde(rename = "safetensors")]
    FlatArchive,
}

impl Architecture {
    pub fn format(&self) -> Format {
        match self {
            Architecture::StateDict { .. } => Format::PyTorch,
            Architecture::Graph { .. } => Format::Keras,
            Architecture::ComputationGraph { .. } => Format::Onnx,
            Architecture::FlatArchive => Format::SafeTensors,
        }
    }
}

/// The canonical triple every extractor produces and every rebuilder consumes.
#[derive(Debug, Clone)]
pub struct ModelIR {
    pub weights: WeightStore,
    pub architecture: Architecture,
    pub metadata: Metadata,
}

impl ModelIR {
    pub fn new(weights: WeightStore, architecture: Architecture, metadata: Metadata) -> Self {
        Self {
            weights,
            architecture,
            metadata,
        }
    }
}
