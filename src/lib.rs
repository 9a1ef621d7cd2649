pub mod config;
pub mod error;
pub mod format;
pub mod ir;
pub mod pipeline;
pub mod verifier;

pub use config::Options;
pub use error::{Error, Result};
pub use format::{detect, CheckpointFormat, Format, FormatRegistry};
pub use ir::{Architecture, DataType, Metadata, ModelIR, StateDictLayout, Tensor, WeightStore};
pub use pipeline::{extract, rebuild, Artifacts, Pipeline};
