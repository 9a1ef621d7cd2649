use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::pytorch::pickle::PickleError;
use crate::format::Format;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Missing reference: {}", path.display())]
    MissingReference { path: PathBuf },
    #[error("Invalid {format} checkpoint: {reason}")]
    InvalidFormat { format: Format, reason: String },
    #[error("Tensor '{0}' not found in weight store")]
    MissingTensor(String),
    #[error("Duplicate tensor name '{0}'")]
    DuplicateTensor(String),
    #[error("Shape mismatch for tensor '{name}': expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("Layered-model backend error: {0}")]
    Backend(String),
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),
}

impl Error {
    pub(crate) fn invalid(format: Format, reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            format,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the offending path to a bare `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
