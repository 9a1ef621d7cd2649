//! Format detection and the per-format extract/rebuild strategies.

use std::fmt;
use std::path::Path;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::ir::{Architecture, ModelIR};

pub mod keras;
pub mod onnx;
pub mod pytorch;
pub mod safetensors;

const LAYERED_EXTENSIONS: &[&str] = &["h5", "keras"];
const FLAT_ARCHIVE_EXTENSIONS: &[&str] = &["safetensors"];
const GRAPH_EXTENSIONS: &[&str] = &["onnx"];
const CHECKPOINT_EXTENSIONS: &[&str] = &["pt", "pth", "bin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Layered model (keras/tf), rebuilt from a serialized topology.
    Keras,
    /// Flat named-tensor archive; the store is the whole model.
    SafeTensors,
    /// Computation graph (onnx) whose initializers hold the weights.
    Onnx,
    /// Pickled state dict in a torch zip archive.
    PyTorch,
}

impl Format {
    /// Detection priority. The first format whose rule matches wins.
    pub const DETECTION_ORDER: [Format; 4] = [
        Format::Keras,
        Format::SafeTensors,
        Format::Onnx,
        Format::PyTorch,
    ];

    /// Tag used in the `type` field of architecture descriptors.
    pub fn tag(&self) -> &'static str {
        match self {
            Format::Keras => "keras",
            Format::SafeTensors => "safetensors",
            Format::Onnx => "onnx",
            Format::PyTorch => "pytorch",
        }
    }

    /// Whether this format's detection rule claims `path`, regardless of
    /// backend availability.
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Format::Keras => path.is_dir() || has_extension(path, LAYERED_EXTENSIONS),
            Format::SafeTensors => has_extension(path, FLAT_ARCHIVE_EXTENSIONS),
            Format::Onnx => has_extension(path, GRAPH_EXTENSIONS),
            Format::PyTorch => has_extension(path, CHECKPOINT_EXTENSIONS),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Classify `path` into exactly one format, ignoring backend availability.
pub fn detect(path: &Path) -> Result<Format> {
    Format::DETECTION_ORDER
        .into_iter()
        .find(|format| format.matches(path))
        .ok_or_else(|| {
            Error::UnsupportedFormat(format!("no format recognizes {}", path.display()))
        })
}

/// Extract and rebuild for one format variant.
pub trait CheckpointFormat {
    fn format(&self) -> Format;

    fn extract(&self, path: &Path) -> Result<ModelIR>;

    /// Fails with `UnsupportedFormat` when `ir.architecture` belongs to
    /// another format.
    fn rebuild(&self, ir: &ModelIR, output: &Path) -> Result<()>;
}

pub(crate) fn foreign_descriptor(owner: Format, architecture: &Architecture) -> Error {
    Error::UnsupportedFormat(format!(
        "{} rebuilder cannot consume a '{}' architecture descriptor",
        owner,
        architecture.format()
    ))
}

/// The set of formats whose backends are present in this process.
pub struct FormatRegistry {
    formats: Vec<Box<dyn CheckpointFormat>>,
}

impl FormatRegistry {
    /// A registry with no usable format.
    pub fn empty() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// The built-in backends: torch archives, onnx graphs and safetensors.
    /// Layered models need a [`keras::LayeredBackend`] registered through
    /// [`keras::KerasFormat`], e.g. [`keras::KerasArchiveBackend`] for
    /// `.keras` zips.
    pub fn new(options: &Options) -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(pytorch::PytorchFormat::new(
            options.nested_keys.clone(),
        )));
        registry.register(Box::new(onnx::OnnxFormat));
        registry.register(Box::new(safetensors::SafetensorsFormat));
        registry
    }

    /// Add a format, replacing any existing strategy for the same variant.
    pub fn register(&mut self, format: Box<dyn CheckpointFormat>) {
        self.unregister(format.format());
        self.formats.push(format);
    }

    pub fn unregister(&mut self, format: Format) -> Option<Box<dyn CheckpointFormat>> {
        let pos = self.formats.iter().position(|f| f.format() == format)?;
        Some(self.formats.remove(pos))
    }

    /// Capability query: is a backend for `format` present?
    pub fn is_available(&self, format: Format) -> bool {
        self.formats.iter().any(|f| f.format() == format)
    }

    pub fn get(&self, format: Format) -> Result<&dyn CheckpointFormat> {
        self.formats
            .iter()
            .find(|f| f.format() == format)
            .map(|f| f.as_ref())
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!("no backend available for {} checkpoints", format))
            })
    }

    /// Detect the format of `path` and return its strategy. A detected format
    /// without a backend is an error, never a fall-through to the next rule.
    pub fn detect(&self, path: &Path) -> Result<&dyn CheckpointFormat> {
        let format = detect(path)?;
        self.get(format).map_err(|_| {
            Error::UnsupportedFormat(format!(
                "{} detected as {} but no {} backend is available",
                path.display(),
                format,
                format
            ))
        })
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new(&Options::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detection_rules() {
        assert_eq!(detect(Path::new("model.h5")).unwrap(), Format::Keras);
        assert_eq!(detect(Path::new("model.keras")).unwrap(), Format::Keras);
        assert_eq!(detect(Path::new("model.safetensors")).unwrap(), Format::SafeTensors);
        assert_eq!(detect(Path::new("model.onnx")).unwrap(), Format::Onnx);
        assert_eq!(detect(Path::new("model.pt")).unwrap(), Format::PyTorch);
        assert_eq!(detect(Path::new("model.pth")).unwrap(), Format::PyTorch);
        assert_eq!(detect(Path::new("pytorch_model.bin")).unwrap(), Format::PyTorch);
        assert_eq!(detect(Path::new("MODEL.PT")).unwrap(), Format::PyTorch);
    }

    #[test]
    fn test_unrecognized_path_is_unsupported() {
        for path in ["model.tflite", "weights", "archive.tar.gz"] {
            assert!(matches!(
                detect(Path::new(path)),
                Err(Error::UnsupportedFormat(_))
            ));
        }
    }

    #[test]
    fn test_directory_rule_wins_over_extension() {
        let dir = tempdir().unwrap();
        let saved_model = dir.path().join("export.onnx");
        std::fs::create_dir(&saved_model).unwrap();
        assert_eq!(detect(&saved_model).unwrap(), Format::Keras);
    }

    #[test]
    fn test_exactly_one_format_matches_each_extension() {
        for path in ["a.h5", "a.keras", "a.safetensors", "a.onnx", "a.pt", "a.pth", "a.bin"] {
            let claimed = Format::DETECTION_ORDER
                .iter()
                .filter(|f| f.matches(Path::new(path)))
                .count();
            assert_eq!(claimed, 1, "{} claimed by {} formats", path, claimed);
        }
    }

    #[test]
    fn test_detect_without_graph_backend_is_unsupported() {
        let mut registry = FormatRegistry::default();
        assert!(registry.is_available(Format::Onnx));
        registry.unregister(Format::Onnx);
        assert!(!registry.is_available(Format::Onnx));

        let err = registry.detect(Path::new("model.onnx")).err().unwrap();
        match err {
            Error::UnsupportedFormat(msg) => assert!(msg.contains("onnx")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_layered_models_need_a_registered_backend() {
        let registry = FormatRegistry::default();
        assert!(!registry.is_available(Format::Keras));
        assert!(matches!(
            registry.detect(Path::new("model.keras")),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_register_replaces_same_format() {
        let mut registry = FormatRegistry::empty();
        registry.register(Box::new(super::safetensors::SafetensorsFormat));
        registry.register(Box::new(super::safetensors::SafetensorsFormat));
        assert!(registry.is_available(Format::SafeTensors));
        assert!(registry.unregister(Format::SafeTensors).is_some());
        assert!(registry.unregister(Format::SafeTensors).is_none());
    }
}
