//! Extract a checkpoint into the three canonical artifacts and rebuild it
//! from them. Both directions stage their output and commit it only after
//! every step has succeeded.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Error, IoContext, Result};
use crate::format::FormatRegistry;
use crate::ir::{Architecture, Metadata, ModelIR, WeightStore};
use crate::verifier::{ParityChecker, ParityReport};

/// Paths of the persisted canonical triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub weights: PathBuf,
    pub architecture: PathBuf,
    pub metadata: PathBuf,
}

impl Artifacts {
    /// Artifact paths inside `dir` under the configured file names.
    pub fn in_dir(dir: &Path, options: &Options) -> Self {
        Self {
            weights: dir.join(&options.weights_file),
            architecture: dir.join(&options.architecture_file),
            metadata: dir.join(&options.metadata_file),
        }
    }

    pub fn load(&self) -> Result<ModelIR> {
        let weights = WeightStore::load(&self.weights)?;
        let architecture: Architecture =
            serde_json::from_slice(&fs::read(&self.architecture).at(&self.architecture)?)?;
        let metadata: Metadata =
            serde_json::from_slice(&fs::read(&self.metadata).at(&self.metadata)?)?;
        Ok(ModelIR::new(weights, architecture, metadata))
    }
}

pub struct Pipeline {
    registry: FormatRegistry,
    options: Options,
}

impl Pipeline {
    pub fn new(options: Options) -> Self {
        Self {
            registry: FormatRegistry::new(&options),
            options,
        }
    }

    pub fn with_registry(registry: FormatRegistry, options: Options) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FormatRegistry {
        &mut self.registry
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Detect, extract and persist `input` into `out_dir`. Either all three
    /// artifacts appear in `out_dir` or none do.
    pub fn extract(&self, input: &Path, out_dir: &Path) -> Result<Artifacts> {
        let format = self.registry.detect(input)?;
        let ir = format.extract(input)?;

        fs::create_dir_all(out_dir).at(out_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(out_dir)
            .at(out_dir)?;
        let staged = Artifacts::in_dir(staging.path(), &self.options);
        ir.weights.save(&staged.weights)?;
        fs::write(
            &staged.architecture,
            serde_json::to_vec_pretty(&ir.architecture)?,
        )
        .at(&staged.architecture)?;
        fs::write(&staged.metadata, serde_json::to_vec_pretty(&ir.metadata)?)
            .at(&staged.metadata)?;
        debug!(staging = %staging.path().display(), "staged artifacts");

        let artifacts = Artifacts::in_dir(out_dir, &self.options);
        commit(
            &[
                (&staged.weights, &artifacts.weights),
                (&staged.architecture, &artifacts.architecture),
                (&staged.metadata, &artifacts.metadata),
            ],
            &staging.path().join(".previous"),
        )?;

        info!(
            input = %input.display(),
            format = %format.format(),
            tensors = ir.weights.len(),
            out_dir = %out_dir.display(),
            "extracted checkpoint"
        );
        Ok(artifacts)
    }

    /// Rebuild a native checkpoint at `output` from persisted artifacts.
    pub fn rebuild(&self, artifacts: &Artifacts, output: &Path) -> Result<PathBuf> {
        let ir = artifacts.load()?;
        self.rebuild_model(&ir, output)
    }

    /// Rebuild from an in-memory triple. The format is chosen by the
    /// descriptor's tag, never by `output`'s extension.
    pub fn rebuild_model(&self, ir: &ModelIR, output: &Path) -> Result<PathBuf> {
        let format = self.registry.get(ir.architecture.format())?;

        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let suffix = output
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let staged = tempfile::Builder::new()
            .prefix(".rebuild-")
            .suffix(&suffix)
            .tempfile_in(parent)
            .at(parent)?;

        format.rebuild(ir, staged.path())?;
        staged.persist(output).map_err(|e| Error::Io {
            path: output.to_path_buf(),
            source: e.error,
        })?;

        info!(
            output = %output.display(),
            format = %format.format(),
            tensors = ir.weights.len(),
            "rebuilt checkpoint"
        );
        Ok(output.to_path_buf())
    }

    /// Extract both checkpoints and compare their stores bit for bit.
    pub fn verify_roundtrip(&self, original: &Path, rebuilt: &Path) -> Result<ParityReport> {
        let expected = self.registry.detect(original)?.extract(original)?;
        let actual = self.registry.detect(rebuilt)?.extract(rebuilt)?;
        let report = ParityChecker::exact().check_parity(&expected.weights, &actual.weights);
        info!(
            matched = report.matched.len(),
            mismatched = report.mismatched.len(),
            missing = report.missing.len(),
            "verified round trip"
        );
        Ok(report)
    }
}

/// Move each staged file onto its target. Existing targets are parked in
/// `backup_dir` first; if any move fails, the new files are removed and the
/// parked ones put back.
fn commit(moves: &[(&PathBuf, &PathBuf)], backup_dir: &Path) -> Result<()> {
    fs::create_dir(backup_dir).at(backup_dir)?;
    let mut parked = Vec::new();
    let mut placed = Vec::new();
    let outcome = swap_in(moves, backup_dir, &mut parked, &mut placed);
    if outcome.is_err() {
        for target in placed.iter().rev() {
            if let Err(e) = fs::remove_file(target) {
                warn!(path = %target.display(), error = %e, "could not remove committed artifact");
            }
        }
        for (backup, target) in parked.iter().rev() {
            if let Err(e) = fs::rename(backup, target) {
                warn!(path = %target.display(), error = %e, "could not restore previous artifact");
            }
        }
    }
    outcome
}

fn swap_in<'a>(
    moves: &[(&'a PathBuf, &'a PathBuf)],
    backup_dir: &Path,
    parked: &mut Vec<(PathBuf, &'a PathBuf)>,
    placed: &mut Vec<&'a PathBuf>,
) -> Result<()> {
    for (i, (_, target)) in moves.iter().enumerate() {
        if fs::symlink_metadata(target).is_ok() {
            let backup = backup_dir.join(i.to_string());
            fs::rename(target, &backup).at(target)?;
            parked.push((backup, *target));
        }
    }
    for (from, to) in moves {
        fs::rename(from, to).at(to)?;
        placed.push(*to);
    }
    Ok(())
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

/// [`Pipeline::extract`] with default options and built-in backends.
pub fn extract(input: impl AsRef<Path>, out_dir: impl AsRef<Path>) -> Result<Artifacts> {
    Pipeline::default().extract(input.as_ref(), out_dir.as_ref())
}

/// [`Pipeline::rebuild`] with default options and built-in backends.
pub fn rebuild(
    weights: impl AsRef<Path>,
    architecture: impl AsRef<Path>,
    metadata: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<PathBuf> {
    let artifacts = Artifacts {
        weights: weights.as_ref().to_path_buf(),
        architecture: architecture.as_ref().to_path_buf(),
        metadata: metadata.as_ref().to_path_buf(),
    };
    Pipeline::default().rebuild(&artifacts, output.as_ref())
}
