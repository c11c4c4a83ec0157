//! Staged output: everything is written beside the target and renamed into
//! place only when the run succeeds.
//!
//! An existing output directory is only replaced when it is empty or holds a
//! `summary.json` from an earlier run. Anything else belongs to the user and
//! the run refuses to touch it.

use crate::errors::OrchestratorError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Marker file that identifies a directory as phasegate output.
pub const SUMMARY_FILE: &str = "summary.json";

pub struct StagingWriter {
    staging: PathBuf,
    previous: PathBuf,
    output: PathBuf,
    dry_run: bool,
    written: Vec<PathBuf>,
}

impl StagingWriter {
    pub fn new(output: &Path, run_id: &str, dry_run: bool) -> Self {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        Self {
            staging: output.with_file_name(format!(".{}.staging-{}", name, run_id)),
            previous: output.with_file_name(format!(".{}.previous-{}", name, run_id)),
            output: output.to_path_buf(),
            dry_run,
            written: Vec::new(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// File names written so far, relative to the output directory.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn begin(&self) -> Result<(), OrchestratorError> {
        check_replaceable(&self.output)?;
        if self.dry_run {
            return Ok(());
        }
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging).map_err(|e| io(&self.staging, e))?;
        }
        fs::create_dir_all(&self.staging).map_err(|e| io(&self.staging, e))
    }

    pub fn write_text(&mut self, name: &str, content: &str) -> Result<(), OrchestratorError> {
        self.written.push(PathBuf::from(name));
        if self.dry_run {
            tracing::debug!(file = name, "dry run: artifact not written");
            return Ok(());
        }
        let path = self.staging.join(name);
        fs::write(&path, content).map_err(|e| io(&path, e))
    }

    pub fn write_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), OrchestratorError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| OrchestratorError::Internal(format!("failed to encode {}: {}", name, e)))?;
        self.write_text(name, &json)
    }

    /// Replace the output directory with the staged one. The staging
    /// directory is gone afterwards whether or not this succeeds.
    pub fn promote(self) -> Result<PathBuf, OrchestratorError> {
        if self.dry_run {
            return Ok(self.output);
        }
        match self.swap() {
            Ok(()) => {
                tracing::info!(output = %self.output.display(), files = self.written.len(), "output promoted");
                Ok(self.output)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn swap(&self) -> Result<(), OrchestratorError> {
        check_replaceable(&self.output)?;
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
        }

        let replacing = self.output.exists();
        if replacing {
            fs::rename(&self.output, &self.previous).map_err(|e| io(&self.output, e))?;
        }
        if let Err(e) = fs::rename(&self.staging, &self.output) {
            if replacing && let Err(restore) = fs::rename(&self.previous, &self.output) {
                tracing::error!(
                    previous = %self.previous.display(),
                    error = %restore,
                    "failed to restore previous output"
                );
            }
            return Err(io(&self.output, e));
        }
        if replacing && let Err(e) = fs::remove_dir_all(&self.previous) {
            tracing::warn!(path = %self.previous.display(), error = %e, "failed to remove previous output");
        }
        Ok(())
    }

    /// Drop whatever was staged.
    pub fn abort(self) {
        if !self.dry_run && self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                tracing::warn!(path = %self.staging.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}

/// The target may be missing, an empty directory, or an earlier run's output.
pub(crate) fn check_replaceable(output: &Path) -> Result<(), OrchestratorError> {
    if !output.exists() {
        return Ok(());
    }
    if !output.is_dir() {
        return Err(OrchestratorError::configuration(format!(
            "output path {} exists and is not a directory",
            output.display()
        )));
    }
    if output.join(SUMMARY_FILE).is_file() {
        return Ok(());
    }
    let mut entries = fs::read_dir(output).map_err(|e| io(output, e))?;
    if entries.next().is_some() {
        return Err(OrchestratorError::configuration(format!(
            "output directory {} is not empty and was not written by phasegate; \
             choose another --output or remove it",
            output.display()
        )));
    }
    Ok(())
}

fn io(path: &Path, source: std::io::Error) -> OrchestratorError {
    OrchestratorError::Io {
        path: path.to_path_buf(),
        source,
    }
}
