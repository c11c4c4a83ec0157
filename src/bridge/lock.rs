//! Exclusive per-directory run lock.
//!
//! One pipeline per working directory: the protocol files are a single slot,
//! so a second concurrent run must fail fast instead of racing the first.

use crate::errors::OrchestratorError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for the lifetime of a run; released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(path: &Path) -> Result<Self, OrchestratorError> {
        let io_err = |source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        file.try_lock_exclusive().map_err(|_| {
            OrchestratorError::configuration(format!(
                "another phasegate run holds {}; wait for it to finish",
                path.display()
            ))
        })?;

        // Record the owner now that the lock is held.
        let mut file = file;
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        tracing::debug!(path = %path.display(), "run lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "run lock released");
    }
}
