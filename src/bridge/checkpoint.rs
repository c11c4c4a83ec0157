//! Checkpoint persistence for suspended runs.

use super::{read_json, remove_if_exists, write_json_atomic};
use crate::errors::BridgeError;
use crate::ledger::InvocationLedger;
use crate::orchestrator::state::PartialState;
use crate::phase::{PhaseId, WorkflowMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The config flags a resumed run must reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeFlags {
    pub mode: WorkflowMode,
    pub dry_run: bool,
    pub skip_delegates: bool,
    pub skip_external_analysis: bool,
    pub max_items: usize,
    pub verbose: bool,
}

/// Minimal snapshot needed to resume a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub flags: ResumeFlags,
    pub suspended_phase: PhaseId,
    pub request_id: String,
    pub partial: PartialState,
    pub ledger: InvocationLedger,
    /// Warnings raised before the suspension, replayed into the final result
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    path: PathBuf,
    dry_run: bool,
}

impl CheckpointStore {
    pub fn new(path: PathBuf, dry_run: bool) -> Self {
        Self { path, dry_run }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn save(&self, state: &CheckpointState) -> Result<(), BridgeError> {
        if self.dry_run {
            tracing::debug!(phase = %state.suspended_phase, "dry run: checkpoint not written");
            return Ok(());
        }
        write_json_atomic(&self.path, state)?;
        tracing::info!(
            phase = %state.suspended_phase,
            path = %self.path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint if one exists.
    pub fn load(&self) -> Result<Option<CheckpointState>, BridgeError> {
        if !self.exists() {
            return Ok(None);
        }
        read_json(&self.path).map(Some)
    }

    pub fn remove(&self) -> Result<(), BridgeError> {
        if self.dry_run {
            return Ok(());
        }
        remove_if_exists(&self.path)?;
        tracing::debug!(path = %self.path.display(), "checkpoint removed");
        Ok(())
    }
}
