use crate::content::TaskContext;
use crate::errors::exit_codes;
use crate::ledger::InvocationLedger;
use crate::phase::PhaseId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where an artifact's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// Produced in-process
    Local,
    /// Decoded from a delegate response
    Delegate,
    /// Substituted after a degradable phase failed or was skipped
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub origin: ArtifactOrigin,
    pub content: String,
}

/// Outputs accumulated by the phases run so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub artifacts: BTreeMap<PhaseId, Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<u8>,
}

impl PartialState {
    pub fn artifact(&self, phase: PhaseId) -> Option<&Artifact> {
        self.artifacts.get(&phase)
    }

    pub fn with_artifact(mut self, phase: PhaseId, origin: ArtifactOrigin, content: String) -> Self {
        self.artifacts.insert(phase, Artifact { origin, content });
        self
    }

    /// Artifacts of the given phases that exist, in phase order.
    pub fn dependencies<'a>(&'a self, phases: &[PhaseId]) -> Vec<(PhaseId, &'a Artifact)> {
        phases
            .iter()
            .filter_map(|p| self.artifacts.get(p).map(|a| (*p, a)))
            .collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.artifacts
            .values()
            .filter(|a| a.origin == ArtifactOrigin::Fallback)
            .count()
    }
}

/// Final report of a run that did not suspend.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub counts: BTreeMap<String, usize>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub exit_code: i32,
    pub blocked: bool,
    pub ledger: InvocationLedger,
}

/// The run stopped to wait for an external delegate.
#[derive(Debug, Clone, Serialize)]
pub struct Suspension {
    pub phase: PhaseId,
    pub delegate: String,
    pub request_id: String,
    pub request_path: PathBuf,
    pub checkpoint_path: PathBuf,
    /// False in dry-run, where neither request nor checkpoint was written
    pub persisted: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(OrchestrationResult),
    Suspended(Suspension),
}

impl Outcome {
    /// Process exit code for this outcome.
    ///
    /// Only a persisted suspension yields the sentinel; a dry-run suspension
    /// has nothing for a worker to pick up and exits cleanly.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed(result) => result.exit_code,
            Outcome::Suspended(s) if s.persisted => exit_codes::AWAITING_EXTERNAL_WORKER,
            Outcome::Suspended(_) => exit_codes::SUCCESS,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Outcome::Suspended(_))
    }
}

/// Accumulates the pieces of an `OrchestrationResult` during a run.
#[derive(Debug, Default)]
pub(crate) struct ResultBuilder {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub counts: BTreeMap<String, usize>,
    pub blocked: bool,
}

impl ResultBuilder {
    pub fn with_warnings(warnings: Vec<String>) -> Self {
        Self {
            warnings,
            ..Self::default()
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn count(&mut self, category: &str, n: usize) {
        self.counts.insert(category.to_string(), n);
    }

    pub fn succeed(self, output_path: Option<PathBuf>, ledger: InvocationLedger) -> OrchestrationResult {
        OrchestrationResult {
            success: true,
            output_path,
            counts: self.counts,
            errors: self.errors,
            warnings: self.warnings,
            exit_code: exit_codes::SUCCESS,
            blocked: false,
            ledger,
        }
    }

    pub fn fail(mut self, error: String, exit_code: i32, ledger: InvocationLedger) -> OrchestrationResult {
        self.errors.push(error);
        OrchestrationResult {
            success: false,
            output_path: None,
            counts: self.counts,
            errors: self.errors,
            warnings: self.warnings,
            exit_code: exit_codes::failure_code(exit_code),
            blocked: self.blocked,
            ledger,
        }
    }
}
