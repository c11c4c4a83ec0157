//! Typed error hierarchy for phasegate.
//!
//! - `BridgeError` covers the checkpoint/request/response file protocol
//! - `OrchestratorError` covers everything a run can fail with, and maps each
//!   failure to a process exit code
//! - `DegradedPhaseWarning` is not an error: it is recorded and the run continues

use crate::ledger::{PhaseGateViolation, WorkflowViolation};
use crate::phase::PhaseId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes. `AWAITING_EXTERNAL_WORKER` is reserved for suspension.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const BLOCKED: i32 = 3;
    pub const STATE_CORRUPTION: i32 = 4;
    pub const AWAITING_EXTERNAL_WORKER: i32 = 42;
    pub const INTERNAL: i32 = 70;

    /// Map any failure code onto one that cannot be mistaken for suspension.
    pub fn failure_code(code: i32) -> i32 {
        if code == AWAITING_EXTERNAL_WORKER || code == SUCCESS {
            FAILURE
        } else {
            code
        }
    }
}

/// A protocol file exists but cannot be decoded.
#[derive(Debug, Error)]
#[error("Corrupted state file {path}: {message}. Inspect or delete it, then re-run")]
pub struct StateCorruptionError {
    pub path: PathBuf,
    pub message: String,
}

/// The delegate reported `status=error` in its response.
#[derive(Debug, Error)]
#[error("Delegate '{delegate}' failed ({kind}): {message}")]
pub struct ExternalWorkerError {
    pub delegate: String,
    pub kind: String,
    pub message: String,
}

/// Errors from the checkpoint/resume bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    ExternalWorker(#[from] ExternalWorkerError),

    #[error(transparent)]
    StateCorruption(#[from] StateCorruptionError),

    #[error("Bridge I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a run of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    ExternalWorker(#[from] ExternalWorkerError),

    #[error(transparent)]
    StateCorruption(#[from] StateCorruptionError),

    #[error("{0}")]
    GateViolation(Box<PhaseGateViolation>),

    #[error("{0}")]
    WorkflowViolation(Box<WorkflowViolation>),

    #[error("Critical phase {phase} failed: {message}")]
    CriticalPhase { phase: PhaseId, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OrchestratorError::Configuration(message.into())
    }

    /// Exit code for this failure. Never the suspension sentinel.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Configuration(_) => exit_codes::CONFIGURATION,
            OrchestratorError::GateViolation(_) | OrchestratorError::WorkflowViolation(_) => {
                exit_codes::BLOCKED
            }
            OrchestratorError::StateCorruption(_) => exit_codes::STATE_CORRUPTION,
            OrchestratorError::Internal(_) => exit_codes::INTERNAL,
            OrchestratorError::ExternalWorker(_)
            | OrchestratorError::CriticalPhase { .. }
            | OrchestratorError::Io { .. } => exit_codes::FAILURE,
        }
    }

    /// Whether the owning task must be moved to BLOCKED.
    pub fn blocks_task(&self) -> bool {
        matches!(
            self,
            OrchestratorError::GateViolation(_) | OrchestratorError::WorkflowViolation(_)
        )
    }
}

impl From<BridgeError> for OrchestratorError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::ExternalWorker(e) => OrchestratorError::ExternalWorker(e),
            BridgeError::StateCorruption(e) => OrchestratorError::StateCorruption(e),
            BridgeError::Io { path, source } => OrchestratorError::Io { path, source },
        }
    }
}

impl From<PhaseGateViolation> for OrchestratorError {
    fn from(v: PhaseGateViolation) -> Self {
        OrchestratorError::GateViolation(Box::new(v))
    }
}

impl From<WorkflowViolation> for OrchestratorError {
    fn from(v: WorkflowViolation) -> Self {
        OrchestratorError::WorkflowViolation(Box::new(v))
    }
}

/// A degradable phase failed and its fallback was used.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedPhaseWarning {
    pub phase: PhaseId,
    pub message: String,
}

impl fmt::Display for DegradedPhaseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Phase {} ({}) degraded, using local fallback: {}",
            self.phase,
            self.phase.description(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InvocationLedger;

    fn all_errors() -> Vec<OrchestratorError> {
        let violation = InvocationLedger::new()
            .validate_phase_completion(PhaseId::Testing, "Testing")
            .unwrap_err();
        vec![
            OrchestratorError::configuration("bad flag"),
            ExternalWorkerError {
                delegate: "code-reviewer".into(),
                kind: "timeout".into(),
                message: "gave up".into(),
            }
            .into(),
            StateCorruptionError {
                path: PathBuf::from(".phasegate-response.json"),
                message: "expected value".into(),
            }
            .into(),
            violation.into(),
            OrchestratorError::CriticalPhase {
                phase: PhaseId::Context,
                message: "source missing".into(),
            },
            OrchestratorError::Io {
                path: PathBuf::from("out"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            },
            OrchestratorError::Internal("panic".into()),
        ]
    }

    #[test]
    fn test_no_error_maps_to_sentinel_or_success() {
        for err in all_errors() {
            let code = err.exit_code();
            assert_ne!(code, exit_codes::AWAITING_EXTERNAL_WORKER, "{}", err);
            assert_ne!(code, exit_codes::SUCCESS, "{}", err);
        }
    }

    #[test]
    fn test_failure_code_never_returns_sentinel() {
        assert_eq!(exit_codes::failure_code(42), exit_codes::FAILURE);
        assert_eq!(exit_codes::failure_code(0), exit_codes::FAILURE);
        assert_eq!(exit_codes::failure_code(3), 3);
    }

    #[test]
    fn test_gate_violation_blocks_task() {
        let errors = all_errors();
        let blocking: Vec<_> = errors.iter().filter(|e| e.blocks_task()).collect();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].exit_code(), exit_codes::BLOCKED);
    }

    #[test]
    fn test_bridge_error_converts_preserving_kind() {
        let err: OrchestratorError = BridgeError::from(StateCorruptionError {
            path: PathBuf::from("x.json"),
            message: "bad".into(),
        })
        .into();
        assert!(matches!(err, OrchestratorError::StateCorruption(_)));
        assert_eq!(err.exit_code(), exit_codes::STATE_CORRUPTION);
        assert!(err.to_string().contains("x.json"));
    }

    #[test]
    fn test_external_worker_error_message() {
        let err = ExternalWorkerError {
            delegate: "test-orchestrator".into(),
            kind: "crash".into(),
            message: "segfault".into(),
        };
        assert_eq!(
            err.to_string(),
            "Delegate 'test-orchestrator' failed (crash): segfault"
        );
    }

    #[test]
    fn test_degraded_warning_display() {
        let warning = DegradedPhaseWarning {
            phase: PhaseId::ComplexityEvaluation,
            message: "delegate failed".into(),
        };
        assert_eq!(
            warning.to_string(),
            "Phase 2.7 (Complexity Evaluation) degraded, using local fallback: delegate failed"
        );
    }

    #[test]
    fn test_all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        for err in all_errors() {
            assert_std_error(&err);
        }
        let bridge = BridgeError::Io {
            path: PathBuf::from("x"),
            source: std::io::Error::other("x"),
        };
        assert_std_error(&bridge);
    }
}
