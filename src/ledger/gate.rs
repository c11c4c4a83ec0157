//! Phase gate validation over the invocation ledger.
//!
//! A gated phase may only claim completion when the ledger holds at least
//! one completed invocation for it. Any completed record counts, not just the
//! most recent one, which lets retry-then-succeed sequences pass and keeps the
//! check monotonic for the rest of the run.

use super::{InvocationLedger, PhaseInvocationRecord};
use crate::phase::{PhaseId, WorkflowMode};
use serde::Serialize;
use std::fmt;

const RULE: &str = "═══════════════════════════════════════════════════════";

/// A gated phase has no completed delegate invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseGateViolation {
    pub phase: PhaseId,
    pub description: String,
    pub expected_delegate: String,
    /// Every ledger record for the phase, oldest first
    pub actual: Vec<PhaseInvocationRecord>,
    pub remediation: String,
}

impl PhaseGateViolation {
    fn new(phase: PhaseId, description: &str, ledger: &InvocationLedger) -> Self {
        let expected_delegate = phase
            .expected_delegate()
            .unwrap_or("none (local phase)")
            .to_string();
        let remediation = format!(
            "1. Invoke the `{delegate}` delegate for phase {phase} ({desc}).\n\
             2. Record its result:   phasegate bridge respond --payload-file <result-file>\n\
             3. Resume the workflow: phasegate run <source> --resume\n\
             4. If the task was moved to tasks/blocked/, move it back once phase {phase} is completed.",
            delegate = expected_delegate,
            phase = phase,
            desc = description,
        );
        Self {
            phase,
            description: description.to_string(),
            expected_delegate,
            actual: ledger.records_for(phase).into_iter().cloned().collect(),
            remediation,
        }
    }

    /// One-line summary of what the ledger shows for the phase.
    pub fn actual_state(&self) -> String {
        if self.actual.is_empty() {
            return "no invocation recorded".to_string();
        }
        self.actual
            .iter()
            .map(|r| match &r.skip_reason {
                Some(reason) => format!("{} by {} ({})", r.status, r.delegate, reason),
                None => format!("{} by {}", r.status, r.delegate),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn reason(&self) -> String {
        format!(
            "Phase gate violation: phase {} ({}) requires a completed `{}` invocation; found {}",
            self.phase,
            self.description,
            self.expected_delegate,
            self.actual_state()
        )
    }
}

impl fmt::Display for PhaseGateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "PHASE GATE VIOLATION: Phase {} ({})", self.phase, self.description)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Expected delegate: {}", self.expected_delegate)?;
        writeln!(f, "Actual state:      {}", self.actual_state())?;
        writeln!(f)?;
        writeln!(f, "To resolve:")?;
        for line in self.remediation.lines() {
            writeln!(f, "  {}", line)?;
        }
        write!(f, "{}", RULE)
    }
}

impl std::error::Error for PhaseGateViolation {}

/// The run finished without completing every required phase of its mode.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowViolation {
    pub mode: WorkflowMode,
    pub expected: usize,
    pub actual: usize,
    pub missing: Vec<PhaseId>,
    pub log: String,
}

impl fmt::Display for WorkflowViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "PROTOCOL VIOLATION: required delegates were not invoked")?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Workflow mode: {}", self.mode)?;
        writeln!(f, "Expected: {} completed invocations", self.expected)?;
        writeln!(f, "Actual: {} completed invocations", self.actual)?;
        writeln!(f)?;
        writeln!(f, "Missing phases:")?;
        for phase in &self.missing {
            writeln!(f, "  - Phase {} ({})", phase, phase.description())?;
        }
        writeln!(f)?;
        write!(f, "{}", self.log)?;
        write!(f, "{}", RULE)
    }
}

impl std::error::Error for WorkflowViolation {}

impl InvocationLedger {
    /// Succeeds iff any record for `phase` is completed.
    pub fn validate_phase_completion(
        &self,
        phase: PhaseId,
        description: &str,
    ) -> Result<(), PhaseGateViolation> {
        if self.is_completed(phase) {
            tracing::debug!(%phase, "phase gate passed");
            return Ok(());
        }
        let violation = PhaseGateViolation::new(phase, description, self);
        tracing::warn!(
            %phase,
            expected = %violation.expected_delegate,
            actual = %violation.actual_state(),
            "phase gate violation"
        );
        Err(violation)
    }

    /// Every required phase of `mode` must have a completed invocation.
    pub fn validate_workflow(&self, mode: WorkflowMode) -> Result<(), WorkflowViolation> {
        let required = mode.required_phases();
        let missing: Vec<PhaseId> = required
            .iter()
            .copied()
            .filter(|p| !self.is_completed(*p))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(WorkflowViolation {
            mode,
            expected: required.len(),
            actual: required.len() - missing.len(),
            missing,
            log: self.render_log(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DelegateSource;

    fn complete(ledger: &mut InvocationLedger, phase: PhaseId) {
        let delegate = phase.expected_delegate().unwrap_or("local");
        ledger.record_invocation(phase, delegate, phase.description(), DelegateSource::Global);
        ledger.mark_complete(phase, 30.0, Vec::new()).unwrap();
    }

    #[test]
    fn test_skipped_only_phase_violates_gate() {
        let mut ledger = InvocationLedger::new();
        ledger.record_invocation(
            PhaseId::Implementation,
            "implementation-specialist",
            "Implementation",
            DelegateSource::Global,
        );
        ledger.mark_skipped(PhaseId::Implementation, "delegate unavailable");

        let violation = ledger
            .validate_phase_completion(PhaseId::Implementation, "Implementation")
            .unwrap_err();
        assert_eq!(violation.phase, PhaseId::Implementation);
        assert_eq!(violation.expected_delegate, "implementation-specialist");
        assert_eq!(violation.actual.len(), 1);
        assert!(violation.actual_state().contains("skipped"));
        assert!(violation.actual_state().contains("delegate unavailable"));

        let rendered = violation.to_string();
        assert!(rendered.contains("PHASE GATE VIOLATION: Phase 3"));
        assert!(rendered.contains("implementation-specialist"));
        assert!(rendered.contains("phasegate run <source> --resume"));
        // Whether the task moved is the caller's to report.
        assert!(!rendered.contains("BLOCKED STATE"));
    }

    #[test]
    fn test_later_completed_record_satisfies_gate() {
        let mut ledger = InvocationLedger::new();
        ledger.mark_skipped(PhaseId::Implementation, "first attempt skipped");
        assert!(
            ledger
                .validate_phase_completion(PhaseId::Implementation, "Implementation")
                .is_err()
        );

        complete(&mut ledger, PhaseId::Implementation);
        assert!(
            ledger
                .validate_phase_completion(PhaseId::Implementation, "Implementation")
                .is_ok()
        );
    }

    #[test]
    fn test_gate_is_monotonic_after_later_skips() {
        let mut ledger = InvocationLedger::new();
        complete(&mut ledger, PhaseId::Testing);
        assert!(ledger.validate_phase_completion(PhaseId::Testing, "Testing").is_ok());

        ledger.record_invocation(PhaseId::Testing, "test-orchestrator", "Retry", DelegateSource::Global);
        ledger.mark_skipped(PhaseId::Testing, "retry abandoned");
        ledger.mark_skipped(PhaseId::Testing, "second skip");

        assert!(ledger.validate_phase_completion(PhaseId::Testing, "Testing").is_ok());
    }

    #[test]
    fn test_in_progress_record_does_not_pass() {
        let mut ledger = InvocationLedger::new();
        ledger.record_invocation(PhaseId::CodeReview, "code-reviewer", "Review", DelegateSource::Global);
        let violation = ledger
            .validate_phase_completion(PhaseId::CodeReview, "Review")
            .unwrap_err();
        assert_eq!(violation.actual_state(), "in_progress by code-reviewer");
    }

    #[test]
    fn test_empty_ledger_violation_names_expected_delegate() {
        let ledger = InvocationLedger::new();
        let violation = ledger
            .validate_phase_completion(PhaseId::ArchitecturalReview, "Architectural Review")
            .unwrap_err();
        assert_eq!(violation.expected_delegate, "architectural-reviewer");
        assert_eq!(violation.actual_state(), "no invocation recorded");
        assert!(violation.reason().contains("phase 2.5B"));
    }

    #[test]
    fn test_violation_serializes_for_tooling() {
        let ledger = InvocationLedger::new();
        let violation = ledger
            .validate_phase_completion(PhaseId::Planning, "Planning")
            .unwrap_err();
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["phase"], "2");
        assert_eq!(json["expected_delegate"], "planning-specialist");
        assert!(json["remediation"].as_str().unwrap().contains("planning-specialist"));
    }

    #[test]
    fn test_validate_workflow_passes_with_all_required_phases() {
        let mut ledger = InvocationLedger::new();
        for phase in WorkflowMode::Standard.required_phases() {
            complete(&mut ledger, *phase);
        }
        assert!(ledger.validate_workflow(WorkflowMode::Standard).is_ok());
    }

    #[test]
    fn test_validate_workflow_lists_missing_phases() {
        let mut ledger = InvocationLedger::new();
        complete(&mut ledger, PhaseId::Planning);
        complete(&mut ledger, PhaseId::CodeReview);

        let violation = ledger.validate_workflow(WorkflowMode::Standard).unwrap_err();
        assert_eq!(violation.expected, 5);
        assert_eq!(violation.actual, 2);
        assert_eq!(
            violation.missing,
            vec![PhaseId::ArchitecturalReview, PhaseId::Implementation, PhaseId::Testing]
        );

        let message = violation.to_string();
        assert!(message.contains("PROTOCOL VIOLATION"));
        assert!(message.contains("Expected: 5"));
        assert!(message.contains("Actual: 2 completed invocations"));
        assert!(message.contains("Phase 2.5B"));
        assert!(message.contains("AGENT INVOCATIONS LOG"));
        assert!(message.contains(RULE));
    }

    #[test]
    fn test_micro_workflow_satisfied_by_implementation_phases() {
        let mut ledger = InvocationLedger::new();
        for phase in [PhaseId::Implementation, PhaseId::Testing, PhaseId::CodeReview] {
            complete(&mut ledger, phase);
        }
        assert!(ledger.validate_workflow(WorkflowMode::Micro).is_ok());
        assert!(ledger.validate_workflow(WorkflowMode::Standard).is_err());
    }
}
