//! Phase identifiers, workflow modes, and the per-mode pipeline table.
//!
//! This module provides:
//! - `PhaseId`, the closed set of workflow phases (serialized as dotted ids like `"2.5B"`)
//! - `WorkflowMode`, the named phase selections and their required (gated) subsets
//! - `PhaseSpec` and `pipeline_for`, the ordered phases a run executes

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A workflow phase.
///
/// Variants are declared in protocol order, so the derived `Ord` matches the
/// order in which phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PhaseId {
    /// Task context loading (local, never delegated)
    Context,
    Planning,
    PatternSuggestions,
    ArchitecturalReview,
    ComplexityEvaluation,
    Implementation,
    Testing,
    CodeReview,
}

impl PhaseId {
    pub const ALL: [PhaseId; 8] = [
        PhaseId::Context,
        PhaseId::Planning,
        PhaseId::PatternSuggestions,
        PhaseId::ArchitecturalReview,
        PhaseId::ComplexityEvaluation,
        PhaseId::Implementation,
        PhaseId::Testing,
        PhaseId::CodeReview,
    ];

    /// The dotted protocol identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseId::Context => "1",
            PhaseId::Planning => "2",
            PhaseId::PatternSuggestions => "2.5A",
            PhaseId::ArchitecturalReview => "2.5B",
            PhaseId::ComplexityEvaluation => "2.7",
            PhaseId::Implementation => "3",
            PhaseId::Testing => "4",
            PhaseId::CodeReview => "5",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PhaseId::Context => "Task Context",
            PhaseId::Planning => "Implementation Planning",
            PhaseId::PatternSuggestions => "Pattern Suggestions",
            PhaseId::ArchitecturalReview => "Architectural Review",
            PhaseId::ComplexityEvaluation => "Complexity Evaluation",
            PhaseId::Implementation => "Implementation",
            PhaseId::Testing => "Testing",
            PhaseId::CodeReview => "Code Review",
        }
    }

    /// The delegate expected to perform this phase's work.
    ///
    /// Exhaustive on purpose: adding a phase forces a decision here.
    pub fn expected_delegate(self) -> Option<&'static str> {
        match self {
            PhaseId::Context => None,
            PhaseId::Planning => Some("planning-specialist"),
            PhaseId::PatternSuggestions => Some("pattern-advisor"),
            PhaseId::ArchitecturalReview => Some("architectural-reviewer"),
            PhaseId::ComplexityEvaluation => Some("complexity-evaluator"),
            PhaseId::Implementation => Some("implementation-specialist"),
            PhaseId::Testing => Some("test-orchestrator"),
            PhaseId::CodeReview => Some("code-reviewer"),
        }
    }

    /// File-name friendly form, e.g. `phase-2.5b-architectural-review`.
    pub fn slug(self) -> String {
        format!(
            "phase-{}-{}",
            self.as_str().to_lowercase(),
            self.description().to_lowercase().replace(' ', "-")
        )
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        PhaseId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let valid: Vec<&str> = PhaseId::ALL.iter().map(|p| p.as_str()).collect();
                anyhow::anyhow!(
                    "Unknown phase '{}'. Valid phases: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

impl TryFrom<String> for PhaseId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PhaseId> for String {
    fn from(value: PhaseId) -> Self {
        value.as_str().to_string()
    }
}

/// Named phase selections for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    #[default]
    Standard,
    Micro,
    DesignOnly,
    ImplementOnly,
}

impl WorkflowMode {
    /// Phases executed by this mode, in order.
    pub fn phases(self) -> &'static [PhaseId] {
        use PhaseId::*;
        match self {
            WorkflowMode::Standard => &[
                Context,
                Planning,
                PatternSuggestions,
                ArchitecturalReview,
                ComplexityEvaluation,
                Implementation,
                Testing,
                CodeReview,
            ],
            WorkflowMode::Micro | WorkflowMode::ImplementOnly => {
                &[Context, Implementation, Testing, CodeReview]
            }
            WorkflowMode::DesignOnly => &[
                Context,
                Planning,
                PatternSuggestions,
                ArchitecturalReview,
                ComplexityEvaluation,
            ],
        }
    }

    /// Phases whose delegate invocation must be recorded as completed.
    pub fn required_phases(self) -> &'static [PhaseId] {
        use PhaseId::*;
        match self {
            WorkflowMode::Standard => {
                &[Planning, ArchitecturalReview, Implementation, Testing, CodeReview]
            }
            WorkflowMode::Micro | WorkflowMode::ImplementOnly => {
                &[Implementation, Testing, CodeReview]
            }
            WorkflowMode::DesignOnly => &[Planning, ArchitecturalReview, ComplexityEvaluation],
        }
    }

    pub fn is_required(self, phase: PhaseId) -> bool {
        self.required_phases().contains(&phase)
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowMode::Standard => write!(f, "standard"),
            WorkflowMode::Micro => write!(f, "micro"),
            WorkflowMode::DesignOnly => write!(f, "design-only"),
            WorkflowMode::ImplementOnly => write!(f, "implement-only"),
        }
    }
}

impl FromStr for WorkflowMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "standard" => Ok(WorkflowMode::Standard),
            "micro" => Ok(WorkflowMode::Micro),
            "design-only" => Ok(WorkflowMode::DesignOnly),
            "implement-only" => Ok(WorkflowMode::ImplementOnly),
            _ => anyhow::bail!(
                "Invalid workflow mode '{}'. Valid values: standard, micro, design-only, implement-only",
                s
            ),
        }
    }
}

/// How a phase failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Failure aborts the run
    Critical,
    /// Failure is recorded as a warning and a local fallback is substituted
    Degradable,
}

/// One step of a run's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub policy: FailurePolicy,
    /// Delegate that performs the work; `None` for local phases
    pub delegate: Option<&'static str>,
    /// Whether completion must pass the gate validator
    pub gated: bool,
    /// Earlier phases whose artifacts this phase reads
    pub depends_on: &'static [PhaseId],
}

impl PhaseSpec {
    pub fn is_delegated(&self) -> bool {
        self.delegate.is_some()
    }
}

fn depends_on(phase: PhaseId) -> &'static [PhaseId] {
    use PhaseId::*;
    match phase {
        Context => &[],
        Planning => &[Context],
        PatternSuggestions => &[Planning],
        ArchitecturalReview => &[Planning, PatternSuggestions],
        ComplexityEvaluation => &[Planning],
        Implementation => &[Context, Planning, ArchitecturalReview],
        Testing => &[Implementation],
        CodeReview => &[Implementation, Testing],
    }
}

/// Build the ordered pipeline for a workflow mode.
pub fn pipeline_for(mode: WorkflowMode) -> Vec<PhaseSpec> {
    mode.phases()
        .iter()
        .map(|&id| {
            let delegate = id.expected_delegate();
            let gated = delegate.is_some() && mode.is_required(id);
            let policy = if delegate.is_none() || gated {
                FailurePolicy::Critical
            } else {
                FailurePolicy::Degradable
            };
            PhaseSpec {
                id,
                policy,
                delegate,
                gated,
                depends_on: depends_on(id),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_id_roundtrips_through_dotted_string() {
        for phase in PhaseId::ALL {
            let parsed: PhaseId = phase.as_str().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert_eq!("2.5b".parse::<PhaseId>().unwrap(), PhaseId::ArchitecturalReview);
    }

    #[test]
    fn test_unknown_phase_is_rejected() {
        let err = "9.9".parse::<PhaseId>().unwrap_err();
        assert!(err.to_string().contains("Unknown phase '9.9'"));
    }

    #[test]
    fn test_phase_id_serializes_as_string() {
        let json = serde_json::to_string(&PhaseId::ArchitecturalReview).unwrap();
        assert_eq!(json, "\"2.5B\"");
        let back: PhaseId = serde_json::from_str("\"2.7\"").unwrap();
        assert_eq!(back, PhaseId::ComplexityEvaluation);
        assert!(serde_json::from_str::<PhaseId>("\"6\"").is_err());
    }

    #[test]
    fn test_ordering_matches_protocol_order() {
        let mut shuffled = vec![PhaseId::CodeReview, PhaseId::Planning, PhaseId::ArchitecturalReview];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![PhaseId::Planning, PhaseId::ArchitecturalReview, PhaseId::CodeReview]
        );
    }

    #[test]
    fn test_slug() {
        assert_eq!(
            PhaseId::ArchitecturalReview.slug(),
            "phase-2.5b-architectural-review"
        );
        assert_eq!(PhaseId::Context.slug(), "phase-1-task-context");
    }

    #[test]
    fn test_required_phases_per_mode() {
        let ids = |m: WorkflowMode| -> Vec<&str> {
            m.required_phases().iter().map(|p| p.as_str()).collect()
        };
        assert_eq!(ids(WorkflowMode::Standard), vec!["2", "2.5B", "3", "4", "5"]);
        assert_eq!(ids(WorkflowMode::Micro), vec!["3", "4", "5"]);
        assert_eq!(ids(WorkflowMode::DesignOnly), vec!["2", "2.5B", "2.7"]);
        assert_eq!(ids(WorkflowMode::ImplementOnly), vec!["3", "4", "5"]);
    }

    #[test]
    fn test_workflow_mode_parse() {
        assert_eq!("design_only".parse::<WorkflowMode>().unwrap(), WorkflowMode::DesignOnly);
        assert_eq!("MICRO".parse::<WorkflowMode>().unwrap(), WorkflowMode::Micro);
        assert!("turbo".parse::<WorkflowMode>().is_err());
        assert_eq!(WorkflowMode::ImplementOnly.to_string(), "implement-only");
    }

    #[test]
    fn test_standard_pipeline_policies() {
        let pipeline = pipeline_for(WorkflowMode::Standard);
        assert_eq!(pipeline.len(), 8);

        let context = &pipeline[0];
        assert_eq!(context.id, PhaseId::Context);
        assert_eq!(context.policy, FailurePolicy::Critical);
        assert!(!context.gated);
        assert!(!context.is_delegated());

        let patterns = pipeline
            .iter()
            .find(|s| s.id == PhaseId::PatternSuggestions)
            .unwrap();
        assert_eq!(patterns.policy, FailurePolicy::Degradable);
        assert!(!patterns.gated);

        let implementation = pipeline
            .iter()
            .find(|s| s.id == PhaseId::Implementation)
            .unwrap();
        assert_eq!(implementation.policy, FailurePolicy::Critical);
        assert!(implementation.gated);
        assert_eq!(implementation.delegate, Some("implementation-specialist"));
    }

    #[test]
    fn test_design_only_gates_complexity_evaluation() {
        let pipeline = pipeline_for(WorkflowMode::DesignOnly);
        let complexity = pipeline
            .iter()
            .find(|s| s.id == PhaseId::ComplexityEvaluation)
            .unwrap();
        assert!(complexity.gated);
        assert_eq!(complexity.policy, FailurePolicy::Critical);
    }

    #[test]
    fn test_dependencies_only_point_backwards() {
        for phase in PhaseId::ALL {
            for dep in depends_on(phase) {
                assert!(*dep < phase, "{} depends on later phase {}", phase, dep);
            }
        }
    }
}
