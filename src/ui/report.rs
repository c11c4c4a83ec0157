//! Human-readable run reports for stdout.

use super::icons::{BLOCKER, CHECK, CROSS, FILE_NEW, FOLDER, PROGRESS, WAITING, WARN};
use crate::ledger::{InvocationLedger, InvocationStatus};
use crate::orchestrator::{OrchestrationResult, Outcome, Suspension};
use console::style;
use std::fmt::Write;

pub fn render_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Completed(result) => render_result(result),
        Outcome::Suspended(suspension) => render_suspension(suspension),
    }
}

fn render_result(result: &OrchestrationResult) -> String {
    let mut out = String::new();
    if result.success {
        let _ = writeln!(out, "{}{}", CHECK, style("Workflow completed").green().bold());
    } else if result.blocked {
        let _ = writeln!(
            out,
            "{}{}",
            BLOCKER,
            style(format!("Workflow blocked (exit {})", result.exit_code)).red().bold()
        );
    } else {
        let _ = writeln!(
            out,
            "{}{}",
            CROSS,
            style(format!("Workflow failed (exit {})", result.exit_code)).red().bold()
        );
    }

    if let Some(path) = &result.output_path {
        let _ = writeln!(out, "  {}{}", FOLDER, path.display());
    }
    if !result.counts.is_empty() {
        let _ = writeln!(out, "  {}{}", PROGRESS, style("Counts").dim());
        for (name, n) in &result.counts {
            let _ = writeln!(out, "    {:<20} {}", name, style(n).cyan());
        }
    }
    push_warnings(&mut out, &result.warnings);
    for error in &result.errors {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", style(error).red());
    }
    if result.blocked {
        let _ = writeln!(out, "{}The task has been moved to BLOCKED STATE.", BLOCKER);
    }
    out
}

fn render_suspension(s: &Suspension) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}{}",
        WAITING,
        style(format!(
            "Waiting for delegate `{}` (phase {}: {})",
            s.delegate,
            s.phase,
            s.phase.description()
        ))
        .yellow()
        .bold()
    );
    if s.persisted {
        let _ = writeln!(out, "  {}request:    {}", FILE_NEW, s.request_path.display());
        let _ = writeln!(out, "  {}checkpoint: {}", FILE_NEW, s.checkpoint_path.display());
        let _ = writeln!(out, "  request id: {}", style(&s.request_id).dim());
        let _ = writeln!(out);
        let _ = writeln!(out, "Next:");
        let _ = writeln!(out, "  phasegate bridge respond --payload-file <result>");
        let _ = writeln!(out, "  phasegate run <source> --resume");
    } else {
        let _ = writeln!(out, "  {}", style("dry run: no request or checkpoint written").dim());
    }
    push_warnings(&mut out, &s.warnings);
    out
}

fn push_warnings(out: &mut String, warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    let _ = writeln!(out, "  {}{}", WARN, style(format!("{} warning(s)", warnings.len())).yellow());
    for warning in warnings {
        let _ = writeln!(out, "    - {}", warning);
    }
}

/// One styled line per invocation record.
pub fn render_ledger(ledger: &InvocationLedger) -> String {
    let mut out = String::new();
    for record in ledger.records() {
        let status = match record.status {
            InvocationStatus::Completed => style(record.status.to_string()).green(),
            InvocationStatus::Skipped => style(record.status.to_string()).yellow(),
            InvocationStatus::Pending | InvocationStatus::InProgress => {
                style(record.status.to_string()).dim()
            }
        };
        let _ = write!(
            out,
            "  {:<5} {:<26} {}",
            record.phase.as_str(),
            record.delegate,
            status
        );
        if let Some(reason) = &record.skip_reason {
            let _ = write!(out, " {}", style(format!("({})", reason)).dim());
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::exit_codes;
    use crate::ledger::DelegateSource;
    use crate::phase::PhaseId;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn result(success: bool, blocked: bool) -> OrchestrationResult {
        OrchestrationResult {
            success,
            output_path: success.then(|| PathBuf::from("/tmp/out")),
            counts: BTreeMap::from([("phases_completed".to_string(), 4)]),
            errors: if success { vec![] } else { vec!["Phase 3 gate".into()] },
            warnings: vec!["Phase 2.5A degraded".into()],
            exit_code: if success {
                exit_codes::SUCCESS
            } else if blocked {
                exit_codes::BLOCKED
            } else {
                exit_codes::FAILURE
            },
            blocked,
            ledger: InvocationLedger::new(),
        }
    }

    #[test]
    fn test_success_report() {
        let text = render_outcome(&Outcome::Completed(result(true, false)));
        assert!(text.contains("Workflow completed"));
        assert!(text.contains("/tmp/out"));
        assert!(text.contains("phases_completed"));
        assert!(text.contains("1 warning(s)"));
    }

    #[test]
    fn test_blocked_report_names_exit_code() {
        let text = render_outcome(&Outcome::Completed(result(false, true)));
        assert!(text.contains("Workflow blocked (exit 3)"));
        assert!(text.contains("Phase 3 gate"));
        assert!(text.contains("moved to BLOCKED STATE"));
    }

    #[test]
    fn test_unmoved_task_is_not_reported_blocked() {
        let mut unmoved = result(false, false);
        unmoved.exit_code = exit_codes::BLOCKED;
        let text = render_outcome(&Outcome::Completed(unmoved));
        assert!(text.contains("Workflow failed (exit 3)"));
        assert!(!text.contains("BLOCKED STATE"));
    }

    #[test]
    fn test_suspension_report() {
        let suspension = Suspension {
            phase: PhaseId::Implementation,
            delegate: "implementation-specialist".into(),
            request_id: "abc".into(),
            request_path: PathBuf::from(".phasegate-request.json"),
            checkpoint_path: PathBuf::from(".phasegate-workflow-state.json"),
            persisted: true,
            warnings: vec![],
        };
        let text = render_outcome(&Outcome::Suspended(suspension.clone()));
        assert!(text.contains("implementation-specialist"));
        assert!(text.contains("phase 3: Implementation"));
        assert!(text.contains("--resume"));

        let dry = render_outcome(&Outcome::Suspended(Suspension {
            persisted: false,
            ..suspension
        }));
        assert!(dry.contains("dry run"));
        assert!(!dry.contains("--resume"));
    }

    #[test]
    fn test_ledger_lines() {
        let mut ledger = InvocationLedger::new();
        ledger.record_invocation(PhaseId::Testing, "test-orchestrator", "Testing", DelegateSource::Global);
        ledger.mark_skipped(PhaseId::Testing, "offline");
        let text = render_ledger(&ledger);
        assert!(text.contains("test-orchestrator"));
        assert!(text.contains("skipped"));
        assert!(text.contains("offline"));
    }
}
