//! Phase pipeline orchestrator.
//!
//! Runs the phases of a workflow mode in order over an accumulating
//! [`PartialState`]. Delegated phases go through the [`DelegateBridge`]; when
//! a delegate has not answered yet the run checkpoints and returns
//! [`Outcome::Suspended`]. Gated phases must pass the ledger's gate before the
//! pipeline moves on.
//!
//! | Policy       | On failure                                            |
//! |--------------|-------------------------------------------------------|
//! | `Critical`   | Run fails; nothing is written to the output path      |
//! | `Degradable` | Warning recorded, local fallback used, run continues  |

pub mod output;
pub mod state;

pub use state::{Artifact, ArtifactOrigin, OrchestrationResult, Outcome, PartialState, Suspension};

use crate::bridge::{
    BridgeRequest, BridgeSlot, CheckpointState, CheckpointStore, DelegateBridge, DelegateReply,
    DirLock, FileBridge, ResumeFlags,
};
use crate::config::OrchestrationConfig;
use crate::content::{ContentGenerator, MarkdownContent, decode_payload, parse_complexity};
use crate::errors::{BridgeError, DegradedPhaseWarning, OrchestratorError, exit_codes};
use crate::ledger::{DelegateSource, InvocationLedger, PhaseInvocationRecord};
use crate::phase::{FailurePolicy, PhaseId, PhaseSpec, WorkflowMode, pipeline_for};
use crate::tasks::{FileTaskStore, TaskStore, TaskStoreError};
use chrono::{DateTime, Utc};
use output::StagingWriter;
use serde::Serialize;
use state::ResultBuilder;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

/// Mutable state of one run, restored from the checkpoint on resume.
struct Run {
    run_id: String,
    flags: ResumeFlags,
    start: PhaseId,
    partial: PartialState,
    ledger: InvocationLedger,
    report: ResultBuilder,
}

enum Flow {
    Continue,
    Suspend(Suspension),
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
    mode: WorkflowMode,
    source_path: &'a Path,
    counts: &'a BTreeMap<String, usize>,
    warnings: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    complexity_score: Option<u8>,
    completed_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct InvocationReport<'a> {
    records: &'a [PhaseInvocationRecord],
    completed: usize,
    log: String,
}

pub struct Orchestrator {
    config: OrchestrationConfig,
    bridge: Arc<dyn DelegateBridge>,
    checkpoints: CheckpointStore,
    content: Box<dyn ContentGenerator>,
    tasks: Box<dyn TaskStore>,
}

impl Orchestrator {
    pub fn new(config: OrchestrationConfig) -> Self {
        let files = config.protocol_files();
        let bridge = config
            .injected_bridge()
            .unwrap_or_else(|| Arc::new(FileBridge::new(files.clone(), config.dry_run)));
        let checkpoints = CheckpointStore::new(files.checkpoint(), config.dry_run);
        let tasks = Box::new(FileTaskStore::new(config.tasks_root.clone(), config.dry_run));
        Self {
            config,
            bridge,
            checkpoints,
            content: Box::new(MarkdownContent),
            tasks,
        }
    }

    pub fn with_content(mut self, content: Box<dyn ContentGenerator>) -> Self {
        self.content = content;
        self
    }

    pub fn with_task_store(mut self, tasks: Box<dyn TaskStore>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Run the pipeline. Expected failures are reported in the result;
    /// panics become an internal-error result.
    pub fn run(&self) -> Outcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(%message, "orchestrator panicked");
                self.bridge.finish(false);
                Outcome::Completed(ResultBuilder::default().fail(
                    OrchestratorError::Internal(message).to_string(),
                    exit_codes::INTERNAL,
                    InvocationLedger::new(),
                ))
            }
        }
    }

    fn execute(&self) -> Outcome {
        let _lock = if self.config.dry_run {
            None
        } else {
            match DirLock::acquire(&self.config.protocol_files().lock()) {
                Ok(lock) => Some(lock),
                Err(err) => return self.fail_early(err),
            }
        };

        let mut run = match self.prepare() {
            Ok(run) => run,
            Err(err) => return self.fail_early(err),
        };
        tracing::info!(
            run_id = %run.run_id,
            mode = %run.flags.mode,
            start = %run.start,
            resume = self.config.resume,
            dry_run = self.config.dry_run,
            "starting pipeline"
        );

        match self.drive(&mut run) {
            Ok(Flow::Suspend(suspension)) => Outcome::Suspended(suspension),
            Ok(Flow::Continue) => self.finalize(run),
            Err(err) => self.fail(run, err),
        }
    }

    /// Build the run state: fresh, or restored from the checkpoint.
    fn prepare(&self) -> Result<Run, OrchestratorError> {
        // Also checked at promotion.
        output::check_replaceable(&self.config.output_path)?;
        let slot = self.bridge.slot()?;
        if self.config.resume {
            return self.prepare_resume(slot);
        }

        if slot != BridgeSlot::Empty {
            return Err(OrchestratorError::configuration(format!(
                "a delegate request or response is outstanding in {}; \
                 resume it with --resume or discard it with `phasegate bridge clear`",
                self.config.work_dir.display()
            )));
        }

        let mut report = ResultBuilder::default();
        if self.checkpoints.exists() {
            report.warn(format!(
                "Replacing checkpoint left by an earlier run: {}",
                self.checkpoints.path().display()
            ));
        }

        let flags = self.config.resume_flags();
        let mut ledger = InvocationLedger::new();
        ledger.declare_pending(
            pipeline_for(flags.mode)
                .iter()
                .filter(|s| s.is_delegated())
                .map(|s| s.id),
        );
        Ok(Run {
            run_id: uuid::Uuid::new_v4().to_string(),
            flags,
            start: PhaseId::Context,
            partial: PartialState::default(),
            ledger,
            report,
        })
    }

    fn prepare_resume(&self, slot: BridgeSlot) -> Result<Run, OrchestratorError> {
        let checkpoint = self.checkpoints.load()?;
        let checkpoint = match (checkpoint, slot.is_ready()) {
            (Some(checkpoint), true) => checkpoint,
            (None, _) => {
                return Err(OrchestratorError::configuration(format!(
                    "cannot resume: nothing pending (no checkpoint at {})",
                    self.checkpoints.path().display()
                )));
            }
            (Some(_), false) => {
                return Err(OrchestratorError::configuration(format!(
                    "cannot resume: nothing pending (no delegate response in {})",
                    self.config.work_dir.display()
                )));
            }
        };

        if checkpoint.source_path != self.config.source_path {
            return Err(OrchestratorError::configuration(format!(
                "checkpoint belongs to {}, not {}",
                checkpoint.source_path.display(),
                self.config.source_path.display()
            )));
        }
        if let BridgeSlot::Ready(response) = &slot
            && response.request_id != checkpoint.request_id
        {
            return Err(crate::errors::StateCorruptionError {
                path: self.config.protocol_files().response(),
                message: format!(
                    "response answers request {} but the checkpoint is waiting on {}",
                    response.request_id, checkpoint.request_id
                ),
            }
            .into());
        }

        // Mode and skip flags come from the suspended run; dry-run and
        // verbosity belong to this invocation.
        let flags = ResumeFlags {
            dry_run: self.config.dry_run,
            verbose: self.config.verbose,
            ..checkpoint.flags
        };
        tracing::info!(phase = %checkpoint.suspended_phase, "resuming from checkpoint");
        Ok(Run {
            run_id: checkpoint.run_id,
            flags,
            start: checkpoint.suspended_phase,
            partial: checkpoint.partial,
            ledger: checkpoint.ledger,
            report: ResultBuilder::with_warnings(checkpoint.warnings),
        })
    }

    fn drive(&self, run: &mut Run) -> Result<Flow, OrchestratorError> {
        let mode = run.flags.mode;
        let pipeline = pipeline_for(mode);
        let start = pipeline
            .iter()
            .position(|s| s.id == run.start)
            .ok_or_else(|| crate::errors::StateCorruptionError {
                path: self.checkpoints.path().to_path_buf(),
                message: format!("phase {} is not part of the {} workflow", run.start, mode),
            })?;

        for spec in &pipeline[start..] {
            tracing::info!(phase = %spec.id, description = spec.id.description(), "phase started");
            if let Flow::Suspend(suspension) = self.run_phase(spec, run)? {
                return Ok(Flow::Suspend(suspension));
            }
        }

        run.ledger.validate_workflow(mode)?;
        Ok(Flow::Continue)
    }

    fn run_phase(&self, spec: &PhaseSpec, run: &mut Run) -> Result<Flow, OrchestratorError> {
        let Some(delegate) = spec.delegate else {
            self.run_local(spec.id, run)?;
            return Ok(Flow::Continue);
        };
        let phase = spec.id;

        if run.flags.skip_delegates {
            run.ledger.mark_skipped(phase, "delegates disabled (--skip-delegates)");
            return self.skip_with_fallback(spec, run, "delegates disabled");
        }
        if spec.policy == FailurePolicy::Degradable && run.flags.skip_external_analysis {
            run.ledger
                .mark_skipped(phase, "external analysis disabled (--skip-external-analysis)");
            self.apply_fallback(phase, run);
            return Ok(Flow::Continue);
        }

        if !run.ledger.has_open(phase) {
            run.ledger
                .record_invocation(phase, delegate, phase.description(), DelegateSource::Global);
        }
        let payload = self.content.build_payload(phase, spec.depends_on, &run.partial);
        let request = BridgeRequest::new(phase, delegate, payload)
            .with_context("run_id", run.run_id.clone())
            .with_context("mode", run.flags.mode.to_string())
            .with_context("task_id", self.config.task_id.clone())
            .with_context("description", phase.description());

        match self.bridge.invoke(request) {
            Ok(DelegateReply::Ready {
                payload,
                duration_seconds,
            }) => {
                run.ledger
                    .mark_complete(phase, duration_seconds.unwrap_or(0.0), Vec::new())
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                self.absorb(phase, &payload, run);
                if spec.gated {
                    run.ledger
                        .validate_phase_completion(phase, phase.description())?;
                }
                Ok(Flow::Continue)
            }
            Ok(DelegateReply::Suspended {
                request_id,
                request_path,
                persisted,
            }) => self.suspend(phase, delegate, request_id, request_path, persisted, run),
            Err(BridgeError::ExternalWorker(err)) if spec.policy == FailurePolicy::Degradable => {
                run.ledger
                    .mark_skipped(phase, &format!("delegate failed: {}", err.message));
                let warning = DegradedPhaseWarning {
                    phase,
                    message: err.to_string(),
                };
                run.report.warn(warning.to_string());
                self.apply_fallback(phase, run);
                Ok(Flow::Continue)
            }
            Err(BridgeError::ExternalWorker(err)) => {
                run.ledger
                    .mark_skipped(phase, &format!("delegate failed: {}", err.message));
                Err(err.into())
            }
            Err(other) => Err(other.into()),
        }
    }

    fn run_local(&self, phase: PhaseId, run: &mut Run) -> Result<(), OrchestratorError> {
        let context = self
            .content
            .load_context(
                &self.config.source_path,
                self.config.task_id.as_deref(),
                run.flags.max_items,
            )
            .map_err(|e| OrchestratorError::CriticalPhase {
                phase,
                message: format!("{:#}", e),
            })?;
        if context.truncated {
            run.report.warn(format!(
                "Task context truncated to {} files (max_items)",
                run.flags.max_items
            ));
        }
        run.partial
            .artifacts
            .insert(phase, Artifact { origin: ArtifactOrigin::Local, content: context.render() });
        run.partial.context = Some(context);
        Ok(())
    }

    /// A skipped gated phase fails its gate; a skipped optional phase degrades.
    fn skip_with_fallback(
        &self,
        spec: &PhaseSpec,
        run: &mut Run,
        why: &str,
    ) -> Result<Flow, OrchestratorError> {
        if spec.gated {
            run.ledger
                .validate_phase_completion(spec.id, spec.id.description())?;
        }
        run.report.warn(
            DegradedPhaseWarning {
                phase: spec.id,
                message: why.to_string(),
            }
            .to_string(),
        );
        self.apply_fallback(spec.id, run);
        Ok(Flow::Continue)
    }

    fn apply_fallback(&self, phase: PhaseId, run: &mut Run) {
        if phase == PhaseId::ComplexityEvaluation {
            run.partial.complexity_score = Some(self.content.assess_complexity(&run.partial).score);
        }
        let content = self.content.fallback(phase, &run.partial);
        run.partial
            .artifacts
            .insert(phase, Artifact { origin: ArtifactOrigin::Fallback, content });
    }

    fn absorb(&self, phase: PhaseId, payload: &str, run: &mut Run) {
        if phase == PhaseId::ComplexityEvaluation {
            let score = match parse_complexity(payload) {
                Some(score) => score,
                None => {
                    run.report.warn(format!(
                        "Phase {} returned no usable score; using the local heuristic",
                        phase
                    ));
                    self.content.assess_complexity(&run.partial).score
                }
            };
            run.partial.complexity_score = Some(score);
        }
        run.partial.artifacts.insert(
            phase,
            Artifact {
                origin: ArtifactOrigin::Delegate,
                content: decode_payload(payload),
            },
        );
    }

    fn suspend(
        &self,
        phase: PhaseId,
        delegate: &str,
        request_id: String,
        request_path: std::path::PathBuf,
        persisted: bool,
        run: &mut Run,
    ) -> Result<Flow, OrchestratorError> {
        let checkpoint = CheckpointState {
            run_id: run.run_id.clone(),
            source_path: self.config.source_path.clone(),
            output_path: self.config.output_path.clone(),
            work_dir: self.config.work_dir.clone(),
            task_id: self.config.task_id.clone(),
            flags: run.flags.clone(),
            suspended_phase: phase,
            request_id: request_id.clone(),
            partial: run.partial.clone(),
            ledger: run.ledger.clone(),
            warnings: run.report.warnings.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.checkpoints.save(&checkpoint) {
            // A request without a checkpoint could never be resumed.
            if let Err(clear_err) = self.bridge.clear() {
                tracing::warn!(error = %clear_err, "failed to withdraw request");
            }
            return Err(err.into());
        }
        tracing::info!(%phase, delegate, persisted, "suspending for external delegate");
        Ok(Flow::Suspend(Suspension {
            phase,
            delegate: delegate.to_string(),
            request_id,
            request_path,
            checkpoint_path: self.checkpoints.path().to_path_buf(),
            persisted,
            warnings: run.report.warnings.clone(),
        }))
    }

    fn finalize(&self, mut run: Run) -> Outcome {
        let phases_completed = run.partial.artifacts.len();
        run.report.count("phases_completed", phases_completed);
        run.report.count("phases_degraded", run.partial.degraded_count());
        run.report.count("delegates_invoked", run.ledger.completed_count());
        run.report.count("artifacts", phases_completed + 2);

        let mut writer = StagingWriter::new(&self.config.output_path, &run.run_id, self.config.dry_run);
        match self.write_output(&mut writer, &run) {
            Ok(()) => {}
            Err(err) => {
                writer.abort();
                return self.fail(run, err);
            }
        }
        let output = match writer.promote() {
            Ok(output) => output,
            Err(err) => return self.fail(run, err),
        };

        if let Err(err) = self.checkpoints.remove() {
            run.report.warn(format!("Failed to remove checkpoint: {}", err));
        }
        self.bridge.finish(true);
        tracing::info!(
            run_id = %run.run_id,
            output = %output.display(),
            warnings = run.report.warnings.len(),
            "pipeline completed"
        );
        Outcome::Completed(run.report.succeed(Some(output), run.ledger))
    }

    fn write_output(&self, writer: &mut StagingWriter, run: &Run) -> Result<(), OrchestratorError> {
        writer.begin()?;
        for (phase, artifact) in &run.partial.artifacts {
            writer.write_text(&format!("{}.md", phase.slug()), &artifact.content)?;
        }
        writer.write_json(
            "invocations.json",
            &InvocationReport {
                records: run.ledger.records(),
                completed: run.ledger.completed_count(),
                log: run.ledger.render_log(),
            },
        )?;
        writer.write_json(
            output::SUMMARY_FILE,
            &RunSummary {
                run_id: &run.run_id,
                task_id: self.config.task_id.as_deref(),
                mode: run.flags.mode,
                source_path: &self.config.source_path,
                counts: &run.report.counts,
                warnings: &run.report.warnings,
                complexity_score: run.partial.complexity_score,
                completed_at: Utc::now(),
            },
        )
    }

    /// Fail a run that got far enough to have a ledger. The checkpoint, if
    /// any, is kept.
    fn fail(&self, mut run: Run, err: OrchestratorError) -> Outcome {
        tracing::error!(error = %err, exit_code = err.exit_code(), "pipeline failed");
        if err.blocks_task() {
            self.block_task(&block_reason(&err), &mut run.report);
        }
        self.bridge.finish(false);
        Outcome::Completed(run.report.fail(err.to_string(), err.exit_code(), run.ledger))
    }

    fn fail_early(&self, err: OrchestratorError) -> Outcome {
        tracing::error!(error = %err, exit_code = err.exit_code(), "pipeline could not start");
        Outcome::Completed(ResultBuilder::default().fail(
            err.to_string(),
            err.exit_code(),
            InvocationLedger::new(),
        ))
    }

    fn block_task(&self, reason: &str, report: &mut ResultBuilder) {
        let Some(task_id) = self.config.task_id.as_deref() else {
            report.warn("No task id for this run; nothing moved to BLOCKED");
            return;
        };
        match self.tasks.move_to_blocked(task_id, reason) {
            Ok(path) if self.config.dry_run => {
                tracing::info!(task_id, path = %path.display(), "dry run: task not moved to blocked");
            }
            Ok(path) => {
                report.blocked = true;
                tracing::info!(task_id, path = %path.display(), "task blocked");
            }
            Err(err @ TaskStoreError::NotFound { .. }) => report.warn(err.to_string()),
            Err(err) => report.warn(format!("Failed to move {} to BLOCKED: {}", task_id, err)),
        }
    }
}

fn block_reason(err: &OrchestratorError) -> String {
    match err {
        OrchestratorError::GateViolation(v) => v.reason(),
        OrchestratorError::WorkflowViolation(v) => format!(
            "Workflow violation ({} mode): missing phases {}",
            v.mode,
            v.missing
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        other => other.to_string(),
    }
}
