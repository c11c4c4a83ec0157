//! Invocation ledger: the append-only record of delegate invocations in a run.
//!
//! Records are never removed. A status change either transitions the most
//! recent open record for a phase or appends a new record, so "has this phase
//! ever completed" only moves from false to true.

pub mod gate;

pub use gate::{PhaseGateViolation, WorkflowViolation};

use crate::phase::PhaseId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl InvocationStatus {
    /// Open records can still transition to completed or skipped.
    pub fn is_open(self) -> bool {
        matches!(self, InvocationStatus::Pending | InvocationStatus::InProgress)
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationStatus::Pending => write!(f, "pending"),
            InvocationStatus::InProgress => write!(f, "in_progress"),
            InvocationStatus::Completed => write!(f, "completed"),
            InvocationStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Where the delegate definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegateSource {
    #[default]
    Global,
    Local,
    Template,
}

impl fmt::Display for DelegateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegateSource::Global => write!(f, "global"),
            DelegateSource::Local => write!(f, "local"),
            DelegateSource::Template => write!(f, "template"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInvocationRecord {
    pub phase: PhaseId,
    pub delegate: String,
    pub description: String,
    pub source: DelegateSource,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("No open invocation recorded for phase {phase}; call record_invocation first")]
    NoOpenRecord { phase: PhaseId },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationLedger {
    records: Vec<PhaseInvocationRecord>,
    #[serde(default)]
    pending: BTreeSet<PhaseId>,
}

impl InvocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the phases expected to run, at workflow start.
    pub fn declare_pending<I>(&mut self, phases: I)
    where
        I: IntoIterator<Item = PhaseId>,
    {
        self.pending.extend(phases);
    }

    pub fn pending_phases(&self) -> &BTreeSet<PhaseId> {
        &self.pending
    }

    pub fn record_invocation(
        &mut self,
        phase: PhaseId,
        delegate: &str,
        description: &str,
        source: DelegateSource,
    ) {
        tracing::debug!(%phase, delegate, "recording delegate invocation");
        self.records.push(PhaseInvocationRecord {
            phase,
            delegate: delegate.to_string(),
            description: description.to_string(),
            source,
            status: InvocationStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            files_modified: Vec::new(),
            skip_reason: None,
        });
    }

    /// Transition the most recent open record for `phase` to completed.
    pub fn mark_complete(
        &mut self,
        phase: PhaseId,
        duration_seconds: f64,
        files_modified: Vec<PathBuf>,
    ) -> Result<(), LedgerError> {
        let record = self
            .latest_open_mut(phase)
            .ok_or(LedgerError::NoOpenRecord { phase })?;
        record.status = InvocationStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.duration_seconds = Some(duration_seconds);
        record.files_modified = files_modified;
        self.pending.remove(&phase);
        tracing::debug!(%phase, duration_seconds, "delegate invocation completed");
        Ok(())
    }

    /// Transition the most recent open record for `phase` to skipped, or
    /// append a skipped record when nothing is open.
    pub fn mark_skipped(&mut self, phase: PhaseId, reason: &str) {
        tracing::debug!(%phase, reason, "delegate invocation skipped");
        let now = Utc::now();
        if let Some(record) = self.latest_open_mut(phase) {
            record.status = InvocationStatus::Skipped;
            record.completed_at = Some(now);
            record.skip_reason = Some(reason.to_string());
            return;
        }
        self.records.push(PhaseInvocationRecord {
            phase,
            delegate: phase.expected_delegate().unwrap_or("none").to_string(),
            description: phase.description().to_string(),
            source: DelegateSource::default(),
            status: InvocationStatus::Skipped,
            started_at: now,
            completed_at: Some(now),
            duration_seconds: None,
            files_modified: Vec::new(),
            skip_reason: Some(reason.to_string()),
        });
    }

    pub fn records(&self) -> &[PhaseInvocationRecord] {
        &self.records
    }

    pub fn records_for(&self, phase: PhaseId) -> Vec<&PhaseInvocationRecord> {
        self.records.iter().filter(|r| r.phase == phase).collect()
    }

    /// True if any record for the phase is completed.
    pub fn is_completed(&self, phase: PhaseId) -> bool {
        self.records
            .iter()
            .any(|r| r.phase == phase && r.status == InvocationStatus::Completed)
    }

    /// True if the phase has an invocation still awaiting an outcome.
    pub fn has_open(&self, phase: PhaseId) -> bool {
        self.records
            .iter()
            .any(|r| r.phase == phase && r.status.is_open())
    }

    pub fn completed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == InvocationStatus::Completed)
            .count()
    }

    fn latest_open_mut(&mut self, phase: PhaseId) -> Option<&mut PhaseInvocationRecord> {
        self.records
            .iter_mut()
            .rev()
            .find(|r| r.phase == phase && r.status.is_open())
    }

    /// Human-readable invocation log, one line per record.
    pub fn render_log(&self) -> String {
        let mut out = String::from("AGENT INVOCATIONS LOG:\n");
        if self.records.is_empty() {
            out.push_str("  (no invocations recorded)\n");
            return out;
        }
        for (i, r) in self.records.iter().enumerate() {
            let marker = match r.status {
                InvocationStatus::Completed => "✓",
                InvocationStatus::Skipped => "⊘",
                InvocationStatus::Pending | InvocationStatus::InProgress => "…",
            };
            let mut line = format!(
                "  {}. {} Phase {} ({}) → {} [{}]",
                i + 1,
                marker,
                r.phase,
                r.description,
                r.delegate,
                r.status
            );
            if let Some(d) = r.duration_seconds {
                line.push_str(&format!(" {:.1}s", d));
            }
            if let Some(reason) = &r.skip_reason {
                line.push_str(&format!(" ({})", reason));
            }
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}
