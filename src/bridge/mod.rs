//! Checkpoint/resume bridge: a file-based protocol for out-of-process delegate work.
//!
//! A phase that needs a delegate calls [`DelegateBridge::invoke`]. When no
//! response is on disk yet the bridge writes the request file and reports
//! [`DelegateReply::Suspended`]; the orchestrator then persists its checkpoint
//! and the process exits with the sentinel code. An external worker writes the
//! response file, the pipeline is re-run with `--resume`, and the same
//! `invoke` call now returns the decoded payload as if it had blocked.
//!
//! Request and response occupy a single slot ([`BridgeSlot`]). The checkpoint
//! lives in [`checkpoint`], the run lock in [`lock`].

pub mod checkpoint;
pub mod lock;

pub use checkpoint::{CheckpointState, CheckpointStore, ResumeFlags};
pub use lock::DirLock;

use crate::errors::{BridgeError, ExternalWorkerError, StateCorruptionError};
use crate::phase::PhaseId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Version stamped into request and response files.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Well-known protocol file names inside a working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolFiles {
    work_dir: PathBuf,
    prefix: String,
    operation: String,
}

impl ProtocolFiles {
    pub fn new(work_dir: impl Into<PathBuf>, prefix: &str, operation: &str) -> Self {
        Self {
            work_dir: work_dir.into(),
            prefix: prefix.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn request(&self) -> PathBuf {
        self.work_dir.join(format!(".{}-request.json", self.prefix))
    }

    pub fn response(&self) -> PathBuf {
        self.work_dir.join(format!(".{}-response.json", self.prefix))
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.work_dir
            .join(format!(".{}-{}-state.json", self.prefix, self.operation))
    }

    pub fn lock(&self) -> PathBuf {
        self.work_dir.join(format!(".{}.lock", self.prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub request_id: String,
    pub version: String,
    pub delegate: String,
    pub phase: PhaseId,
    pub payload: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl BridgeRequest {
    pub fn new(phase: PhaseId, delegate: &str, payload: String) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION.to_string(),
            delegate: delegate.to_string(),
            phase,
            payload,
            context: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub request_id: String,
    pub version: String,
    pub status: ResponseStatus,
    /// Always a string; structured results are encoded by the worker and
    /// decoded by the consuming phase.
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl BridgeResponse {
    pub fn success(request_id: &str, payload: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Success,
            payload,
            error_kind: None,
            error_message: None,
            duration_seconds: None,
            created_at: Utc::now(),
        }
    }

    pub fn error(request_id: &str, kind: &str, message: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Error,
            payload: String::new(),
            error_kind: Some(kind.to_string()),
            error_message: Some(message.to_string()),
            duration_seconds: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }
}

/// The single request/response slot in a working directory.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeSlot {
    Empty,
    /// A request is waiting for the external worker
    Pending(BridgeRequest),
    /// A response is ready to be consumed on resume
    Ready(BridgeResponse),
}

impl BridgeSlot {
    pub fn is_ready(&self) -> bool {
        matches!(self, BridgeSlot::Ready(_))
    }
}

/// Lifecycle of one bridge within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    NotStarted,
    AwaitingExternalWorker,
    Resumed,
    Completed,
    Failed,
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgePhase::NotStarted => write!(f, "NOT_STARTED"),
            BridgePhase::AwaitingExternalWorker => write!(f, "AWAITING_EXTERNAL_WORKER"),
            BridgePhase::Resumed => write!(f, "RESUMED"),
            BridgePhase::Completed => write!(f, "COMPLETED"),
            BridgePhase::Failed => write!(f, "FAILED"),
        }
    }
}

/// What `invoke` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateReply {
    /// The delegate's response was on disk and has been consumed.
    Ready {
        payload: String,
        duration_seconds: Option<f64>,
    },
    /// The request is outstanding. `persisted` is false in dry-run.
    Suspended {
        request_id: String,
        request_path: PathBuf,
        persisted: bool,
    },
}

/// Out-of-process delegate calls.
pub trait DelegateBridge: Send + Sync {
    fn invoke(&self, request: BridgeRequest) -> Result<DelegateReply, BridgeError>;

    /// Non-destructive: true when a response file is waiting.
    fn has_response(&self) -> bool;

    /// Non-destructive view of the slot.
    fn slot(&self) -> Result<BridgeSlot, BridgeError>;

    /// Remove request and response files.
    fn clear(&self) -> Result<(), BridgeError>;

    fn phase(&self) -> BridgePhase;

    /// Called by the orchestrator once the run as a whole has finished.
    fn finish(&self, success: bool);
}

/// The file-backed bridge used by the CLI.
pub struct FileBridge {
    files: ProtocolFiles,
    dry_run: bool,
    state: Mutex<BridgePhase>,
    /// Request id whose response a dry run already read; the files stay on disk.
    consumed: Mutex<Option<String>>,
}

impl FileBridge {
    pub fn new(files: ProtocolFiles, dry_run: bool) -> Self {
        Self {
            files,
            dry_run,
            state: Mutex::new(BridgePhase::NotStarted),
            consumed: Mutex::new(None),
        }
    }

    pub fn files(&self) -> &ProtocolFiles {
        &self.files
    }

    fn set_phase(&self, phase: BridgePhase) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(from = %*state, to = %phase, "bridge transition");
        *state = phase;
    }

    /// Write a response for the outstanding request.
    pub fn respond(&self, response: &BridgeResponse) -> Result<PathBuf, BridgeError> {
        let path = self.files.response();
        write_json_atomic(&path, response)?;
        tracing::info!(request_id = %response.request_id, path = %path.display(), "response written");
        Ok(path)
    }

    fn consume(&self, request: &BridgeRequest) -> Result<DelegateReply, BridgeError> {
        let response_path = self.files.response();
        let response: BridgeResponse = read_json(&response_path)?;

        let request_path = self.files.request();
        if request_path.exists() {
            let outstanding: BridgeRequest = read_json(&request_path)?;
            if outstanding.request_id != response.request_id {
                return Err(StateCorruptionError {
                    path: response_path,
                    message: format!(
                        "response answers request {} but the outstanding request is {}",
                        response.request_id, outstanding.request_id
                    ),
                }
                .into());
            }
            if outstanding.phase != request.phase {
                return Err(StateCorruptionError {
                    path: request_path,
                    message: format!(
                        "outstanding request is for phase {} but phase {} is resuming",
                        outstanding.phase, request.phase
                    ),
                }
                .into());
            }
        }

        // Decoded cleanly; only now is it safe to drop the slot.
        if self.dry_run {
            *self.consumed.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(response.request_id.clone());
        } else {
            remove_if_exists(&request_path)?;
            remove_if_exists(&response_path)?;
        }
        self.set_phase(BridgePhase::Resumed);

        match response.status {
            ResponseStatus::Success => Ok(DelegateReply::Ready {
                payload: response.payload,
                duration_seconds: response.duration_seconds,
            }),
            ResponseStatus::Error => {
                self.set_phase(BridgePhase::Failed);
                Err(ExternalWorkerError {
                    delegate: request.delegate.clone(),
                    kind: response.error_kind.unwrap_or_else(|| "unknown".to_string()),
                    message: response
                        .error_message
                        .unwrap_or_else(|| "no error message provided".to_string()),
                }
                .into())
            }
        }
    }
}

impl DelegateBridge for FileBridge {
    fn invoke(&self, request: BridgeRequest) -> Result<DelegateReply, BridgeError> {
        if self.has_response() {
            tracing::info!(phase = %request.phase, delegate = %request.delegate, "consuming delegate response");
            return self.consume(&request);
        }

        let request_path = self.files.request();
        if self.dry_run {
            tracing::info!(phase = %request.phase, "dry run: request not written");
        } else {
            write_json_atomic(&request_path, &request)?;
            tracing::info!(
                phase = %request.phase,
                delegate = %request.delegate,
                path = %request_path.display(),
                "delegate request written"
            );
        }
        self.set_phase(BridgePhase::AwaitingExternalWorker);
        Ok(DelegateReply::Suspended {
            request_id: request.request_id,
            request_path,
            persisted: !self.dry_run,
        })
    }

    fn has_response(&self) -> bool {
        let path = self.files.response();
        if !path.is_file() {
            return false;
        }
        let consumed = self.consumed.lock().unwrap_or_else(|e| e.into_inner());
        match consumed.as_deref() {
            // A dry run leaves the answered slot in place; it is empty for later requests.
            Some(id) => match read_json::<BridgeResponse>(&path) {
                Ok(response) => response.request_id != id,
                Err(_) => true,
            },
            None => true,
        }
    }

    fn slot(&self) -> Result<BridgeSlot, BridgeError> {
        let response = self.files.response();
        if response.is_file() {
            return Ok(BridgeSlot::Ready(read_json(&response)?));
        }
        let request = self.files.request();
        if request.is_file() {
            return Ok(BridgeSlot::Pending(read_json(&request)?));
        }
        Ok(BridgeSlot::Empty)
    }

    fn clear(&self) -> Result<(), BridgeError> {
        if self.dry_run {
            return Ok(());
        }
        remove_if_exists(&self.files.request())?;
        remove_if_exists(&self.files.response())?;
        self.set_phase(BridgePhase::NotStarted);
        Ok(())
    }

    fn phase(&self) -> BridgePhase {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, success: bool) {
        self.set_phase(if success {
            BridgePhase::Completed
        } else {
            BridgePhase::Failed
        });
    }
}

/// Read and decode a protocol file. Decode failures are state corruption.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, BridgeError> {
    let content = fs::read_to_string(path).map_err(|source| BridgeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| {
        StateCorruptionError {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Write pretty JSON through a sibling temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BridgeError> {
    let io_err = |source| BridgeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io_err(std::io::Error::other(e)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), BridgeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BridgeError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
