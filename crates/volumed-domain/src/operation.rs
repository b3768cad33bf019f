use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{HostId, OperationId, VolumeId};

/// The kind of work a [`VolumeOperation`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Delete,
    Attach,
    Detach,
    AttachAsRoot,
    Reattach,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::Delete => "delete",
            OperationKind::Attach => "attach",
            OperationKind::Detach => "detach",
            OperationKind::AttachAsRoot => "attach-as-root",
            OperationKind::Reattach => "reattach",
        };
        write!(f, "{s}")
    }
}

impl OperationKind {
    /// Attach-family kinds correlate an add-event; detach-family a remove-event.
    pub fn needs_device_correlation(self) -> bool {
        matches!(
            self,
            OperationKind::Attach | OperationKind::AttachAsRoot | OperationKind::Detach | OperationKind::Reattach
        )
    }
}

/// `pending → executing → {completed, failed, cancelled}`. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// The phase an operation was in when it failed or timed out. Carried on
/// [`OperationError`] so a caller can tell which step needs retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Admit,
    Execute,
    Correlate,
    PersistOutcome,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Admit => "admit",
            Phase::Execute => "execute",
            Phase::Correlate => "correlate",
            Phase::PersistOutcome => "persist_outcome",
        };
        write!(f, "{s}")
    }
}

/// The distinct error kinds of §7 — each implies different recovery semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    CloudJobFailed,
    CorrelationTimeout,
    InvariantViolation,
    ConfigDrift,
    NotFound,
    PermissionDenied,
    DaemonRestart,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::CloudJobFailed => "cloud-job-failed",
            ErrorKind::CorrelationTimeout => "correlation-timeout",
            ErrorKind::InvariantViolation => "invariant-violation",
            ErrorKind::ConfigDrift => "config-drift",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::DaemonRestart => "daemon-restart",
        };
        write!(f, "{s}")
    }
}

/// Structured failure attached to a terminal (or about-to-be-terminal) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self { kind, phase, message: message.into() }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} during {}: {}", self.kind, self.phase, self.message)
    }
}

/// A unit of work requested from the daemon (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub volume_id: VolumeId,
    pub host_id: Option<HostId>,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<OperationError>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VolumeOperation {
    pub fn new(kind: OperationKind, volume_id: VolumeId, host_id: Option<HostId>, request: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            kind,
            volume_id,
            host_id,
            request,
            response: None,
            error: None,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn mark_executing(&mut self) {
        self.status = OperationStatus::Executing;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, response: serde_json::Value) {
        self.status = OperationStatus::Completed;
        self.response = Some(response);
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: OperationError) {
        self.status = OperationStatus::Failed;
        self.error = Some(error);
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OperationStatus::Cancelled;
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}
