use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OperationId, VolumeId};
use crate::operation::{OperationError, OperationKind};

/// Append-only record of an admission, phase transition, or reconcile repair (§3, §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    OperationAdmitted {
        operation_id: OperationId,
        volume_id: VolumeId,
        kind: OperationKind,
        occurred_at: DateTime<Utc>,
    },
    OperationCompleted {
        operation_id: OperationId,
        volume_id: VolumeId,
        occurred_at: DateTime<Utc>,
    },
    OperationFailed {
        operation_id: OperationId,
        volume_id: VolumeId,
        error: OperationError,
        occurred_at: DateTime<Utc>,
    },
    ReconcileStarted {
        occurred_at: DateTime<Utc>,
    },
    ReconcileRepaired {
        volume_id: VolumeId,
        detail: String,
        occurred_at: DateTime<Utc>,
    },
    ReconcileCompleted {
        repairs: usize,
        occurred_at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn volume_id(&self) -> Option<&VolumeId> {
        match self {
            AuditEvent::OperationAdmitted { volume_id, .. }
            | AuditEvent::OperationCompleted { volume_id, .. }
            | AuditEvent::OperationFailed { volume_id, .. }
            | AuditEvent::ReconcileRepaired { volume_id, .. } => Some(volume_id),
            AuditEvent::ReconcileStarted { .. } | AuditEvent::ReconcileCompleted { .. } => None,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::OperationAdmitted { occurred_at, .. }
            | AuditEvent::OperationCompleted { occurred_at, .. }
            | AuditEvent::OperationFailed { occurred_at, .. }
            | AuditEvent::ReconcileStarted { occurred_at, .. }
            | AuditEvent::ReconcileRepaired { occurred_at, .. }
            | AuditEvent::ReconcileCompleted { occurred_at, .. } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_scoped_events_report_their_volume() {
        let ev = AuditEvent::OperationAdmitted {
            operation_id: OperationId::new(),
            volume_id: VolumeId::new("vol-a"),
            kind: OperationKind::Attach,
            occurred_at: Utc::now(),
        };
        assert_eq!(ev.volume_id(), Some(&VolumeId::new("vol-a")));
    }

    #[test]
    fn reconcile_events_have_no_volume() {
        let ev = AuditEvent::ReconcileStarted { occurred_at: Utc::now() };
        assert_eq!(ev.volume_id(), None);
    }
}
