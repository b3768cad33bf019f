use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExportName, VolumeId};

/// A named entry in the NBD server configuration pointing at a host device (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Active,
    Removed,
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExportStatus::Active => "active",
            ExportStatus::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdExport {
    pub name: ExportName,
    pub volume_id: VolumeId,
    pub device_path: String,
    pub port: u16,
    pub status: ExportStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NbdExport {
    pub fn new(volume_id: VolumeId, device_path: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            name: export_name_for(&volume_id),
            volume_id,
            device_path: device_path.into(),
            port,
            status: ExportStatus::Active,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_device_path(&mut self, device_path: impl Into<String>) {
        self.device_path = device_path.into();
        self.updated_at = Utc::now();
    }

    pub fn mark_removed(&mut self) {
        self.status = ExportStatus::Removed;
        self.updated_at = Utc::now();
    }
}

/// Deterministic export name for a volume id: `migration-vol-<volume-id>` (§3).
pub fn export_name_for(volume_id: &VolumeId) -> ExportName {
    ExportName(format!("migration-vol-{}", volume_id.as_str()))
}
