use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{HostId, VolumeId};

/// Cloud control-plane view of a volume's attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudSideState {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

impl std::fmt::Display for CloudSideState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloudSideState::Detached => "detached",
            CloudSideState::Attaching => "attaching",
            CloudSideState::Attached => "attached",
            CloudSideState::Detaching => "detaching",
        };
        write!(f, "{s}")
    }
}

/// Host-observed presence of the backing block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSideState {
    Absent,
    Present,
}

impl std::fmt::Display for HostSideState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostSideState::Absent => "absent",
            HostSideState::Present => "present",
        };
        write!(f, "{s}")
    }
}

/// The binding between a cloud volume and a host device node (§3).
///
/// Invariant: `host_side == Present` implies `device_path` is non-empty.
/// Enforced by [`DeviceMapping::new_present`]/[`DeviceMapping::mark_absent`],
/// never by deserialization alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub volume_id: VolumeId,
    pub host_id: HostId,
    pub device_path: String,
    pub cloud_side: CloudSideState,
    pub host_side: HostSideState,
    pub size_bytes: u64,
    pub last_sync_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeviceMapping {
    pub fn new_present(
        volume_id: VolumeId,
        host_id: HostId,
        device_path: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            volume_id,
            host_id,
            device_path: device_path.into(),
            cloud_side: CloudSideState::Attached,
            host_side: HostSideState::Present,
            size_bytes,
            last_sync_at: now,
            created_at: now,
        }
    }

    pub fn mark_absent(&mut self) {
        self.host_side = HostSideState::Absent;
        self.device_path.clear();
        self.last_sync_at = Utc::now();
    }

    pub fn mark_synced(&mut self) {
        self.last_sync_at = Utc::now();
    }

    pub fn is_consistent(&self) -> bool {
        match self.host_side {
            HostSideState::Present => !self.device_path.is_empty(),
            HostSideState::Absent => true,
        }
    }
}

/// Returns `true` if `actual` is within ±1% of `expected` (§4.3 matching rule, §8 property).
pub fn size_within_tolerance(expected: u64, actual: u64, tolerance_pct: f64) -> bool {
    if expected == 0 {
        return actual == 0;
    }
    let expected = expected as f64;
    let actual = actual as f64;
    let diff = (expected - actual).abs();
    diff <= expected * (tolerance_pct / 100.0)
}
