use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    Add,
    Remove,
}

/// A single block-device appearance/disappearance, as seen by the monitor's
/// enumeration loop (a stand-in for a kernel uevent in this deployment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device_path: String,
    pub size_bytes: u64,
    pub observed_at: DateTime<Utc>,
}
