use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use volumed_domain::{CloudSideState, HostId, VolumeId};

use crate::error::CloudError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Present on success — e.g. `{"volume_id": "vol-a"}` for a create job,
    /// `{"cloud_device_id": "...", "slot": 0}` for an attach job.
    pub result: Option<serde_json::Value>,
    /// Present when `state == Failed`.
    pub error: Option<String>,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        matches!(self.state, JobState::Succeeded | JobState::Failed)
    }
}

/// The raw, unretried transport to the cloud provider (§4.2 table). A
/// [`crate::CloudClient`] wraps one of these with retry, polling, and the
/// attach-as-root slot-0 policy.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn create_volume(&self, size_bytes: u64, pool: &str, name: &str) -> Result<JobId, CloudError>;
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError>;
    async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        host_id: &HostId,
        device_slot: Option<u32>,
    ) -> Result<JobId, CloudError>;
    async fn detach_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError>;
    async fn query_job(&self, job_id: &JobId) -> Result<JobStatus, CloudError>;
    async fn list_volumes_for_host(&self, host_id: &HostId) -> Result<Vec<(VolumeId, CloudSideState)>, CloudError>;
}
