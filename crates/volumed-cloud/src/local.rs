use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use volumed_domain::{CloudSideState, HostId, VolumeId};

use crate::backend::{CloudBackend, JobId, JobState, JobStatus};
use crate::error::CloudError;

struct Volume {
    host: Option<HostId>,
    state: CloudSideState,
}

/// In-memory [`CloudBackend`] that completes every job immediately. Used by
/// tests and by a `--cloud=local` development deployment, the same role a
/// local/fake driver plays against any other external collaborator.
#[derive(Clone, Default)]
pub struct LocalCloudBackend {
    volumes: Arc<RwLock<HashMap<VolumeId, Volume>>>,
    jobs: Arc<RwLock<HashMap<JobId, JobStatus>>>,
    counter: Arc<AtomicU64>,
    forced_slot: Arc<RwLock<Option<u32>>>,
}

impl LocalCloudBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the next `attach_volume` call to land on a non-zero slot, to
    /// exercise the attach-as-root retry policy in tests.
    pub async fn force_next_slot(&self, slot: u32) {
        *self.forced_slot.write().await = Some(slot);
    }

    async fn record_job(&self, prefix: &str, result: Option<serde_json::Value>) -> JobId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let job = JobId(format!("job-{prefix}-{n}"));
        self.jobs.write().await.insert(job.clone(), JobStatus { state: JobState::Succeeded, result, error: None });
        job
    }
}

#[async_trait]
impl CloudBackend for LocalCloudBackend {
    async fn create_volume(&self, _size_bytes: u64, _pool: &str, name: &str) -> Result<JobId, CloudError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let volume_id = VolumeId::new(format!("vol-{name}-{n}"));
        self.volumes.write().await.insert(volume_id.clone(), Volume { host: None, state: CloudSideState::Detached });
        Ok(self.record_job("create", Some(serde_json::json!({ "volume_id": volume_id.as_str() }))).await)
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        if self.volumes.write().await.remove(volume_id).is_none() {
            return Err(CloudError::NotFound(format!("volume {volume_id} not found")));
        }
        Ok(self.record_job("delete", None).await)
    }

    async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        host_id: &HostId,
        device_slot: Option<u32>,
    ) -> Result<JobId, CloudError> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes.get_mut(volume_id).ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        if volume.host.is_some() {
            return Err(CloudError::Conflict(format!("volume {volume_id} already attached")));
        }
        let forced = self.forced_slot.write().await.take();
        let landed_slot = forced.unwrap_or_else(|| device_slot.unwrap_or(1));
        volume.host = Some(host_id.clone());
        volume.state = CloudSideState::Attached;
        Ok(self
            .record_job(
                "attach",
                Some(serde_json::json!({ "cloud_device_id": format!("cd-{}", volume_id.as_str()), "slot": landed_slot })),
            )
            .await)
    }

    async fn detach_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes.get_mut(volume_id).ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        volume.host = None;
        volume.state = CloudSideState::Detached;
        Ok(self.record_job("detach", None).await)
    }

    async fn query_job(&self, job_id: &JobId) -> Result<JobStatus, CloudError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("job {job_id} not found")))
    }

    async fn list_volumes_for_host(&self, host_id: &HostId) -> Result<Vec<(VolumeId, CloudSideState)>, CloudError> {
        let volumes = self.volumes.read().await;
        Ok(volumes
            .iter()
            .filter(|(_, v)| v.host.as_ref() == Some(host_id))
            .map(|(id, v)| (id.clone(), v.state))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_query_job_returns_volume_id() {
        let backend = LocalCloudBackend::new();
        let job = backend.create_volume(1024, "pool-a", "v1").await.unwrap();
        let status = backend.query_job(&job).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert!(status.result.unwrap()["volume_id"].as_str().unwrap().starts_with("vol-v1-"));
    }

    #[tokio::test]
    async fn attach_twice_conflicts() {
        let backend = LocalCloudBackend::new();
        let job = backend.create_volume(1024, "pool-a", "v1").await.unwrap();
        let volume_id = VolumeId::new(
            backend.query_job(&job).await.unwrap().result.unwrap()["volume_id"].as_str().unwrap().to_string(),
        );
        backend.attach_volume(&volume_id, &HostId::new("h1"), None).await.unwrap();
        let err = backend.attach_volume(&volume_id, &HostId::new("h2"), None).await.unwrap_err();
        assert!(matches!(err, CloudError::Conflict(_)));
    }

    #[tokio::test]
    async fn forced_slot_drives_attach_as_root_retry() {
        let backend = LocalCloudBackend::new();
        let job = backend.create_volume(1024, "pool-a", "boot").await.unwrap();
        let volume_id = VolumeId::new(
            backend.query_job(&job).await.unwrap().result.unwrap()["volume_id"].as_str().unwrap().to_string(),
        );
        backend.force_next_slot(2).await;
        let job = backend.attach_volume(&volume_id, &HostId::new("h1"), Some(0)).await.unwrap();
        let status = backend.query_job(&job).await.unwrap();
        assert_eq!(status.result.unwrap()["slot"].as_u64().unwrap(), 2);
    }
}
