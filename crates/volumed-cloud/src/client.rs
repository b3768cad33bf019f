use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use volumed_domain::{CloudSideState, HostId, VolumeId};

use crate::backend::{CloudBackend, JobId, JobStatus};
use crate::error::CloudError;

/// Polling and retry policy layered over a raw [`CloudBackend`] (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Result of a successfully landed attach, including the slot the cloud
/// provider actually used — which may differ from the one requested.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub cloud_device_id: String,
    pub landed_slot: u32,
}

/// Wraps a [`CloudBackend`] with retry on transient errors, bounded polling
/// of async jobs to completion, and the attach-as-root slot-0 retry policy.
pub struct CloudClient {
    backend: Arc<dyn CloudBackend>,
    policy: RetryPolicy,
}

impl CloudClient {
    pub fn new(backend: Arc<dyn CloudBackend>) -> Self {
        Self { backend, policy: RetryPolicy::default() }
    }

    pub fn with_policy(backend: Arc<dyn CloudBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    async fn retrying<F, Fut, T>(&self, op: &str, mut f: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CloudError>>,
    {
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(op, attempt, backoff_ms = backoff.as_millis() as u64, "retrying transient cloud error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll `query_job` until it reports a terminal state or `timeout` elapses.
    pub async fn await_job(&self, job_id: &JobId, timeout: Duration) -> Result<JobStatus, CloudError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.retrying("query_job", || self.backend.query_job(job_id)).await?;
            if status.is_done() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudError::Unavailable(format!("job {job_id} did not complete within {timeout:?}")));
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    pub async fn create_volume(&self, size_bytes: u64, pool: &str, name: &str) -> Result<JobId, CloudError> {
        self.retrying("create_volume", || self.backend.create_volume(size_bytes, pool, name)).await
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        self.retrying("delete_volume", || self.backend.delete_volume(volume_id)).await
    }

    pub async fn detach_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        self.retrying("detach_volume", || self.backend.detach_volume(volume_id)).await
    }

    pub async fn list_volumes_for_host(&self, host_id: &HostId) -> Result<Vec<(VolumeId, CloudSideState)>, CloudError> {
        self.retrying("list_volumes_for_host", || self.backend.list_volumes_for_host(host_id)).await
    }

    /// Attach, applying the attach-as-root slot-0 retry: when `as_root` is
    /// set, slot 0 (reserved for the instance's boot disk) is requested
    /// explicitly; if the provider's first attempt lands elsewhere, detach
    /// and retry instead of surfacing a root-disk collision to the caller.
    pub async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        host_id: &HostId,
        as_root: bool,
        timeout: Duration,
    ) -> Result<AttachOutcome, CloudError> {
        let mut next_slot_hint: Option<u32> = if as_root { Some(0) } else { None };
        for round in 0..self.policy.max_attempts {
            let job = self
                .retrying("attach_volume", || self.backend.attach_volume(volume_id, host_id, next_slot_hint))
                .await?;
            let status = self.await_job(&job, timeout).await?;
            let result = status.result.ok_or_else(|| CloudError::Unavailable("attach job succeeded with no result".into()))?;
            let slot = result["slot"].as_u64().unwrap_or(0) as u32;
            let cloud_device_id = result["cloud_device_id"].as_str().unwrap_or_default().to_string();
            if as_root && slot != 0 && round + 1 < self.policy.max_attempts {
                debug!(%volume_id, round, slot, "attach landed off slot 0 for a root attach, retrying on slot 0");
                self.retrying("detach_volume", || self.backend.detach_volume(volume_id)).await?;
                next_slot_hint = Some(0);
                continue;
            }
            return Ok(AttachOutcome { cloud_device_id, landed_slot: slot });
        }
        Err(CloudError::Conflict(format!("could not land slot 0 for {volume_id} after {} attempts", self.policy.max_attempts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCloudBackend;

    #[tokio::test]
    async fn attach_as_root_retries_onto_slot_zero() {
        let backend = Arc::new(LocalCloudBackend::new());
        let client = CloudClient::new(backend.clone());
        let job = client.create_volume(1024, "pool-a", "boot").await.unwrap();
        let status = client.await_job(&job, Duration::from_secs(1)).await.unwrap();
        let volume_id = VolumeId::new(status.result.unwrap()["volume_id"].as_str().unwrap().to_string());

        // First attempt lands off slot 0 despite being requested there; the
        // client must detach and retry until it lands on slot 0.
        backend.force_next_slot(1).await;
        let outcome = client.attach_volume(&volume_id, &HostId::new("h1"), true, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.landed_slot, 0);
    }

    #[tokio::test]
    async fn non_root_attach_accepts_slot_zero() {
        let backend = Arc::new(LocalCloudBackend::new());
        let client = CloudClient::new(backend.clone());
        let job = client.create_volume(1024, "pool-a", "data").await.unwrap();
        let status = client.await_job(&job, Duration::from_secs(1)).await.unwrap();
        let volume_id = VolumeId::new(status.result.unwrap()["volume_id"].as_str().unwrap().to_string());

        backend.force_next_slot(0).await;
        let outcome = client.attach_volume(&volume_id, &HostId::new("h1"), false, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.landed_slot, 0);
    }
}
