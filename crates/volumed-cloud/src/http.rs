use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use volumed_domain::{CloudSideState, HostId, VolumeId};

use crate::backend::{CloudBackend, JobId, JobState, JobStatus};
use crate::error::CloudError;

/// [`CloudBackend`] backed by a JSON/HTTP provider API, reached with a
/// bearer-token-authenticated [`reqwest::Client`].
pub struct HttpCloudBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpCloudBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), token: token.into() }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, CloudError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        debug!(url, "cloud provider POST");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| CloudError::Unavailable(format!("POST {url}: {e}")))?;
        Self::decode(resp).await
    }

    async fn get(&self, path: &str) -> Result<Value, CloudError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CloudError::Unavailable(format!("GET {url}: {e}")))?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> Result<Value, CloudError> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(body["message"].as_str().unwrap_or("not found").to_string()));
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(CloudError::Conflict(body["message"].as_str().unwrap_or("conflict").to_string()));
        }
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CloudError::PermissionDenied(body["message"].as_str().unwrap_or("forbidden").to_string()));
        }
        if status.is_server_error() {
            return Err(CloudError::Unavailable(format!("provider returned {status}")));
        }
        if !status.is_success() {
            return Err(CloudError::Unavailable(format!(
                "provider returned {status}: {}",
                body["message"].as_str().unwrap_or("unknown error")
            )));
        }
        Ok(body)
    }

    fn parse_job(body: &Value) -> Result<JobId, CloudError> {
        body["job_id"]
            .as_str()
            .map(|s| JobId(s.to_string()))
            .ok_or_else(|| CloudError::Unavailable("provider response missing job_id".into()))
    }
}

#[async_trait]
impl CloudBackend for HttpCloudBackend {
    async fn create_volume(&self, size_bytes: u64, pool: &str, name: &str) -> Result<JobId, CloudError> {
        let body = self.post("/volumes", &json!({ "size_bytes": size_bytes, "pool": pool, "name": name })).await?;
        Self::parse_job(&body)
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        let body = self.post(&format!("/volumes/{}/delete", volume_id.as_str()), &json!({})).await?;
        Self::parse_job(&body)
    }

    async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        host_id: &HostId,
        device_slot: Option<u32>,
    ) -> Result<JobId, CloudError> {
        let body = self
            .post(
                &format!("/volumes/{}/attach", volume_id.as_str()),
                &json!({ "host_id": host_id.as_str(), "device_slot": device_slot }),
            )
            .await?;
        Self::parse_job(&body)
    }

    async fn detach_volume(&self, volume_id: &VolumeId) -> Result<JobId, CloudError> {
        let body = self.post(&format!("/volumes/{}/detach", volume_id.as_str()), &json!({})).await?;
        Self::parse_job(&body)
    }

    async fn query_job(&self, job_id: &JobId) -> Result<JobStatus, CloudError> {
        let body = self.get(&format!("/jobs/{job_id}")).await?;
        let state = match body["state"].as_str().unwrap_or("") {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            other => return Err(CloudError::Unavailable(format!("unknown job state {other:?}"))),
        };
        Ok(JobStatus {
            state,
            result: body.get("result").cloned(),
            error: body.get("error").and_then(|e| e.as_str()).map(str::to_string),
        })
    }

    async fn list_volumes_for_host(&self, host_id: &HostId) -> Result<Vec<(VolumeId, CloudSideState)>, CloudError> {
        let body = self.get(&format!("/hosts/{}/volumes", host_id.as_str())).await?;
        let entries = body.as_array().cloned().unwrap_or_default();
        entries
            .into_iter()
            .map(|entry| {
                let volume_id = entry["volume_id"]
                    .as_str()
                    .map(VolumeId::new)
                    .ok_or_else(|| CloudError::Unavailable("volume entry missing volume_id".into()))?;
                let state = match entry["state"].as_str().unwrap_or("") {
                    "detached" => CloudSideState::Detached,
                    "attaching" => CloudSideState::Attaching,
                    "attached" => CloudSideState::Attached,
                    "detaching" => CloudSideState::Detaching,
                    other => return Err(CloudError::Unavailable(format!("unknown cloud state {other:?}"))),
                };
                Ok((volume_id, state))
            })
            .collect()
    }
}
