use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};
use volumed_cloud::{CloudClient, CloudError, JobState};
use volumed_devices::DeviceCorrelator;
use volumed_domain::{
    AuditEvent, DeviceMapping, ErrorKind, HostId, OperationError, OperationKind, Phase, VolumeId,
    VolumeOperation,
};
use volumed_nbd::NbdExportManager;
use volumed_store::{ExportWrite, MappingWrite, OperationOutcome, StateStore};

use crate::error::EngineError;
use crate::lock::VolumeLocks;

/// Bounds distinct from the cloud client's own retry/poll policy: how long
/// the engine waits for a cloud call's job to finish, and how long it waits
/// for the Device Monitor to correlate an add/remove event.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    pub cloud_call: Duration,
    pub correlation_window: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self { cloud_call: Duration::from_secs(30), correlation_window: Duration::from_secs(60) }
    }
}

/// The Operation Engine: the only writer of operations, device mappings, and
/// NBD exports. Each public method runs one operation kind through
/// admit → persist-pending → execute → correlate → persist-outcome, holding
/// the volume's lock for the duration so no two operations on the same
/// volume overlap.
pub struct OperationEngine {
    store: Arc<dyn StateStore>,
    cloud: Arc<CloudClient>,
    devices: Arc<dyn DeviceCorrelator>,
    nbd: Arc<NbdExportManager>,
    locks: VolumeLocks,
    timeouts: EngineTimeouts,
    nbd_port: u16,
}

impl OperationEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        cloud: Arc<CloudClient>,
        devices: Arc<dyn DeviceCorrelator>,
        nbd: Arc<NbdExportManager>,
        timeouts: EngineTimeouts,
        nbd_port: u16,
    ) -> Self {
        Self { store, cloud, devices, nbd, locks: VolumeLocks::new(), timeouts, nbd_port }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The expected device size for an attach/reattach is never part of the
    /// request body (§6 lists only `{host-id}`) — it is recovered from the
    /// volume's own create operation, the one place its size was ever
    /// recorded.
    async fn resolve_expected_size(&self, volume_id: &VolumeId) -> Result<u64, EngineError> {
        let mut history = self.store.list_operations(Some(volume_id), None).await?;
        history.sort_by_key(|op| op.created_at);
        history
            .iter()
            .rev()
            .find_map(|op| {
                op.request
                    .get("size_bytes")
                    .and_then(|v| v.as_u64())
                    .or_else(|| op.request.get("expected_size_bytes").and_then(|v| v.as_u64()))
            })
            .ok_or_else(|| EngineError::NotFound(volume_id.clone()))
    }

    async fn admit(
        &self,
        volume_id: VolumeId,
        kind: OperationKind,
        host_id: Option<HostId>,
        request: serde_json::Value,
    ) -> Result<VolumeOperation, EngineError> {
        if let Some(existing) = self.store.get_operation_for_volume(&volume_id).await? {
            if !existing.status.is_terminal() {
                return Err(EngineError::AlreadyInProgress(volume_id));
            }
        }
        let op = VolumeOperation::new(kind, volume_id.clone(), host_id, request);
        self.store.insert_operation(&op).await?;
        self.store
            .append_event(AuditEvent::OperationAdmitted {
                operation_id: op.id,
                volume_id: volume_id.clone(),
                kind,
                occurred_at: op.created_at,
            })
            .await?;
        info!(%volume_id, %kind, operation_id = %op.id, "operation admitted");
        Ok(op)
    }

    async fn fail(
        &self,
        op: &mut VolumeOperation,
        kind: ErrorKind,
        phase: Phase,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        let message = message.into();
        op.mark_failed(OperationError::new(kind, phase, message.clone()));
        self.store.apply_outcome(&OperationOutcome::operation_only(op.clone())).await?;
        self.store
            .append_event(AuditEvent::OperationFailed {
                operation_id: op.id,
                volume_id: op.volume_id.clone(),
                error: op.error.clone().expect("just set by mark_failed"),
                occurred_at: op.updated_at,
            })
            .await?;
        warn!(volume_id = %op.volume_id, operation_id = %op.id, %kind, %phase, %message, "operation failed");
        Ok(())
    }

    async fn complete(
        &self,
        op: &mut VolumeOperation,
        response: serde_json::Value,
        mapping: MappingWrite,
        export: ExportWrite,
    ) -> Result<(), EngineError> {
        op.mark_completed(response);
        self.store.apply_outcome(&OperationOutcome { operation: op.clone(), mapping, export }).await?;
        self.store
            .append_event(AuditEvent::OperationCompleted {
                operation_id: op.id,
                volume_id: op.volume_id.clone(),
                occurred_at: op.updated_at,
            })
            .await?;
        info!(volume_id = %op.volume_id, operation_id = %op.id, "operation completed");
        Ok(())
    }

    fn classify(err: &CloudError) -> ErrorKind {
        match err {
            CloudError::Unavailable(_) => ErrorKind::Transport,
            CloudError::NotFound(_) => ErrorKind::NotFound,
            CloudError::Conflict(_) => ErrorKind::InvariantViolation,
            CloudError::PermissionDenied(_) => ErrorKind::PermissionDenied,
        }
    }

    /// Poll the Device Monitor until `device_path` drops out of its
    /// known-device set, or `timeout` elapses. Mirror image of
    /// [`DeviceMonitor::match_new_device`], used for detach/reattach
    /// correlation where the engine waits for absence rather than a new
    /// appearance.
    async fn wait_for_removal(&self, device_path: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.devices.is_present(device_path).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Create a cloud volume. There is no pre-existing volume id to
    /// serialize a create against, so the caller-chosen `name` stands in as
    /// the admission key until the cloud call returns; once it does, the
    /// operation's `volume_id` is rewritten to whatever id the provider
    /// actually assigned (which may differ from `name`), so every
    /// subsequent lookup and lock acquisition for this volume uses the
    /// authoritative id.
    pub async fn create_volume(&self, size_bytes: u64, pool: &str, name: &str) -> Result<VolumeOperation, EngineError> {
        let volume_id = VolumeId::new(name);
        let _guard = self.locks.acquire(&volume_id).await;
        let mut op = self
            .admit(volume_id.clone(), OperationKind::Create, None, json!({"size_bytes": size_bytes, "pool": pool, "name": name}))
            .await?;
        op.mark_executing();
        self.store.update_operation(&op).await?;

        match self.cloud.create_volume(size_bytes, pool, name).await {
            Ok(job_id) => match self.cloud.await_job(&job_id, self.timeouts.cloud_call).await {
                Ok(status) if status.state == JobState::Succeeded => {
                    let response = status.result.unwrap_or_else(|| json!({"volume_id": name}));
                    if let Some(assigned_id) = response.get("volume_id").and_then(|v| v.as_str()) {
                        op.volume_id = VolumeId::new(assigned_id.to_string());
                    }
                    self.complete(&mut op, response, MappingWrite::None, ExportWrite::None).await?;
                }
                Ok(status) => {
                    self.fail(&mut op, ErrorKind::CloudJobFailed, Phase::Execute, status.error.unwrap_or_else(|| "create job failed".into())).await?;
                }
                Err(e) => {
                    self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
                }
            },
            Err(e) => {
                self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
            }
        }
        Ok(op)
    }

    /// Refuses to run while the volume has an active mapping — the caller
    /// must detach first.
    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<VolumeOperation, EngineError> {
        let _guard = self.locks.acquire(volume_id).await;
        if self.store.get_mapping(volume_id).await?.is_some() {
            return Err(EngineError::HasActiveMapping(volume_id.clone()));
        }
        let mut op = self.admit(volume_id.clone(), OperationKind::Delete, None, json!({})).await?;
        op.mark_executing();
        self.store.update_operation(&op).await?;

        match self.cloud.delete_volume(volume_id).await {
            Ok(job_id) => match self.cloud.await_job(&job_id, self.timeouts.cloud_call).await {
                Ok(status) if status.state == JobState::Succeeded => {
                    self.complete(&mut op, json!({}), MappingWrite::None, ExportWrite::None).await?;
                }
                Ok(status) => {
                    self.fail(&mut op, ErrorKind::CloudJobFailed, Phase::Execute, status.error.unwrap_or_else(|| "delete job failed".into())).await?;
                }
                Err(e) => {
                    self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
                }
            },
            Err(e) => {
                self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
            }
        }
        Ok(op)
    }

    async fn attach_internal(
        &self,
        volume_id: &VolumeId,
        host_id: &HostId,
        as_root: bool,
    ) -> Result<VolumeOperation, EngineError> {
        let _guard = self.locks.acquire(volume_id).await;
        let expected_size_bytes = self.resolve_expected_size(volume_id).await?;
        let port = self.nbd_port;
        let kind = if as_root { OperationKind::AttachAsRoot } else { OperationKind::Attach };
        let mut op = self
            .admit(volume_id.clone(), kind, Some(host_id.clone()), json!({"host_id": host_id.as_str(), "expected_size_bytes": expected_size_bytes}))
            .await?;
        op.mark_executing();
        self.store.update_operation(&op).await?;
        let since = op.created_at;

        let outcome = match self.cloud.attach_volume(volume_id, host_id, as_root, self.timeouts.cloud_call).await {
            Ok(o) => o,
            Err(e) => {
                self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
                return Ok(op);
            }
        };

        let excluded: Vec<String> =
            self.store.list_mappings().await?.into_iter().map(|m| m.device_path).filter(|p| !p.is_empty()).collect();
        let device_path = match self.devices.match_new_device(expected_size_bytes, since, &excluded, self.timeouts.correlation_window).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                self.fail(
                    &mut op,
                    ErrorKind::CorrelationTimeout,
                    Phase::Correlate,
                    format!("no block device matched within {:?}", self.timeouts.correlation_window),
                )
                .await?;
                return Ok(op);
            }
            Err(e) => {
                self.fail(&mut op, ErrorKind::Transport, Phase::Correlate, e.to_string()).await?;
                return Ok(op);
            }
        };

        let export = match self.nbd.create_export(volume_id, &device_path, port).await {
            Ok(export) => export,
            Err(e) => {
                self.fail(&mut op, ErrorKind::ConfigDrift, Phase::PersistOutcome, e.to_string()).await?;
                return Ok(op);
            }
        };

        let mapping = DeviceMapping::new_present(volume_id.clone(), host_id.clone(), device_path.clone(), expected_size_bytes);
        let response = json!({"device_path": device_path, "cloud_device_id": outcome.cloud_device_id, "slot": outcome.landed_slot});
        self.complete(&mut op, response, MappingWrite::Upsert(mapping), ExportWrite::Upsert(export)).await?;
        Ok(op)
    }

    pub async fn attach_volume(&self, volume_id: &VolumeId, host_id: &HostId) -> Result<VolumeOperation, EngineError> {
        self.attach_internal(volume_id, host_id, false).await
    }

    /// The boot-disk special case: the cloud client is responsible for
    /// landing the attach on slot 0, retrying on the daemon's behalf if the
    /// provider's first attempt lands elsewhere.
    pub async fn attach_volume_as_root(&self, volume_id: &VolumeId, host_id: &HostId) -> Result<VolumeOperation, EngineError> {
        self.attach_internal(volume_id, host_id, true).await
    }

    /// Stops serving the NBD export before telling the cloud to detach, so no
    /// client sees I/O errors against a device that is about to vanish out
    /// from under an export still advertising it; the cloud detach and
    /// device-disappearance follow, and the store write happens last and
    /// atomically as with every other operation.
    pub async fn detach_volume(&self, volume_id: &VolumeId) -> Result<VolumeOperation, EngineError> {
        let _guard = self.locks.acquire(volume_id).await;
        let mapping = self.store.get_mapping(volume_id).await?.ok_or_else(|| EngineError::NotFound(volume_id.clone()))?;
        let mut op = self.admit(volume_id.clone(), OperationKind::Detach, Some(mapping.host_id.clone()), json!({})).await?;
        op.mark_executing();
        self.store.update_operation(&op).await?;

        let existing_export = self.store.get_export(volume_id).await?;
        if let Some(export) = existing_export.clone() {
            if let Err(e) = self.nbd.remove_export(export).await {
                self.fail(&mut op, ErrorKind::ConfigDrift, Phase::Execute, e.to_string()).await?;
                return Ok(op);
            }
        }

        if let Err(e) = self.cloud.detach_volume(volume_id).await {
            self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
            return Ok(op);
        }

        if !self.wait_for_removal(&mapping.device_path, self.timeouts.correlation_window).await {
            self.fail(
                &mut op,
                ErrorKind::CorrelationTimeout,
                Phase::Correlate,
                format!("device {} still present {:?} after detach", mapping.device_path, self.timeouts.correlation_window),
            )
            .await?;
            return Ok(op);
        }

        let export_write = if existing_export.is_some() { ExportWrite::Delete(volume_id.clone()) } else { ExportWrite::None };
        self.complete(&mut op, json!({}), MappingWrite::Delete(volume_id.clone()), export_write).await?;
        Ok(op)
    }

    /// Detach from the current host and attach to `new_host_id` as one
    /// compound operation. Each half persists nothing until it completes, so
    /// a failure after the detach half leaves the store pointing at the old
    /// (now stale) mapping rather than inventing a half-attached state —
    /// reconciliation is what closes that gap, the same as any other
    /// mid-flight failure.
    pub async fn reattach_volume(&self, volume_id: &VolumeId, new_host_id: &HostId) -> Result<VolumeOperation, EngineError> {
        let _guard = self.locks.acquire(volume_id).await;
        let mapping = self.store.get_mapping(volume_id).await?.ok_or_else(|| EngineError::NotFound(volume_id.clone()))?;
        let expected_size_bytes = self.resolve_expected_size(volume_id).await?;
        let port = self.nbd_port;
        let mut op = self
            .admit(volume_id.clone(), OperationKind::Reattach, Some(new_host_id.clone()), json!({"new_host_id": new_host_id.as_str(), "expected_size_bytes": expected_size_bytes}))
            .await?;
        op.mark_executing();
        self.store.update_operation(&op).await?;
        let since = op.created_at;

        if let Err(e) = self.cloud.detach_volume(volume_id).await {
            self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
            return Ok(op);
        }
        if !self.wait_for_removal(&mapping.device_path, self.timeouts.correlation_window).await {
            self.fail(&mut op, ErrorKind::CorrelationTimeout, Phase::Correlate, "source device did not disappear after detach").await?;
            return Ok(op);
        }

        let outcome = match self.cloud.attach_volume(volume_id, new_host_id, false, self.timeouts.cloud_call).await {
            Ok(o) => o,
            Err(e) => {
                self.fail(&mut op, Self::classify(&e), Phase::Execute, e.to_string()).await?;
                return Ok(op);
            }
        };

        let excluded: Vec<String> =
            self.store.list_mappings().await?.into_iter().map(|m| m.device_path).filter(|p| !p.is_empty()).collect();
        let device_path = match self.devices.match_new_device(expected_size_bytes, since, &excluded, self.timeouts.correlation_window).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                self.fail(&mut op, ErrorKind::CorrelationTimeout, Phase::Correlate, "no block device matched on the destination host").await?;
                return Ok(op);
            }
            Err(e) => {
                self.fail(&mut op, ErrorKind::Transport, Phase::Correlate, e.to_string()).await?;
                return Ok(op);
            }
        };

        let export = match self.store.get_export(volume_id).await? {
            Some(existing) => self.nbd.update_export(existing, &device_path).await,
            None => self.nbd.create_export(volume_id, &device_path, port).await,
        };
        let export = match export {
            Ok(export) => export,
            Err(e) => {
                self.fail(&mut op, ErrorKind::ConfigDrift, Phase::PersistOutcome, e.to_string()).await?;
                return Ok(op);
            }
        };

        let new_mapping = DeviceMapping::new_present(volume_id.clone(), new_host_id.clone(), device_path.clone(), expected_size_bytes);
        let response = json!({"device_path": device_path, "cloud_device_id": outcome.cloud_device_id});
        self.complete(&mut op, response, MappingWrite::Upsert(new_mapping), ExportWrite::Upsert(export)).await?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use nix::sys::signal::Signal;
    use volumed_cloud::{CloudBackend, LocalCloudBackend};
    use volumed_devices::DeviceError;
    use volumed_domain::OperationStatus;
    use volumed_nbd::ServerLocator;
    use volumed_store::InMemoryStore;

    use super::*;

    /// A hermetic stand-in for the Device Monitor: devices only appear or
    /// disappear when the test says so, never by polling real host disks.
    #[derive(Default)]
    struct FakeCorrelator {
        devices: Mutex<HashMap<String, u64>>,
    }

    impl FakeCorrelator {
        fn new() -> Self {
            Self::default()
        }

        fn insert(&self, path: &str, size_bytes: u64) {
            self.devices.lock().unwrap().insert(path.to_string(), size_bytes);
        }

        fn remove(&self, path: &str) {
            self.devices.lock().unwrap().remove(path);
        }
    }

    #[async_trait::async_trait]
    impl DeviceCorrelator for FakeCorrelator {
        async fn match_new_device(
            &self,
            expected_size: u64,
            _since: DateTime<Utc>,
            excluded: &[String],
            _timeout: Duration,
        ) -> Result<Option<String>, DeviceError> {
            let devices = self.devices.lock().unwrap();
            let mut candidates: Vec<&String> = devices
                .iter()
                .filter(|(path, size)| !excluded.iter().any(|p| p == *path) && volumed_domain::size_within_tolerance(expected_size, **size, 1.0))
                .map(|(path, _)| path)
                .collect();
            candidates.sort();
            Ok(candidates.first().map(|p| p.to_string()))
        }

        async fn is_present(&self, device_path: &str) -> bool {
            self.devices.lock().unwrap().contains_key(device_path)
        }
    }

    fn test_engine(store: Arc<dyn StateStore>, devices: Arc<FakeCorrelator>, dir: &std::path::Path) -> OperationEngine {
        let backend: Arc<dyn CloudBackend> = Arc::new(LocalCloudBackend::new());
        let cloud = Arc::new(CloudClient::new(backend));
        let nbd = Arc::new(NbdExportManager::new(
            dir.join("exports.conf"),
            ServerLocator::ProcessName("nbd-server-that-does-not-exist".into()),
            Signal::SIGHUP,
            store.clone(),
        ));
        let timeouts = EngineTimeouts { cloud_call: Duration::from_secs(5), correlation_window: Duration::from_millis(200) };
        OperationEngine::new(store, cloud, devices, nbd, timeouts, 10809)
    }

    fn assigned_volume_id(op: &VolumeOperation) -> VolumeId {
        VolumeId::new(op.response.as_ref().unwrap()["volume_id"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn create_then_attach_persists_mapping_and_export() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        devices.insert("/dev/nbd0", 1024);
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices, dir.path());

        let create_op = engine.create_volume(1024, "pool-a", "v1").await.unwrap();
        assert_eq!(create_op.status, OperationStatus::Completed);
        let volume_id = assigned_volume_id(&create_op);

        let attach_op = engine.attach_volume(&volume_id, &HostId::new("h1")).await.unwrap();
        assert_eq!(attach_op.status, OperationStatus::Completed);

        let mapping = store.get_mapping(&volume_id).await.unwrap().unwrap();
        assert_eq!(mapping.device_path, "/dev/nbd0");
        let export = store.get_export(&volume_id).await.unwrap().unwrap();
        assert_eq!(export.device_path, "/dev/nbd0");
    }

    #[tokio::test]
    async fn attach_then_detach_round_trip_clears_mapping_and_export() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        devices.insert("/dev/nbd0", 1024);
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices.clone(), dir.path());

        let create_op = engine.create_volume(1024, "pool-a", "v1").await.unwrap();
        let volume_id = assigned_volume_id(&create_op);
        engine.attach_volume(&volume_id, &HostId::new("h1")).await.unwrap();

        devices.remove("/dev/nbd0");
        let detach_op = engine.detach_volume(&volume_id).await.unwrap();
        assert_eq!(detach_op.status, OperationStatus::Completed);
        assert!(store.get_mapping(&volume_id).await.unwrap().is_none());
        assert!(store.get_export(&volume_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reattach_moves_mapping_and_export_to_new_host_and_device() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        devices.insert("/dev/nbd0", 1024);
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices.clone(), dir.path());

        let create_op = engine.create_volume(1024, "pool-a", "v1").await.unwrap();
        let volume_id = assigned_volume_id(&create_op);
        engine.attach_volume(&volume_id, &HostId::new("h1")).await.unwrap();

        devices.remove("/dev/nbd0");
        devices.insert("/dev/nbd1", 1024);
        let reattach_op = engine.reattach_volume(&volume_id, &HostId::new("h2")).await.unwrap();
        assert_eq!(reattach_op.status, OperationStatus::Completed);

        let mapping = store.get_mapping(&volume_id).await.unwrap().unwrap();
        assert_eq!(mapping.host_id, HostId::new("h2"));
        assert_eq!(mapping.device_path, "/dev/nbd1");
        let export = store.get_export(&volume_id).await.unwrap().unwrap();
        assert_eq!(export.device_path, "/dev/nbd1");
    }

    #[tokio::test]
    async fn attach_fails_with_correlation_timeout_when_no_device_appears() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices, dir.path());

        let create_op = engine.create_volume(1024, "pool-a", "v1").await.unwrap();
        let volume_id = assigned_volume_id(&create_op);

        let attach_op = engine.attach_volume(&volume_id, &HostId::new("h1")).await.unwrap();
        assert_eq!(attach_op.status, OperationStatus::Failed);
        assert_eq!(attach_op.error.unwrap().kind, ErrorKind::CorrelationTimeout);
    }

    #[tokio::test]
    async fn second_operation_on_same_volume_is_rejected_while_first_is_non_terminal() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices, dir.path());

        let volume_id = VolumeId::new("vol-a");
        let existing = VolumeOperation::new(OperationKind::Attach, volume_id.clone(), Some(HostId::new("h1")), json!({}));
        store.insert_operation(&existing).await.unwrap();

        let result = engine.attach_volume(&volume_id, &HostId::new("h1")).await;
        assert!(matches!(result, Err(EngineError::AlreadyInProgress(_))));
    }

    #[tokio::test]
    async fn delete_with_active_mapping_is_rejected() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let devices = Arc::new(FakeCorrelator::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(store.clone(), devices, dir.path());

        let volume_id = VolumeId::new("vol-a");
        let mapping = DeviceMapping::new_present(volume_id.clone(), HostId::new("h1"), "/dev/nbd0", 1024);
        let outcome = OperationOutcome {
            operation: VolumeOperation::new(OperationKind::Attach, volume_id.clone(), None, json!({})),
            mapping: MappingWrite::Upsert(mapping),
            export: ExportWrite::None,
        };
        store.apply_outcome(&outcome).await.unwrap();

        let result = engine.delete_volume(&volume_id).await;
        assert!(matches!(result, Err(EngineError::HasActiveMapping(_))));
    }
}
