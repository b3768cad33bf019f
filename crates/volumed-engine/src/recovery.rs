use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use volumed_cloud::CloudClient;
use volumed_devices::DeviceCorrelator;
use volumed_domain::{
    AuditEvent, CloudSideState, DeviceMapping, ErrorKind, HostId, OperationError, Phase, VolumeId,
};
use volumed_nbd::NbdExportManager;
use volumed_store::{ExportWrite, MappingWrite, OperationOutcome, StateStore};

use crate::error::EngineError;

/// Startup recovery and periodic reconciliation (§4.6): the mechanism that
/// closes the gap between what the cloud control plane reports, what the
/// Device Monitor has observed on the host, and what persistence has on
/// record. No operation is ever retried automatically by this pass — it
/// only repairs drift and fails stuck operations so a caller can decide
/// whether to retry.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    cloud: Arc<CloudClient>,
    devices: Arc<dyn DeviceCorrelator>,
    nbd: Arc<NbdExportManager>,
    host_id: HostId,
    nbd_port: u16,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        cloud: Arc<CloudClient>,
        devices: Arc<dyn DeviceCorrelator>,
        nbd: Arc<NbdExportManager>,
        host_id: HostId,
        nbd_port: u16,
    ) -> Self {
        Self { store, cloud, devices, nbd, host_id, nbd_port }
    }

    /// Run once, before the engine starts accepting new requests. Any
    /// operation still non-terminal from a previous process lifetime cannot
    /// be trusted to resume safely, so it is failed with `daemon-restart`;
    /// the subsequent [`reconcile`](Self::reconcile) pass then rediscovers
    /// whatever the cloud call actually achieved.
    pub async fn recover_on_startup(&self) -> Result<usize, EngineError> {
        let stuck = self.store.list_non_terminal_operations().await?;
        for mut op in stuck {
            warn!(volume_id = %op.volume_id, operation_id = %op.id, kind = %op.kind, "failing non-terminal operation found at startup");
            op.mark_failed(OperationError::new(ErrorKind::DaemonRestart, Phase::Execute, "daemon restarted while operation was in flight"));
            self.store.apply_outcome(&OperationOutcome::operation_only(op.clone())).await?;
            self.store
                .append_event(AuditEvent::OperationFailed {
                    operation_id: op.id,
                    volume_id: op.volume_id.clone(),
                    error: op.error.clone().expect("just set by mark_failed"),
                    occurred_at: op.updated_at,
                })
                .await?;
        }
        self.reconcile().await
    }

    /// Run the periodic reconcile loop until cancelled, logging (rather than
    /// propagating) any single pass's error so a transient cloud or store
    /// failure doesn't stop future passes.
    pub async fn run_periodic(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "reconcile pass failed, will retry next interval");
            }
        }
    }

    /// Compare the cloud's view of this host's attachments against the
    /// mapping table, repair drift in either direction, then resync the NBD
    /// config file against whatever the mapping table now says. Returns the
    /// total number of repairs made.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        self.store.append_event(AuditEvent::ReconcileStarted { occurred_at: Utc::now() }).await?;
        let mut repairs = 0usize;

        let cloud_volumes = self.cloud.list_volumes_for_host(&self.host_id).await?;
        let mappings = self.store.list_mappings().await?;

        for (volume_id, cloud_state) in &cloud_volumes {
            if *cloud_state != CloudSideState::Attached {
                continue;
            }
            if mappings.iter().any(|m| &m.volume_id == volume_id) {
                continue;
            }
            match self.repair_missing_mapping(volume_id).await {
                Ok(true) => repairs += 1,
                Ok(false) => {
                    info!(%volume_id, "cloud reports attached but no device has been correlated yet, will retry next pass");
                }
                Err(e) => warn!(%volume_id, error = %e, "failed to repair missing mapping"),
            }
        }

        for mapping in &mappings {
            let still_attached = cloud_volumes
                .iter()
                .any(|(id, state)| id == &mapping.volume_id && *state == CloudSideState::Attached);
            if !still_attached {
                match self.repair_stale_mapping(mapping).await {
                    Ok(()) => repairs += 1,
                    Err(e) => warn!(volume_id = %mapping.volume_id, error = %e, "failed to repair stale mapping"),
                }
            }
        }

        match self.nbd.reconcile().await {
            Ok(rewritten) if rewritten > 0 => {
                repairs += 1;
                info!(rewritten, "reconcile resynced the nbd config file");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "nbd config reconcile failed"),
        }

        self.store.append_event(AuditEvent::ReconcileCompleted { repairs, occurred_at: Utc::now() }).await?;
        Ok(repairs)
    }

    /// The cloud reports `volume_id` attached to this host but we hold no
    /// mapping for it — likely a daemon restart mid-attach (§8, scenario 5).
    /// Recover the expected size from the most recent operation on record
    /// for this volume, then ask the Device Monitor whether a matching
    /// device is already present.
    async fn repair_missing_mapping(&self, volume_id: &VolumeId) -> Result<bool, EngineError> {
        let mut history = self.store.list_operations(Some(volume_id), None).await?;
        history.sort_by_key(|op| op.created_at);
        let expected_size = history
            .iter()
            .rev()
            .find_map(|op| op.request.get("expected_size_bytes").and_then(|v| v.as_u64()));
        let Some(expected_size) = expected_size else {
            return Ok(false);
        };

        let excluded: Vec<String> =
            self.store.list_mappings().await?.into_iter().map(|m| m.device_path).filter(|p| !p.is_empty()).collect();
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let Some(device_path) = self.devices.match_new_device(expected_size, epoch, &excluded, Duration::from_millis(200)).await? else {
            return Ok(false);
        };

        let host_id = history.last().and_then(|op| op.host_id.clone()).unwrap_or_else(|| self.host_id.clone());
        let mapping = DeviceMapping::new_present(volume_id.clone(), host_id, device_path.clone(), expected_size);
        let export = self.nbd.create_export(volume_id, &device_path, self.nbd_port).await?;
        let op = history.pop().ok_or_else(|| EngineError::NotFound(volume_id.clone()))?;
        self.store
            .apply_outcome(&OperationOutcome { operation: op, mapping: MappingWrite::Upsert(mapping), export: ExportWrite::Upsert(export) })
            .await?;
        self.store
            .append_event(AuditEvent::ReconcileRepaired {
                volume_id: volume_id.clone(),
                detail: format!("recovered mapping to {device_path}"),
                occurred_at: Utc::now(),
            })
            .await?;
        info!(%volume_id, device_path, "reconcile repaired a missing mapping");
        Ok(true)
    }

    /// We hold a mapping that claims the volume is attached, but the cloud
    /// no longer agrees — detached or deleted out from under us. Clear the
    /// mapping and its export; there is nothing further to retry.
    async fn repair_stale_mapping(&self, mapping: &DeviceMapping) -> Result<(), EngineError> {
        if let Some(export) = self.store.get_export(&mapping.volume_id).await? {
            self.nbd.remove_export(export).await?;
        }
        let history = self.store.list_operations(Some(&mapping.volume_id), None).await?;
        let Some(op) = history.into_iter().max_by_key(|op| op.created_at) else {
            return Ok(());
        };
        self.store
            .apply_outcome(&OperationOutcome {
                operation: op,
                mapping: MappingWrite::Delete(mapping.volume_id.clone()),
                export: ExportWrite::Delete(mapping.volume_id.clone()),
            })
            .await?;
        self.store
            .append_event(AuditEvent::ReconcileRepaired {
                volume_id: mapping.volume_id.clone(),
                detail: "cloud no longer reports this volume attached, mapping cleared".into(),
                occurred_at: Utc::now(),
            })
            .await?;
        warn!(volume_id = %mapping.volume_id, "reconcile cleared a stale mapping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use nix::sys::signal::Signal;
    use volumed_cloud::{CloudBackend, LocalCloudBackend};
    use volumed_devices::DeviceError;
    use volumed_domain::{OperationError, OperationKind, OperationStatus, VolumeOperation};
    use volumed_nbd::ServerLocator;
    use volumed_store::InMemoryStore;

    use super::*;

    #[derive(Default)]
    struct FakeCorrelator {
        devices: Mutex<HashMap<String, u64>>,
    }

    impl FakeCorrelator {
        fn insert(&self, path: &str, size_bytes: u64) {
            self.devices.lock().unwrap().insert(path.to_string(), size_bytes);
        }
    }

    #[async_trait]
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

    fn test_reconciler(store: Arc<dyn StateStore>, cloud: Arc<CloudClient>, devices: Arc<FakeCorrelator>, dir: &std::path::Path) -> Reconciler {
        let nbd = Arc::new(NbdExportManager::new(
            dir.join("exports.conf"),
            ServerLocator::ProcessName("nbd-server-that-does-not-exist".into()),
            Signal::SIGHUP,
            store.clone(),
        ));
        Reconciler::new(store, cloud, devices, nbd, HostId::new("h1"), 10809)
    }

    #[tokio::test]
    async fn recover_on_startup_fails_stuck_operations() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let backend: Arc<dyn CloudBackend> = Arc::new(LocalCloudBackend::new());
        let cloud = Arc::new(CloudClient::new(backend));
        let devices = Arc::new(FakeCorrelator::default());
        let dir = tempfile::tempdir().unwrap();
        let reconciler = test_reconciler(store.clone(), cloud, devices, dir.path());

        let stuck = VolumeOperation::new(OperationKind::Attach, VolumeId::new("vol-a"), Some(HostId::new("h1")), serde_json::json!({}));
        store.insert_operation(&stuck).await.unwrap();

        reconciler.recover_on_startup().await.unwrap();

        let op = store.get_operation(stuck.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.unwrap().kind, ErrorKind::DaemonRestart);
    }

    #[tokio::test]
    async fn reconcile_repairs_a_mapping_the_cloud_reports_but_persistence_lacks() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let backend = Arc::new(LocalCloudBackend::new());
        let job = backend.create_volume(1024, "pool-a", "v1").await.unwrap();
        let status = backend.query_job(&job).await.unwrap();
        let volume_id = VolumeId::new(status.result.unwrap()["volume_id"].as_str().unwrap().to_string());
        backend.attach_volume(&volume_id, &HostId::new("h1"), None).await.unwrap();
        let cloud = Arc::new(CloudClient::new(backend as Arc<dyn CloudBackend>));

        let mut op = VolumeOperation::new(
            OperationKind::Attach,
            volume_id.clone(),
            Some(HostId::new("h1")),
            serde_json::json!({"expected_size_bytes": 1024u64}),
        );
        op.mark_completed(serde_json::json!({}));
        store.insert_operation(&op).await.unwrap();

        let devices = Arc::new(FakeCorrelator::default());
        devices.insert("/dev/nbd0", 1024);
        let dir = tempfile::tempdir().unwrap();
        let reconciler = test_reconciler(store.clone(), cloud, devices, dir.path());

        let repairs = reconciler.reconcile().await.unwrap();
        assert_eq!(repairs, 1);
        let mapping = store.get_mapping(&volume_id).await.unwrap().unwrap();
        assert_eq!(mapping.device_path, "/dev/nbd0");
    }

    #[tokio::test]
    async fn reconcile_clears_a_mapping_the_cloud_no_longer_reports_attached() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let backend: Arc<dyn CloudBackend> = Arc::new(LocalCloudBackend::new());
        let cloud = Arc::new(CloudClient::new(backend));

        let volume_id = VolumeId::new("vol-a");
        let mapping = DeviceMapping::new_present(volume_id.clone(), HostId::new("h1"), "/dev/nbd0", 1024);
        let outcome = OperationOutcome {
            operation: VolumeOperation::new(OperationKind::Attach, volume_id.clone(), None, serde_json::json!({})),
            mapping: MappingWrite::Upsert(mapping),
            export: ExportWrite::None,
        };
        store.apply_outcome(&outcome).await.unwrap();

        let devices = Arc::new(FakeCorrelator::default());
        let dir = tempfile::tempdir().unwrap();
        let reconciler = test_reconciler(store.clone(), cloud, devices, dir.path());

        reconciler.reconcile().await.unwrap();
        assert!(store.get_mapping(&volume_id).await.unwrap().is_none());
    }
}
