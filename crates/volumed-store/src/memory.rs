use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use volumed_domain::{AuditEvent, DeviceMapping, NbdExport, OperationId, OperationStatus, VolumeId, VolumeOperation};

use crate::error::StoreError;
use crate::store::{ExportWrite, MappingWrite, OperationOutcome, StateStore};

#[derive(Default)]
struct Inner {
    operations: HashMap<OperationId, VolumeOperation>,
    mappings: HashMap<VolumeId, DeviceMapping>,
    exports: HashMap<VolumeId, NbdExport>,
    events: Vec<AuditEvent>,
}

/// In-memory [`StateStore`], used by tests and by the `local` deployment mode.
/// Not crash-safe; never the default for a production daemon (§10).
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_operation(&self, id: OperationId) -> Result<Option<VolumeOperation>, StoreError> {
        Ok(self.inner.read().await.operations.get(&id).cloned())
    }

    async fn get_operation_for_volume(&self, volume_id: &VolumeId) -> Result<Option<VolumeOperation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .operations
            .values()
            .find(|op| &op.volume_id == volume_id && !op.status.is_terminal())
            .cloned())
    }

    async fn list_operations(
        &self,
        volume_id: Option<&VolumeId>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<VolumeOperation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .operations
            .values()
            .filter(|op| volume_id.map(|v| &op.volume_id == v).unwrap_or(true))
            .filter(|op| status.map(|s| op.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_non_terminal_operations(&self) -> Result<Vec<VolumeOperation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.operations.values().filter(|op| !op.status.is_terminal()).cloned().collect())
    }

    async fn insert_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError> {
        self.inner.write().await.operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn update_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError> {
        self.inner.write().await.operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn apply_outcome(&self, outcome: &OperationOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.operations.insert(outcome.operation.id, outcome.operation.clone());
        match &outcome.mapping {
            MappingWrite::None => {}
            MappingWrite::Upsert(m) => {
                inner.mappings.insert(m.volume_id.clone(), m.clone());
            }
            MappingWrite::Delete(v) => {
                inner.mappings.remove(v);
            }
        }
        match &outcome.export {
            ExportWrite::None => {}
            ExportWrite::Upsert(e) => {
                inner.exports.insert(e.volume_id.clone(), e.clone());
            }
            ExportWrite::Delete(v) => {
                inner.exports.remove(v);
            }
        }
        Ok(())
    }

    async fn get_mapping(&self, volume_id: &VolumeId) -> Result<Option<DeviceMapping>, StoreError> {
        Ok(self.inner.read().await.mappings.get(volume_id).cloned())
    }

    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
        Ok(self.inner.read().await.mappings.values().cloned().collect())
    }

    async fn find_mapping_by_device_path(&self, device_path: &str) -> Result<Option<DeviceMapping>, StoreError> {
        Ok(self.inner.read().await.mappings.values().find(|m| m.device_path == device_path).cloned())
    }

    async fn get_export(&self, volume_id: &VolumeId) -> Result<Option<NbdExport>, StoreError> {
        Ok(self.inner.read().await.exports.get(volume_id).cloned())
    }

    async fn list_active_exports(&self) -> Result<Vec<NbdExport>, StoreError> {
        use volumed_domain::ExportStatus;
        Ok(self
            .inner
            .read()
            .await
            .exports
            .values()
            .filter(|e| e.status == ExportStatus::Active)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.inner.write().await.events.push(event);
        Ok(())
    }

    async fn list_events(&self, volume_id: Option<&VolumeId>, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|e| volume_id.map(|v| e.volume_id() == Some(v)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volumed_domain::{HostId, OperationKind};

    #[tokio::test]
    async fn insert_and_get_operation() {
        let store = InMemoryStore::new();
        let op = VolumeOperation::new(OperationKind::Create, VolumeId::new("vol-a"), None, serde_json::json!({}));
        store.insert_operation(&op).await.unwrap();
        let fetched = store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(fetched.volume_id, VolumeId::new("vol-a"));
    }

    #[tokio::test]
    async fn non_terminal_operations_excludes_completed() {
        let store = InMemoryStore::new();
        let mut op = VolumeOperation::new(OperationKind::Create, VolumeId::new("vol-a"), None, serde_json::json!({}));
        store.insert_operation(&op).await.unwrap();
        assert_eq!(store.list_non_terminal_operations().await.unwrap().len(), 1);
        op.mark_completed(serde_json::json!({}));
        store.update_operation(&op).await.unwrap();
        assert_eq!(store.list_non_terminal_operations().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn apply_outcome_writes_operation_mapping_and_export_together() {
        let store = InMemoryStore::new();
        let mut op = VolumeOperation::new(
            OperationKind::Attach,
            VolumeId::new("vol-a"),
            Some(HostId::new("h1")),
            serde_json::json!({}),
        );
        op.mark_completed(serde_json::json!({}));
        let mapping = DeviceMapping::new_present(VolumeId::new("vol-a"), HostId::new("h1"), "/dev/sdb", 1024);
        let export = NbdExport::new(VolumeId::new("vol-a"), "/dev/sdb", 10809);
        let outcome = OperationOutcome {
            operation: op.clone(),
            mapping: MappingWrite::Upsert(mapping),
            export: ExportWrite::Upsert(export),
        };
        store.apply_outcome(&outcome).await.unwrap();

        assert!(store.get_mapping(&VolumeId::new("vol-a")).await.unwrap().is_some());
        assert!(store.get_export(&VolumeId::new("vol-a")).await.unwrap().is_some());
        assert_eq!(store.get_operation(op.id).await.unwrap().unwrap().status, op.status);
    }

    #[tokio::test]
    async fn find_mapping_by_device_path_reverse_lookup() {
        let store = InMemoryStore::new();
        let mapping = DeviceMapping::new_present(VolumeId::new("vol-a"), HostId::new("h1"), "/dev/sdb", 1024);
        let outcome = OperationOutcome {
            operation: VolumeOperation::new(OperationKind::Attach, VolumeId::new("vol-a"), None, serde_json::json!({})),
            mapping: MappingWrite::Upsert(mapping),
            export: ExportWrite::None,
        };
        store.apply_outcome(&outcome).await.unwrap();
        let found = store.find_mapping_by_device_path("/dev/sdb").await.unwrap();
        assert!(found.is_some());
        assert!(store.find_mapping_by_device_path("/dev/sdz").await.unwrap().is_none());
    }
}
