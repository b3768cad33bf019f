use std::path::Path;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use volumed_domain::{AuditEvent, DeviceMapping, ExportStatus, NbdExport, OperationId, OperationStatus, VolumeId, VolumeOperation};

use crate::error::StoreError;
use crate::store::{ExportWrite, MappingWrite, OperationOutcome, StateStore};

const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");
const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("mappings");
const EXPORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("exports");
const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Durable [`StateStore`] backed by an embedded `redb` database file — the
/// daemon's "only source of truth across restarts" (§3, §10).
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        // Ensure every table exists even if the file was just created.
        let write_txn = db.begin_write().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let _ = write_txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let _ = write_txn.open_table(MAPPINGS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let _ = write_txn.open_table(EXPORTS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let _ = write_txn.open_table(EVENTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(Self { db })
    }

    fn event_key(event: &AuditEvent) -> String {
        // Zero-padded nanosecond timestamp keeps iteration order chronological.
        format!("{:020}-{}", event.occurred_at().timestamp_nanos_opt().unwrap_or(0), uuid::Uuid::new_v4())
    }
}

#[async_trait]
impl StateStore for RedbStore {
    async fn get_operation(&self, id: OperationId) -> Result<Option<VolumeOperation>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let key = id.to_string();
        match table.get(key.as_str()).map_err(|e| StoreError::Internal(e.to_string()))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn get_operation_for_volume(&self, volume_id: &VolumeId) -> Result<Option<VolumeOperation>, StoreError> {
        Ok(self
            .list_non_terminal_operations()
            .await?
            .into_iter()
            .find(|op| &op.volume_id == volume_id))
    }

    async fn list_operations(
        &self,
        volume_id: Option<&VolumeId>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<VolumeOperation>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
            let (_, bytes) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            let op: VolumeOperation = serde_json::from_slice(bytes.value())?;
            if volume_id.map(|v| &op.volume_id == v).unwrap_or(true) && status.map(|s| op.status == s).unwrap_or(true) {
                out.push(op);
            }
        }
        Ok(out)
    }

    async fn list_non_terminal_operations(&self) -> Result<Vec<VolumeOperation>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
            let (_, bytes) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            let op: VolumeOperation = serde_json::from_slice(bytes.value())?;
            if !op.status.is_terminal() {
                out.push(op);
            }
        }
        Ok(out)
    }

    async fn insert_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError> {
        self.update_operation(operation).await
    }

    async fn update_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut table = write_txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let key = operation.id.to_string();
            let value = serde_json::to_vec(operation)?;
            table.insert(key.as_str(), value.as_slice()).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn apply_outcome(&self, outcome: &OperationOutcome) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut ops = write_txn.open_table(OPERATIONS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let key = outcome.operation.id.to_string();
            let value = serde_json::to_vec(&outcome.operation)?;
            ops.insert(key.as_str(), value.as_slice()).map_err(|e| StoreError::Internal(e.to_string()))?;

            let mut mappings = write_txn.open_table(MAPPINGS).map_err(|e| StoreError::Internal(e.to_string()))?;
            match &outcome.mapping {
                MappingWrite::None => {}
                MappingWrite::Upsert(m) => {
                    let key = m.volume_id.as_str().to_string();
                    let value = serde_json::to_vec(m)?;
                    mappings.insert(key.as_str(), value.as_slice()).map_err(|e| StoreError::Internal(e.to_string()))?;
                }
                MappingWrite::Delete(v) => {
                    mappings.remove(v.as_str()).map_err(|e| StoreError::Internal(e.to_string()))?;
                }
            }

            let mut exports = write_txn.open_table(EXPORTS).map_err(|e| StoreError::Internal(e.to_string()))?;
            match &outcome.export {
                ExportWrite::None => {}
                ExportWrite::Upsert(ex) => {
                    let key = ex.volume_id.as_str().to_string();
                    let value = serde_json::to_vec(ex)?;
                    exports.insert(key.as_str(), value.as_slice()).map_err(|e| StoreError::Internal(e.to_string()))?;
                }
                ExportWrite::Delete(v) => {
                    exports.remove(v.as_str()).map_err(|e| StoreError::Internal(e.to_string()))?;
                }
            }
        }
        write_txn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get_mapping(&self, volume_id: &VolumeId) -> Result<Option<DeviceMapping>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(MAPPINGS).map_err(|e| StoreError::Internal(e.to_string()))?;
        match table.get(volume_id.as_str()).map_err(|e| StoreError::Internal(e.to_string()))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(MAPPINGS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
            let (_, bytes) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            out.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(out)
    }

    async fn find_mapping_by_device_path(&self, device_path: &str) -> Result<Option<DeviceMapping>, StoreError> {
        Ok(self.list_mappings().await?.into_iter().find(|m| m.device_path == device_path))
    }

    async fn get_export(&self, volume_id: &VolumeId) -> Result<Option<NbdExport>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(EXPORTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        match table.get(volume_id.as_str()).map_err(|e| StoreError::Internal(e.to_string()))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn list_active_exports(&self) -> Result<Vec<NbdExport>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(EXPORTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
            let (_, bytes) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            let export: NbdExport = serde_json::from_slice(bytes.value())?;
            if export.status == ExportStatus::Active {
                out.push(export);
            }
        }
        Ok(out)
    }

    async fn append_event(&self, event: AuditEvent) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut table = write_txn.open_table(EVENTS).map_err(|e| StoreError::Internal(e.to_string()))?;
            let key = Self::event_key(&event);
            let value = serde_json::to_vec(&event)?;
            table.insert(key.as_str(), value.as_slice()).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_events(&self, volume_id: Option<&VolumeId>, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = txn.open_table(EVENTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))?.rev() {
            let (_, bytes) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            let event: AuditEvent = serde_json::from_slice(bytes.value())?;
            if volume_id.map(|v| event.volume_id() == Some(v)).unwrap_or(true) {
                out.push(event);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volumed_domain::{HostId, OperationKind};

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumed.redb");

        let op = VolumeOperation::new(OperationKind::Create, VolumeId::new("vol-a"), None, serde_json::json!({}));
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert_operation(&op).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let fetched = store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(fetched.volume_id, VolumeId::new("vol-a"));
    }

    #[tokio::test]
    async fn apply_outcome_is_atomic_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("volumed.redb")).unwrap();

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
    }

    #[tokio::test]
    async fn non_terminal_operations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumed.redb");
        let op = VolumeOperation::new(OperationKind::Attach, VolumeId::new("vol-a"), None, serde_json::json!({}));
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert_operation(&op).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.list_non_terminal_operations().await.unwrap().len(), 1);
    }
}
