use async_trait::async_trait;
use volumed_domain::{AuditEvent, DeviceMapping, NbdExport, OperationId, OperationStatus, VolumeId, VolumeOperation};

use crate::error::StoreError;

/// What to do with a volume's device mapping when persisting an operation's outcome.
#[derive(Debug, Clone)]
pub enum MappingWrite {
    None,
    Upsert(DeviceMapping),
    Delete(VolumeId),
}

/// What to do with a volume's NBD export when persisting an operation's outcome.
#[derive(Debug, Clone)]
pub enum ExportWrite {
    None,
    Upsert(NbdExport),
    Delete(VolumeId),
}

/// The bundle of writes that close out one operation (§4.5 step 5: "Persist
/// outcome... all in one transaction where the store allows").
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: VolumeOperation,
    pub mapping: MappingWrite,
    pub export: ExportWrite,
}

impl OperationOutcome {
    pub fn operation_only(operation: VolumeOperation) -> Self {
        Self { operation, mapping: MappingWrite::None, export: ExportWrite::None }
    }
}

/// Durable store for operations, device mappings, and NBD exports (§4.1).
///
/// All writes that touch more than one entity go through [`apply_outcome`],
/// which a given implementation must apply atomically. Reads must reflect
/// the latest committed state — no implementation may serve stale cached
/// data to [`list_non_terminal_operations`] or [`find_mapping_by_device_path`],
/// since both feed recovery and device correlation.
///
/// [`apply_outcome`]: StateStore::apply_outcome
/// [`list_non_terminal_operations`]: StateStore::list_non_terminal_operations
/// [`find_mapping_by_device_path`]: StateStore::find_mapping_by_device_path
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_operation(&self, id: OperationId) -> Result<Option<VolumeOperation>, StoreError>;
    async fn get_operation_for_volume(&self, volume_id: &VolumeId) -> Result<Option<VolumeOperation>, StoreError>;
    async fn list_operations(
        &self,
        volume_id: Option<&VolumeId>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<VolumeOperation>, StoreError>;
    async fn list_non_terminal_operations(&self) -> Result<Vec<VolumeOperation>, StoreError>;
    async fn insert_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError>;
    async fn update_operation(&self, operation: &VolumeOperation) -> Result<(), StoreError>;

    /// Apply the (operation, mapping, export) write bundle atomically.
    async fn apply_outcome(&self, outcome: &OperationOutcome) -> Result<(), StoreError>;

    async fn get_mapping(&self, volume_id: &VolumeId) -> Result<Option<DeviceMapping>, StoreError>;
    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError>;
    async fn find_mapping_by_device_path(&self, device_path: &str) -> Result<Option<DeviceMapping>, StoreError>;

    async fn get_export(&self, volume_id: &VolumeId) -> Result<Option<NbdExport>, StoreError>;
    async fn list_active_exports(&self) -> Result<Vec<NbdExport>, StoreError>;

    async fn append_event(&self, event: AuditEvent) -> Result<(), StoreError>;
    async fn list_events(&self, volume_id: Option<&VolumeId>, limit: usize) -> Result<Vec<AuditEvent>, StoreError>;
}
