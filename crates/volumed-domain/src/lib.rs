pub mod audit;
pub mod error;
pub mod export;
pub mod ids;
pub mod mapping;
pub mod operation;

pub use audit::AuditEvent;
pub use error::DomainError;
pub use export::{export_name_for, ExportStatus, NbdExport};
pub use ids::{ExportName, HostId, OperationId, VolumeId};
pub use mapping::{size_within_tolerance, CloudSideState, DeviceMapping, HostSideState};
pub use operation::{ErrorKind, OperationError, OperationKind, OperationStatus, Phase, VolumeOperation};
