use thiserror::Error;
use volumed_domain::VolumeId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a non-terminal operation already exists for volume {0}")]
    AlreadyInProgress(VolumeId),

    #[error("volume {0} not found")]
    NotFound(VolumeId),

    #[error("volume {0} has an active mapping, detach before deleting")]
    HasActiveMapping(VolumeId),

    #[error("store error: {0}")]
    Store(#[from] volumed_store::StoreError),

    #[error("cloud error: {0}")]
    Cloud(#[from] volumed_cloud::CloudError),

    #[error("nbd error: {0}")]
    Nbd(#[from] volumed_nbd::NbdError),

    #[error("device correlation timed out for volume {0}")]
    CorrelationTimeout(VolumeId),

    #[error("device monitor error: {0}")]
    Device(#[from] volumed_devices::DeviceError),
}
