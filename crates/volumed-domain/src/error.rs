use thiserror::Error;

/// Validation errors raised while constructing or checking domain values,
/// independent of any persistence or transport concern.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("volume id must not be empty")]
    EmptyVolumeId,

    #[error("host id must not be empty")]
    EmptyHostId,

    #[error("size must be greater than zero")]
    ZeroSize,

    #[error("device path must not be empty when host-side state is present")]
    InconsistentMapping,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
