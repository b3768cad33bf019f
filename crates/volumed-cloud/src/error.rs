use thiserror::Error;

/// The four distinct error kinds the cloud client contract surfaces (§4.2).
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud provider unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl CloudError {
    /// Transient transport-layer errors are the only kind the retry loop retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Unavailable(_))
    }
}
