use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device monitor channel closed")]
    ChannelClosed,
    #[error("enumeration failed: {0}")]
    Enumeration(String),
}
