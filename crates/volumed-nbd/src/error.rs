use thiserror::Error;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("io error writing nbd config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed nbd config at line {line}: {detail}")]
    Malformed { line: usize, detail: String },
    #[error("store error: {0}")]
    Store(#[from] volumed_store::StoreError),
    #[error("could not locate nbd server process to signal reload: {0}")]
    ServerNotFound(String),
    #[error("failed to signal nbd server: {0}")]
    Signal(String),
}
