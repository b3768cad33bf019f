pub mod engine;
pub mod error;
pub mod lock;
pub mod recovery;

pub use engine::{EngineTimeouts, OperationEngine};
pub use error::EngineError;
pub use lock::VolumeLocks;
pub use recovery::Reconciler;
