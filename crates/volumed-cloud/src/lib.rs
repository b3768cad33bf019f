pub mod backend;
pub mod client;
pub mod error;
pub mod http;
pub mod local;

pub use backend::{CloudBackend, JobId, JobState, JobStatus};
pub use client::{AttachOutcome, CloudClient, RetryPolicy};
pub use error::CloudError;
pub use http::HttpCloudBackend;
pub use local::LocalCloudBackend;
