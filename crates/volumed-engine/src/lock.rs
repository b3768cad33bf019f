use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use volumed_domain::VolumeId;

/// Per-volume mutex registry, satisfying the serialization invariant that
/// forbids two operations on the same volume from overlapping (§4.5,
/// "Concurrency"). A volume's entry is created lazily and kept for the
/// process lifetime — idle volumes cost one empty mutex each, which is
/// cheap relative to their operation history.
#[derive(Default)]
pub struct VolumeLocks {
    locks: std::sync::Mutex<HashMap<VolumeId, Arc<Mutex<()>>>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the per-volume lock, held by the returned guard until dropped.
    pub async fn acquire(&self, volume_id: &VolumeId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().expect("lock registry poisoned");
            locks.entry(volume_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        entry.lock_owned().await
    }
}
