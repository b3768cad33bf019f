use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::Disks;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use volumed_domain::size_within_tolerance;

use crate::error::DeviceError;
use crate::event::{DeviceEvent, DeviceEventKind};

/// The correlation surface the Operation Engine depends on, kept separate
/// from [`DeviceMonitor`]'s polling/enumeration machinery so the engine can
/// be exercised against a fake host environment in tests.
#[async_trait]
pub trait DeviceCorrelator: Send + Sync {
    async fn match_new_device(
        &self,
        expected_size: u64,
        since: DateTime<Utc>,
        excluded: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, DeviceError>;

    async fn is_present(&self, device_path: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct KnownDevice {
    size_bytes: u64,
    appeared_at: DateTime<Utc>,
}

/// Watches the host's block devices and publishes add/remove events.
///
/// Kernel uevent subscription is the ideal source; this deployment instead
/// polls the block-device enumeration at a fixed interval and diffs against
/// the last-known set, which is observably equivalent from the Operation
/// Engine's point of view (it only consumes the resulting event stream).
pub struct DeviceMonitor {
    known: Arc<RwLock<HashMap<String, KnownDevice>>>,
    events_tx: mpsc::Sender<DeviceEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
}

impl DeviceMonitor {
    /// Enumerate the current block devices to seed the known-device map,
    /// per the startup-enumeration requirement.
    pub fn new(channel_capacity: usize) -> Self {
        let seed = enumerate();
        let now = Utc::now();
        let known = seed.into_iter().map(|(path, size)| (path, KnownDevice { size_bytes: size, appeared_at: now })).collect();
        let (events_tx, events_rx) = mpsc::channel(channel_capacity);
        Self { known: Arc::new(RwLock::new(known)), events_tx, events_rx: tokio::sync::Mutex::new(Some(events_rx)) }
    }

    /// Take the event receiver. Can only be taken once; the engine is the
    /// sole consumer of this stream.
    pub async fn subscribe(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Run the polling loop until cancelled. Diffs each enumeration against
    /// the known-device map and emits add/remove events for the difference.
    /// Events are dropped (and logged) if the channel is full — the
    /// reconciliation loop is the safety net for dropped events.
    pub async fn run(&self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        let current = enumerate();
        let now = Utc::now();
        let mut known = self.known.write().await;

        let mut added = Vec::new();
        for (path, size) in &current {
            if !known.contains_key(path) {
                known.insert(path.clone(), KnownDevice { size_bytes: *size, appeared_at: now });
                added.push(DeviceEvent { kind: DeviceEventKind::Add, device_path: path.clone(), size_bytes: *size, observed_at: now });
            }
        }
        let removed_paths: Vec<String> = known.keys().filter(|p| !current.contains_key(p.as_str())).cloned().collect();
        let mut removed = Vec::new();
        for path in removed_paths {
            if let Some(dev) = known.remove(&path) {
                removed.push(DeviceEvent { kind: DeviceEventKind::Remove, device_path: path, size_bytes: dev.size_bytes, observed_at: now });
            }
        }
        drop(known);

        for event in added.into_iter().chain(removed) {
            if self.events_tx.try_send(event.clone()).is_err() {
                warn!(device_path = %event.device_path, "device event channel full, dropping event");
            } else {
                debug!(device_path = %event.device_path, kind = ?event.kind, "device event published");
            }
        }
    }

    /// Whether `device_path` is currently in the known-device set. Used by
    /// detach correlation, which waits for absence rather than matching a
    /// new appearance.
    pub async fn is_present(&self, device_path: &str) -> bool {
        self.known.read().await.contains_key(device_path)
    }

    /// Best-effort correlation helper used during attach/detach correlation.
    /// `excluded` lists device paths already bound to a mapping — the
    /// monitor itself has no notion of mappings, so the caller supplies
    /// the exclusion set.
    pub async fn match_new_device(
        &self,
        expected_size: u64,
        since: DateTime<Utc>,
        excluded: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, DeviceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let known = self.known.read().await;
                let mut candidates: Vec<(&String, &KnownDevice)> = known
                    .iter()
                    .filter(|(path, dev)| {
                        dev.appeared_at >= since
                            && !excluded.iter().any(|p| p == *path)
                            && size_within_tolerance(expected_size, dev.size_bytes, 1.0)
                    })
                    .collect();
                if !candidates.is_empty() {
                    candidates.sort_by(|a, b| a.1.appeared_at.cmp(&b.1.appeared_at).then_with(|| a.0.cmp(b.0)));
                    return Ok(Some(candidates[0].0.clone()));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl DeviceCorrelator for DeviceMonitor {
    async fn match_new_device(
        &self,
        expected_size: u64,
        since: DateTime<Utc>,
        excluded: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, DeviceError> {
        DeviceMonitor::match_new_device(self, expected_size, since, excluded, timeout).await
    }

    async fn is_present(&self, device_path: &str) -> bool {
        DeviceMonitor::is_present(self, device_path).await
    }
}

fn enumerate() -> HashMap<String, u64> {
    let disks = Disks::new_with_refreshed_list();
    disks.iter().map(|d| (d.name().to_string_lossy().into_owned(), d.total_space())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn match_new_device_finds_recent_matching_candidate() {
        let monitor = DeviceMonitor::new(16);
        let since = Utc::now();
        {
            let mut known = monitor.known.write().await;
            known.insert("/dev/sdz".into(), KnownDevice { size_bytes: 10_737_418_240, appeared_at: Utc::now() });
        }
        let found = monitor.match_new_device(10_737_418_240, since, &[], Duration::from_millis(50)).await.unwrap();
        assert_eq!(found.as_deref(), Some("/dev/sdz"));
    }

    #[tokio::test]
    async fn match_new_device_excludes_already_mapped_paths() {
        let monitor = DeviceMonitor::new(16);
        let since = Utc::now();
        {
            let mut known = monitor.known.write().await;
            known.insert("/dev/sdz".into(), KnownDevice { size_bytes: 10_737_418_240, appeared_at: Utc::now() });
        }
        let found = monitor
            .match_new_device(10_737_418_240, since, &["/dev/sdz".to_string()], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn match_new_device_ignores_devices_older_than_since() {
        let monitor = DeviceMonitor::new(16);
        {
            let mut known = monitor.known.write().await;
            known.insert("/dev/sdz".into(), KnownDevice { size_bytes: 10_737_418_240, appeared_at: Utc::now() });
        }
        let since = Utc::now() + chrono::Duration::seconds(10);
        let found = monitor.match_new_device(10_737_418_240, since, &[], Duration::from_millis(50)).await.unwrap();
        assert_eq!(found, None);
    }
}
