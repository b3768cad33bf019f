use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{info, warn};
use volumed_domain::{NbdExport, VolumeId};
use volumed_store::StateStore;

use crate::config_file::{atomic_write, parse, render};
use crate::error::NbdError;
use crate::reload::{send_reload_signal, ServerLocator};

/// Owns the NBD server's on-disk configuration file and reload protocol
/// (§4.4). Export *persistence* is the Operation Engine's job, folded into
/// the same transaction as the operation and mapping writes — this manager
/// only ever reads exports back from the store, to keep the file in sync.
pub struct NbdExportManager {
    config_path: PathBuf,
    locator: ServerLocator,
    reload_signal: Signal,
    store: Arc<dyn StateStore>,
}

impl NbdExportManager {
    pub fn new(config_path: PathBuf, locator: ServerLocator, reload_signal: Signal, store: Arc<dyn StateStore>) -> Self {
        Self { config_path, locator, reload_signal, store }
    }

    /// Build the export record for a new attach. Writes the config file and
    /// signals reload; the caller persists the returned record as part of
    /// the operation's outcome transaction.
    pub async fn create_export(&self, volume_id: &VolumeId, device_path: &str, port: u16) -> Result<NbdExport, NbdError> {
        let export = NbdExport::new(volume_id.clone(), device_path, port);
        self.rewrite_with(&export).await?;
        info!(export = %export.name, device_path, "nbd export created");
        Ok(export)
    }

    /// Update an existing export's device path (reattach). Returns the
    /// updated record for the caller to persist.
    pub async fn update_export(&self, mut existing: NbdExport, new_device_path: &str) -> Result<NbdExport, NbdError> {
        existing.update_device_path(new_device_path);
        self.rewrite_with(&existing).await?;
        info!(export = %existing.name, new_device_path, "nbd export updated");
        Ok(existing)
    }

    /// Remove an export (detach). Returns the record marked removed for the
    /// caller to persist.
    pub async fn remove_export(&self, mut existing: NbdExport) -> Result<NbdExport, NbdError> {
        existing.mark_removed();
        let mut active = self.store.list_active_exports().await?;
        active.retain(|e| e.volume_id != existing.volume_id);
        self.write_and_reload(&active).await?;
        info!(export = %existing.name, "nbd export removed");
        Ok(existing)
    }

    async fn rewrite_with(&self, updated: &NbdExport) -> Result<(), NbdError> {
        let mut active = self.store.list_active_exports().await?;
        active.retain(|e| e.volume_id != updated.volume_id);
        active.push(updated.clone());
        self.write_and_reload(&active).await
    }

    async fn write_and_reload(&self, exports: &[NbdExport]) -> Result<(), NbdError> {
        let contents = render(exports);
        let config_path = self.config_path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&config_path, &contents))
            .await
            .map_err(|e| NbdError::Io(std::io::Error::other(e)))??;
        self.reload().await;
        Ok(())
    }

    /// Best-effort: a failed reload is logged, not propagated. The on-disk
    /// file is already correct; the next reconcile pass will notice the
    /// server never picked it up (if that's even observable) and retry.
    async fn reload(&self) {
        let locator = self.locator.clone();
        let signal = self.reload_signal;
        match tokio::task::spawn_blocking(move || send_reload_signal(&locator, signal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "nbd reload signal failed, reconcile will retry"),
            Err(join_err) => warn!(error = %join_err, "nbd reload task panicked"),
        }
    }

    /// Compare the on-disk config file against the active exports in
    /// persistence and repair drift in either direction. Returns the number
    /// of export sections rewritten.
    pub async fn reconcile(&self) -> Result<usize, NbdError> {
        let active = self.store.list_active_exports().await?;
        let expected = render(&active);
        let on_disk = tokio::fs::read_to_string(&self.config_path).await.unwrap_or_default();

        if parse(&on_disk).ok().as_deref() == parse(&expected).ok().as_deref() {
            return Ok(0);
        }
        warn!(config_path = %self.config_path.display(), "nbd config drift detected, rewriting");
        self.write_and_reload(&active).await?;
        Ok(active.len())
    }
}
