use std::path::Path;

use crate::config::{convert, DaemonConfig};
use crate::error::ConfigError;
use crate::raw::RawDaemonConfig;

/// Load and validate the daemon config file, applying `VOLUMED_*`
/// environment overrides for the handful of fields operators commonly
/// override per-deployment without editing the file (host id, HTTP bind
/// address, store path).
pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io { path: path.display().to_string(), source: e })?;
    let raw: RawDaemonConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse { path: path.display().to_string(), source: e })?;

    let host_id = std::env::var("VOLUMED_HOST_ID").unwrap_or(raw.host_id);
    let store_path = std::env::var("VOLUMED_STORE_PATH").unwrap_or(raw.store.path);
    let mut http = raw.http;
    if let Ok(bind) = std::env::var("VOLUMED_HTTP_BIND") {
        http.bind_address = bind;
    }

    convert(host_id, store_path, raw.cloud, raw.nbd, http, raw.timeouts, raw.intervals, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("daemon.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    const MINIMAL: &str = r#"
host_id: host-1
store:
  path: /var/lib/volumed/state.redb
cloud:
  mode: local
nbd:
  config_path: /etc/nbd/exports.conf
  process_name: nbd-server
http:
  bind_address: 127.0.0.1:8080
"#;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), MINIMAL);
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.host_id.as_str(), "host-1");
        assert_eq!(cfg.timeouts.correlation_window.as_secs(), 60);
        assert_eq!(cfg.intervals.reconcile_interval.as_secs(), 30);
    }

    #[test]
    fn host_id_env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), MINIMAL);
        std::env::set_var("VOLUMED_HOST_ID", "host-overridden");
        let cfg = load(&path).unwrap();
        std::env::remove_var("VOLUMED_HOST_ID");
        assert_eq!(cfg.host_id.as_str(), "host-overridden");
    }

    #[test]
    fn http_cloud_without_token_or_token_env_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = MINIMAL.replace("mode: local", "mode: http\n  endpoint: https://cloud.example.com");
        let path = write_config(dir.path(), &contents);
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Conversion { .. }));
    }

    #[test]
    fn empty_host_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = MINIMAL.replace("host-1", "");
        let path = write_config(dir.path(), &contents);
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Conversion { .. }));
    }
}
