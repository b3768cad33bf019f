use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawDaemonConfig {
    pub host_id: String,
    pub store: RawStoreConfig,
    pub cloud: RawCloudConfig,
    pub nbd: RawNbdConfig,
    pub http: RawHttpConfig,
    #[serde(default)]
    pub timeouts: RawTimeouts,
    #[serde(default)]
    pub intervals: RawIntervals,
}

#[derive(Debug, Deserialize)]
pub struct RawStoreConfig {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RawCloudConfig {
    Local,
    Http { endpoint: String, token: Option<String>, token_env: Option<String> },
}

#[derive(Debug, Deserialize)]
pub struct RawNbdConfig {
    pub config_path: String,
    pub pid_file: Option<String>,
    pub process_name: Option<String>,
    #[serde(default = "default_reload_signal")]
    pub reload_signal: String,
    #[serde(default = "default_nbd_port")]
    pub port: u16,
}

fn default_reload_signal() -> String {
    "SIGHUP".to_string()
}

fn default_nbd_port() -> u16 {
    10809
}

#[derive(Debug, Deserialize)]
pub struct RawHttpConfig {
    pub bind_address: String,
    pub auth_token: Option<String>,
    pub auth_token_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawTimeouts {
    #[serde(default = "default_cloud_call_secs")]
    pub cloud_call_secs: u64,
    #[serde(default = "default_job_poll_interval_secs")]
    pub job_poll_interval_secs: u64,
    #[serde(default = "default_correlation_window_secs")]
    pub correlation_window_secs: u64,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            cloud_call_secs: default_cloud_call_secs(),
            job_poll_interval_secs: default_job_poll_interval_secs(),
            correlation_window_secs: default_correlation_window_secs(),
        }
    }
}

fn default_cloud_call_secs() -> u64 {
    30
}
fn default_job_poll_interval_secs() -> u64 {
    2
}
fn default_correlation_window_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct RawIntervals {
    #[serde(default = "default_device_poll_secs")]
    pub device_poll_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for RawIntervals {
    fn default() -> Self {
        Self { device_poll_secs: default_device_poll_secs(), reconcile_interval_secs: default_reconcile_interval_secs() }
    }
}

fn default_device_poll_secs() -> u64 {
    5
}
fn default_reconcile_interval_secs() -> u64 {
    30
}
