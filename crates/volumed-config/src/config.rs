use std::time::Duration;

use volumed_domain::HostId;

use crate::error::ConfigError;
use crate::raw::RawCloudConfig;

#[derive(Debug, Clone)]
pub enum CloudConfig {
    Local,
    Http { endpoint: String, token: String },
}

#[derive(Debug, Clone)]
pub struct NbdConfig {
    pub config_path: String,
    pub pid_file: Option<String>,
    pub process_name: Option<String>,
    /// Signal name (e.g. "SIGHUP") the caller resolves into a concrete
    /// signal type when constructing the export manager.
    pub reload_signal: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_address: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub cloud_call: Duration,
    pub job_poll_interval: Duration,
    pub correlation_window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub device_poll: Duration,
    pub reconcile_interval: Duration,
}

/// Validated daemon configuration, loaded from a single YAML file with
/// environment-variable overrides for secrets (§10 Configuration).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host_id: HostId,
    pub store_path: String,
    pub cloud: CloudConfig,
    pub nbd: NbdConfig,
    pub http: HttpConfig,
    pub timeouts: Timeouts,
    pub intervals: Intervals,
}

pub(crate) fn convert(
    host_id: String,
    store_path: String,
    cloud: RawCloudConfig,
    nbd: crate::raw::RawNbdConfig,
    http: crate::raw::RawHttpConfig,
    timeouts: crate::raw::RawTimeouts,
    intervals: crate::raw::RawIntervals,
    source: &str,
) -> Result<DaemonConfig, ConfigError> {
    if host_id.trim().is_empty() {
        return Err(ConfigError::Conversion { path: source.to_string(), message: "host_id must not be empty".into() });
    }

    let cloud = match cloud {
        RawCloudConfig::Local => CloudConfig::Local,
        RawCloudConfig::Http { endpoint, token, token_env } => {
            let token = resolve_secret(token, token_env, "cloud token", source)?;
            CloudConfig::Http { endpoint, token }
        }
    };

    let auth_token = match (http.auth_token, http.auth_token_env) {
        (Some(t), _) => Some(t),
        (None, Some(var)) => Some(std::env::var(&var).map_err(|_| ConfigError::EnvOverride {
            var: var.clone(),
            message: "referenced by http.auth_token_env but not set".into(),
        })?),
        (None, None) => None,
    };

    Ok(DaemonConfig {
        host_id: HostId::new(host_id),
        store_path,
        cloud,
        nbd: NbdConfig {
            config_path: nbd.config_path,
            pid_file: nbd.pid_file,
            process_name: nbd.process_name,
            reload_signal: nbd.reload_signal,
            port: nbd.port,
        },
        http: HttpConfig { bind_address: http.bind_address, auth_token },
        timeouts: Timeouts {
            cloud_call: Duration::from_secs(timeouts.cloud_call_secs),
            job_poll_interval: Duration::from_secs(timeouts.job_poll_interval_secs),
            correlation_window: Duration::from_secs(timeouts.correlation_window_secs),
        },
        intervals: Intervals {
            device_poll: Duration::from_secs(intervals.device_poll_secs),
            reconcile_interval: Duration::from_secs(intervals.reconcile_interval_secs),
        },
    })
}

fn resolve_secret(direct: Option<String>, env_var: Option<String>, what: &str, source: &str) -> Result<String, ConfigError> {
    match (direct, env_var) {
        (Some(v), _) => Ok(v),
        (None, Some(var)) => std::env::var(&var).map_err(|_| ConfigError::EnvOverride { var, message: format!("referenced by {what} but not set") }),
        (None, None) => Err(ConfigError::Conversion { path: source.to_string(), message: format!("{what} not provided (set it directly or via *_env)") }),
    }
}
