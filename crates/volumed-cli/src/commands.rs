use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use serde_json::Value;
use volumed_cloud::{CloudBackend, CloudClient, HttpCloudBackend, LocalCloudBackend};
use volumed_config::{CloudConfig, NbdConfig};
use volumed_devices::{DeviceCorrelator, DeviceMonitor};
use volumed_engine::{EngineTimeouts, OperationEngine, Reconciler};
use volumed_nbd::{NbdExportManager, ServerLocator};
use volumed_store::{InMemoryStore, RedbStore, StateStore};

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(config_path: PathBuf) -> Result<()> {
    let cfg = volumed_config::load(&config_path).with_context(|| format!("loading config from {}", config_path.display()))?;

    let store: Arc<dyn StateStore> = if cfg.store_path == ":memory:" {
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(RedbStore::open(std::path::Path::new(&cfg.store_path)).with_context(|| format!("opening store at {}", cfg.store_path))?)
    };

    let backend: Arc<dyn CloudBackend> = match &cfg.cloud {
        CloudConfig::Local => Arc::new(LocalCloudBackend::new()),
        CloudConfig::Http { endpoint, token } => Arc::new(HttpCloudBackend::new(endpoint.clone(), token.clone())),
    };
    let cloud = Arc::new(CloudClient::new(backend));

    let monitor = Arc::new(DeviceMonitor::new(1024));
    let devices: Arc<dyn DeviceCorrelator> = monitor.clone();
    {
        let monitor = monitor.clone();
        let poll_interval = cfg.intervals.device_poll;
        tokio::spawn(async move { monitor.run(poll_interval).await });
    }

    let nbd = Arc::new(NbdExportManager::new(
        PathBuf::from(&cfg.nbd.config_path),
        server_locator(&cfg.nbd),
        parse_signal(&cfg.nbd.reload_signal)?,
        store.clone(),
    ));

    let timeouts = EngineTimeouts { cloud_call: cfg.timeouts.cloud_call, correlation_window: cfg.timeouts.correlation_window };
    let engine = Arc::new(OperationEngine::new(store.clone(), cloud.clone(), devices.clone(), nbd.clone(), timeouts, cfg.nbd.port));

    let reconciler = Arc::new(Reconciler::new(store.clone(), cloud.clone(), devices.clone(), nbd.clone(), cfg.host_id.clone(), cfg.nbd.port));
    let recovered = reconciler.recover_on_startup().await.context("startup recovery failed")?;
    tracing::info!(repairs = recovered, "startup recovery complete");

    {
        let reconciler = reconciler.clone();
        let interval = cfg.intervals.reconcile_interval;
        tokio::spawn(async move { reconciler.run_periodic(interval).await });
    }

    let auth_token = cfg.http.auth_token.clone().map(Arc::new);
    let app = volumed_api::build_app(engine, store, auth_token);

    tracing::info!(bind = %cfg.http.bind_address, host_id = %cfg.host_id, "starting volumed");
    let listener = tokio::net::TcpListener::bind(&cfg.http.bind_address)
        .await
        .with_context(|| format!("binding to {}", cfg.http.bind_address))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn server_locator(cfg: &NbdConfig) -> ServerLocator {
    match (&cfg.pid_file, &cfg.process_name) {
        (Some(path), _) => ServerLocator::PidFile(PathBuf::from(path)),
        (None, Some(name)) => ServerLocator::ProcessName(name.clone()),
        (None, None) => ServerLocator::ProcessName("nbd-server".into()),
    }
}

fn parse_signal(name: &str) -> Result<Signal> {
    match name {
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        "SIGTERM" => Ok(Signal::SIGTERM),
        other => anyhow::bail!("unsupported reload signal {other:?}, expected SIGHUP/SIGUSR1/SIGUSR2/SIGTERM"),
    }
}

// ── Client-side commands ──────────────────────────────────────────────────────

fn server_url(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://127.0.0.1:8080".into())
}

fn authed_client(token: Option<&str>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if let Some(token) = token {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {token}")).expect("token contains invalid header characters"),
        );
        builder = builder.default_headers(headers);
    }
    builder.build().expect("failed to build HTTP client")
}

async fn print_json_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("request failed: {status}");
    }
    Ok(())
}

pub async fn volume_create(size: u64, name: String, pool: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .post(format!("{}/api/v1/volumes", url.trim_end_matches('/')))
        .json(&serde_json::json!({"size": size, "name": name, "pool": pool}))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn volume_attach(volume_id: String, host_id: String, as_root: bool, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let path = if as_root { "attach-root" } else { "attach" };
    let resp = authed_client(token.as_deref())
        .post(format!("{}/api/v1/volumes/{}/{}", url.trim_end_matches('/'), volume_id, path))
        .json(&serde_json::json!({"host-id": host_id}))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn volume_detach(volume_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .post(format!("{}/api/v1/volumes/{}/detach", url.trim_end_matches('/'), volume_id))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn volume_reattach(volume_id: String, new_host_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .post(format!("{}/api/v1/volumes/{}/reattach", url.trim_end_matches('/'), volume_id))
        .json(&serde_json::json!({"new-host-id": new_host_id}))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn volume_delete(volume_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .delete(format!("{}/api/v1/volumes/{}", url.trim_end_matches('/'), volume_id))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn volume_list(remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .get(format!("{}/api/v1/volumes", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn operation_get(operation_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .get(format!("{}/api/v1/operations/{}", url.trim_end_matches('/'), operation_id))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn operation_list(volume_id: Option<String>, status: Option<String>, remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let mut req = authed_client(token.as_deref()).get(format!("{}/api/v1/operations", url.trim_end_matches('/')));
    let mut query = Vec::new();
    if let Some(v) = &volume_id {
        query.push(("volume_id", v.clone()));
    }
    if let Some(s) = &status {
        query.push(("status", s.clone()));
    }
    req = req.query(&query);
    let resp = req.send().await.with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}

pub async fn status(remote: Option<String>, token: Option<String>) -> Result<()> {
    let url = server_url(remote);
    let resp = authed_client(token.as_deref())
        .get(format!("{}/status", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("failed to reach daemon at {url}"))?;
    print_json_response(resp).await
}
