use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use volumed_domain::{HostId, OperationId, OperationStatus, VolumeId};

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_non_terminal_operations().await?;
    Ok(StatusCode::OK)
}

// ── Volumes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateVolumeBody {
    pub size: u64,
    pub name: String,
    pub pool: String,
}

pub async fn create_volume(
    State(state): State<AppState>,
    Json(body): Json<CreateVolumeBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.create_volume(body.size, &body.pool, &body.name).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

pub async fn delete_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.delete_volume(&VolumeId::new(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

#[derive(Debug, Deserialize)]
pub struct AttachBody {
    #[serde(rename = "host-id")]
    pub host_id: String,
}

pub async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.attach_volume(&VolumeId::new(id), &HostId::new(body.host_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

pub async fn attach_volume_as_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.attach_volume_as_root(&VolumeId::new(id), &HostId::new(body.host_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

pub async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.detach_volume(&VolumeId::new(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

#[derive(Debug, Deserialize)]
pub struct ReattachBody {
    #[serde(rename = "new-host-id")]
    pub new_host_id: String,
}

pub async fn reattach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReattachBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let op = state.engine.reattach_volume(&VolumeId::new(id), &HostId::new(body.new_host_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(op))))
}

pub async fn list_volumes(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mappings = state.store.list_mappings().await?;
    Ok(Json(json!(mappings)))
}

// ── Operations ────────────────────────────────────────────────────────────────

pub async fn get_operation(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let op_id = OperationId::parse(&id).map_err(|_| ApiError::bad_request(format!("invalid operation id: {id}")))?;
    let op = state.store.get_operation(op_id).await?.ok_or_else(|| ApiError::not_found(format!("operation '{id}' not found")))?;
    Ok(Json(json!(op)))
}

#[derive(Debug, Deserialize)]
pub struct OperationsQuery {
    pub volume_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_operations(State(state): State<AppState>, Query(q): Query<OperationsQuery>) -> Result<Json<Value>, ApiError> {
    let volume_id = q.volume_id.as_deref().map(VolumeId::new);
    let status = q
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let ops = state.store.list_operations(volume_id.as_ref(), status).await?;
    Ok(Json(json!(ops)))
}

fn parse_status(s: &str) -> Result<OperationStatus, String> {
    match s {
        "pending" => Ok(OperationStatus::Pending),
        "executing" => Ok(OperationStatus::Executing),
        "completed" => Ok(OperationStatus::Completed),
        "failed" => Ok(OperationStatus::Failed),
        "cancelled" => Ok(OperationStatus::Cancelled),
        other => Err(format!("unrecognized status filter: {other}")),
    }
}

// ── Status / events / divergence ─────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let ops = state.store.list_operations(None, None).await?;
    let mut by_status: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for op in &ops {
        *by_status.entry(op.status.to_string()).or_default() += 1;
    }

    let mappings = state.store.list_mappings().await?;
    let exports = state.store.list_active_exports().await?;
    let diverged = diverged_mappings(&mappings);

    let last_reconcile = state
        .store
        .list_events(None, 200)
        .await?
        .into_iter()
        .filter(|e| matches!(e, volumed_domain::AuditEvent::ReconcileCompleted { .. }))
        .map(|e| e.occurred_at())
        .max();

    Ok(Json(json!({
        "by_status": by_status,
        "active_mappings": mappings.len(),
        "active_exports": exports.len(),
        "last_reconcile_at": last_reconcile,
        "diverged_count": diverged.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub volume_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Result<Json<Value>, ApiError> {
    let volume_id = q.volume_id.as_deref().map(VolumeId::new);
    let events = state.store.list_events(volume_id.as_ref(), q.limit.unwrap_or(100)).await?;
    Ok(Json(json!(events)))
}

pub async fn list_diverged(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mappings = state.store.list_mappings().await?;
    Ok(Json(json!(diverged_mappings(&mappings))))
}

/// Mappings whose cloud/host sides don't yet agree — the window reconcile
/// closes. Not an error; just something pending its next pass.
fn diverged_mappings(mappings: &[volumed_domain::DeviceMapping]) -> Vec<&volumed_domain::DeviceMapping> {
    mappings.iter().filter(|m| !m.is_consistent()).collect()
}
