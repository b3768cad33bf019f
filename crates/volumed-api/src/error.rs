use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use volumed_engine::EngineError;

/// The HTTP surface's translation of internal error enums into the §7
/// taxonomy: a status code plus `{error_kind, message}`.
pub struct ApiError {
    pub status: StatusCode,
    pub error_kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, error_kind: "not-found", message: msg.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, error_kind: "invalid-request", message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, error_kind: "internal", message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error_kind": self.error_kind, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::AlreadyInProgress(_) => {
                ApiError { status: StatusCode::CONFLICT, error_kind: "invariant-violation", message: e.to_string() }
            }
            EngineError::NotFound(_) => ApiError { status: StatusCode::NOT_FOUND, error_kind: "not-found", message: e.to_string() },
            EngineError::HasActiveMapping(_) => {
                ApiError { status: StatusCode::CONFLICT, error_kind: "invariant-violation", message: e.to_string() }
            }
            EngineError::CorrelationTimeout(_) => {
                ApiError { status: StatusCode::GATEWAY_TIMEOUT, error_kind: "correlation-timeout", message: e.to_string() }
            }
            EngineError::Store(_) | EngineError::Nbd(_) | EngineError::Device(_) => {
                ApiError { status: StatusCode::SERVICE_UNAVAILABLE, error_kind: "transport", message: e.to_string() }
            }
            EngineError::Cloud(_) => ApiError { status: StatusCode::BAD_GATEWAY, error_kind: "transport", message: e.to_string() },
        }
    }
}

impl From<volumed_store::StoreError> for ApiError {
    fn from(e: volumed_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}
