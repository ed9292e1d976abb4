use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use simplebank_core::DomainError;
use simplebank_db::{ErrorKind, StoreError};

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err.kind() {
        ErrorKind::Validation => json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string()),
        ErrorKind::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ErrorKind::Conflict => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        ErrorKind::Transient => {
            tracing::warn!(error = %err, "store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        }
        ErrorKind::Logic => {
            tracing::error!(error = %err, "side effect failed");
            json_error(StatusCode::BAD_GATEWAY, "side_effect_failed", err.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
