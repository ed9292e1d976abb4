use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::{AppServices, Backend};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if let Err(e) = services.ping().await {
        return errors::store_error_to_response(e);
    }

    let backend = match services.backend() {
        Backend::InMemory => "in_memory",
        Backend::Persistent => "persistent",
    };
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok", "backend": backend }))).into_response()
}
