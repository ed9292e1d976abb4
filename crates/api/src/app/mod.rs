//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: storage, queue and worker wiring
//! - `routes/`: HTTP handlers, one file per resource
//! - `dto.rs`: request/response DTOs and their validation
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod password;
pub mod routes;
pub mod services;

pub use services::{AppServices, Backend, build_services};

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
