use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use simplebank_core::VerifyEmailId;
use simplebank_db::{CreateUserParams, CreateUserTxParams, Querier, Store, VerifyEmailTxParams};
use simplebank_worker::verify_email_via_outbox;

use crate::app::services::AppServices;
use crate::app::{dto, errors, password};

/// Register a user. The verification email is queued through the outbox of
/// the same unit of work.
pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateUserRequest>,
) -> axum::response::Response {
    if let Err(e) = body.validate() {
        return errors::domain_error_to_response(e);
    }

    let plain = body.password.clone();
    let hashed_password = match tokio::task::spawn_blocking(move || password::hash_password(&plain)).await {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
    };

    let arg = CreateUserTxParams {
        params: CreateUserParams {
            username: body.username,
            hashed_password,
            first_name: body.first_name,
            last_name: body.last_name,
            email: body.email,
        },
        after_create: verify_email_via_outbox(),
    };

    match services.store().create_user_tx(arg).await {
        Ok(result) => {
            tracing::info!(username = %result.user.username, "user registered");
            (StatusCode::CREATED, Json(result.user)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn verify_email(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::VerifyEmailRequest>,
) -> axum::response::Response {
    if let Err(e) = body.validate() {
        return errors::domain_error_to_response(e);
    }

    let arg = VerifyEmailTxParams {
        email_id: VerifyEmailId::new(body.email_id),
        secret_code: body.secret_code,
    };

    match services.store().verify_email_tx(arg).await {
        Ok(result) => (
            StatusCode::OK,
            Json(dto::VerifyEmailResponse {
                is_verified: result.user.is_email_verified,
            }),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Public profile of a user. The password hash is never serialized.
pub async fn get_user(
    Extension(services): Extension<Arc<AppServices>>,
    Path(username): Path<String>,
) -> axum::response::Response {
    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    match conn.get_user(&username).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
