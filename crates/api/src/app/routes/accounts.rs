use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use simplebank_core::{AccountId, Currency, EntryId};
use simplebank_db::{CreateAccountParams, ListAccountsParams, ListEntriesParams, Querier, Store};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Open an account with a zero balance. One account per owner and currency.
pub async fn create_account(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateAccountRequest>,
) -> axum::response::Response {
    let currency: Currency = match body.currency.parse() {
        Ok(c) => c,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    let arg = CreateAccountParams {
        owner: body.owner,
        balance: 0,
        currency,
    };
    match conn.create_account(arg).await {
        Ok(account) => (StatusCode::CREATED, Json(account)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    match conn.get_account(AccountId::new(id)).await {
        Ok(account) => (StatusCode::OK, Json(account)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_accounts(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListAccountsQuery>,
) -> axum::response::Response {
    let (limit, offset) = match query.page().window() {
        Ok(w) => w,
        Err(response) => return response,
    };

    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    let arg = ListAccountsParams {
        owner: query.owner,
        limit,
        offset,
    };
    match conn.list_accounts(arg).await {
        Ok(items) => (StatusCode::OK, Json(dto::ListResponse { items })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Ledger entries of one account, oldest first.
pub async fn list_entries(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    Query(page): Query<dto::PageQuery>,
) -> axum::response::Response {
    let (limit, offset) = match page.window() {
        Ok(w) => w,
        Err(response) => return response,
    };
    let account_id = AccountId::new(id);

    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    // An unknown account is a 404, not an empty page.
    if let Err(e) = conn.get_account(account_id).await {
        return errors::store_error_to_response(e);
    }

    let arg = ListEntriesParams {
        account_id,
        limit,
        offset,
    };
    match conn.list_entries(arg).await {
        Ok(items) => (StatusCode::OK, Json(dto::ListResponse { items })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    match conn.get_entry(EntryId::new(id)).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
