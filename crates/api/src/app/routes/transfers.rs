use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use simplebank_core::{AccountId, Currency, Transfer, TransferId};
use simplebank_db::{ListTransfersParams, Querier, Store, TransferTxParams};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Move money between two accounts of the request currency.
pub async fn create_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TransferRequest>,
) -> axum::response::Response {
    let currency: Currency = match body.currency.parse() {
        Ok(c) => c,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let from_account_id = AccountId::new(body.from_account_id);
    let to_account_id = AccountId::new(body.to_account_id);
    if let Err(e) = Transfer::validate_request(from_account_id, to_account_id, body.amount) {
        return errors::domain_error_to_response(e);
    }

    {
        let mut conn = match services.store().conn().await {
            Ok(c) => c,
            Err(e) => return errors::store_error_to_response(e),
        };
        for id in [from_account_id, to_account_id] {
            match conn.get_account(id).await {
                Ok(account) if account.currency != currency => {
                    return errors::json_error(
                        StatusCode::BAD_REQUEST,
                        "currency_mismatch",
                        format!("account {id} currency mismatch: {} vs {currency}", account.currency),
                    );
                }
                Ok(_) => {}
                Err(e) => return errors::store_error_to_response(e),
            }
        }
    }

    let arg = TransferTxParams {
        from_account_id,
        to_account_id,
        amount: body.amount,
    };
    match services.store().transfer_tx(arg).await {
        Ok(result) => {
            tracing::info!(
                transfer_id = %result.transfer.id,
                from = %from_account_id,
                to = %to_account_id,
                amount = body.amount,
                "transfer committed"
            );
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    match conn.get_transfer(TransferId::new(id)).await {
        Ok(transfer) => (StatusCode::OK, Json(transfer)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Transfers touching one account, in either direction.
pub async fn list_transfers(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListTransfersQuery>,
) -> axum::response::Response {
    let (limit, offset) = match query.page().window() {
        Ok(w) => w,
        Err(response) => return response,
    };
    let account_id = AccountId::new(query.account_id);

    let mut conn = match services.store().conn().await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };

    if let Err(e) = conn.get_account(account_id).await {
        return errors::store_error_to_response(e);
    }

    let arg = ListTransfersParams {
        account_id,
        limit,
        offset,
    };
    match conn.list_transfers(arg).await {
        Ok(items) => (StatusCode::OK, Json(dto::ListResponse { items })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
