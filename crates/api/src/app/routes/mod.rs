use axum::{
    Router,
    routing::{get, post},
};

pub mod accounts;
pub mod system;
pub mod transfers;
pub mod users;

/// Router for the bank endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/users", post(users::create_user))
        .route("/users/:username", get(users::get_user))
        .route("/verify_email", post(users::verify_email))
        .route("/accounts", post(accounts::create_account).get(accounts::list_accounts))
        .route("/accounts/:id", get(accounts::get_account))
        .route("/accounts/:id/entries", get(accounts::list_entries))
        .route("/entries/:id", get(accounts::get_entry))
        .route("/transfers", post(transfers::create_transfer).get(transfers::list_transfers))
        .route("/transfers/:id", get(transfers::get_transfer))
}
