use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::{Value, json};

use simplebank_api::app::{AppServices, build_app};
use simplebank_core::Currency;
use simplebank_db::{CreateAccountParams, CreateVerifyEmailParams, Querier, Store};
use simplebank_worker::MemoryEmailSender;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory services, bound to an ephemeral port.
        let services = Arc::new(AppServices::in_memory_with_mailer(Arc::new(MemoryEmailSender::new()), None));
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            client: reqwest::Client::new(),
            handle,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let res = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn register(&self, username: &str) {
        let (status, body) = self
            .post(
                "/users",
                json!({
                    "username": username,
                    "password": "secret",
                    "first_name": "Test",
                    "last_name": "User",
                    "email": format!("{username}@example.com"),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register {username}: {body}");
    }

    async fn open_account(&self, owner: &str, currency: &str) -> i64 {
        let (status, body) = self
            .post("/accounts", json!({ "owner": owner, "currency": currency }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "open account: {body}");
        body["id"].as_i64().unwrap()
    }

    /// Accounts only open empty over HTTP; seed an opening balance at creation.
    async fn open_funded_account(&self, owner: &str, currency: Currency, balance: i64) -> i64 {
        let mut conn = self.services.store().conn().await.unwrap();
        let account = conn
            .create_account(CreateAccountParams {
                owner: owner.into(),
                balance,
                currency,
            })
            .await
            .unwrap();
        account.id.get()
    }

    /// Current balance minus the sum of the account's ledger entries.
    async fn opening_balance(&self, id: i64) -> i64 {
        let (_, account) = self.get(&format!("/accounts/{id}")).await;
        let (_, entries) = self.get(&format!("/accounts/{id}/entries?page_size=10")).await;
        let moved: i64 = entries["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["amount"].as_i64().unwrap())
            .sum();
        account["balance"].as_i64().unwrap() - moved
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_reports_backend() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
}

#[tokio::test]
async fn registration_validates_and_rejects_duplicates() {
    let srv = TestServer::spawn().await;
    srv.register("alice").await;

    let (status, body) = srv.get("/accounts?owner=alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 0);

    let (status, body) = srv
        .post(
            "/users",
            json!({
                "username": "alice",
                "password": "secret",
                "first_name": "Other",
                "last_name": "Person",
                "email": "other@example.com",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, body) = srv
        .post(
            "/users",
            json!({
                "username": "Bad Name",
                "password": "secret",
                "first_name": "Bad",
                "last_name": "Name",
                "email": "bad@example.com",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn registered_user_is_not_echoed_with_password() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv
        .post(
            "/users",
            json!({
                "username": "bob",
                "password": "secret",
                "first_name": "Bob",
                "last_name": "Builder",
                "email": "bob@example.com",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["username"], "bob");
    assert_eq!(body["is_email_verified"], false);
    assert!(body.get("hashed_password").is_none());
}

#[tokio::test]
async fn accounts_are_unique_per_owner_and_currency() {
    let srv = TestServer::spawn().await;
    srv.register("carol").await;

    let usd = srv.open_account("carol", "USD").await;
    srv.open_account("carol", "EUR").await;

    let (status, _) = srv.post("/accounts", json!({ "owner": "carol", "currency": "USD" })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = srv.post("/accounts", json!({ "owner": "nobody", "currency": "USD" })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = srv.post("/accounts", json!({ "owner": "carol", "currency": "GBP" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = srv.get(&format!("/accounts/{usd}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], "carol");
    assert_eq!(body["balance"], 0);
    assert_eq!(body["currency"], "USD");

    let (status, body) = srv.get("/accounts?owner=carol&page_id=1&page_size=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, _) = srv.get("/accounts?owner=carol&page_id=1&page_size=50").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = srv.get("/accounts/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn transfer_moves_money_and_records_entries() {
    let srv = TestServer::spawn().await;
    srv.register("dave").await;
    srv.register("erin").await;
    let from = srv.open_funded_account("dave", Currency::Usd, 100).await;
    let to = srv.open_funded_account("erin", Currency::Usd, 50).await;

    let (status, body) = srv
        .post(
            "/transfers",
            json!({ "from_account_id": from, "to_account_id": to, "amount": 30, "currency": "USD" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "transfer: {body}");
    assert_eq!(body["from_account"]["balance"], 70);
    assert_eq!(body["to_account"]["balance"], 80);
    assert_eq!(body["from_entry"]["amount"], -30);
    assert_eq!(body["to_entry"]["amount"], 30);

    let transfer_id = body["transfer"]["id"].as_i64().unwrap();
    let (status, body) = srv.get(&format!("/transfers/{transfer_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount"], 30);
    assert_eq!(body["from_account_id"], from);

    let (status, body) = srv.get(&format!("/accounts/{from}/entries")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["items"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["amount"], -30);

    let (status, _) = srv.get("/accounts/999999/entries").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(srv.opening_balance(from).await, 100);
    assert_eq!(srv.opening_balance(to).await, 50);

    let entry_id = entries[0]["id"].as_i64().unwrap();
    let (status, body) = srv.get(&format!("/entries/{entry_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_id"], from);
    assert_eq!(body["amount"], -30);

    let (status, body) = srv.get(&format!("/transfers?account_id={to}")).await;
    assert_eq!(status, StatusCode::OK);
    let transfers = body["items"].as_array().unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0]["id"], transfer_id);

    let (status, _) = srv.get("/transfers?account_id=999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = srv.get("/entries/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn user_profile_is_public_without_the_hash() {
    let srv = TestServer::spawn().await;
    srv.register("judy").await;

    let (status, body) = srv.get("/users/judy").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "judy");
    assert_eq!(body["email"], "judy@example.com");
    assert!(body.get("hashed_password").is_none());

    let (status, body) = srv.get("/users/nobody").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn far_away_pages_are_rejected() {
    let srv = TestServer::spawn().await;
    srv.register("karl").await;
    let id = srv.open_account("karl", "USD").await;

    let far = i64::MAX;
    for path in [
        format!("/accounts/{id}/entries?page_id={far}&page_size=10"),
        format!("/accounts?owner=karl&page_id={far}&page_size=10"),
        format!("/transfers?account_id={id}&page_id={far}&page_size=10"),
    ] {
        let (status, body) = srv.get(&path).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}: {body}");
        assert_eq!(body["error"], "validation_error");
    }
}

#[tokio::test]
async fn transfer_requests_are_checked_before_money_moves() {
    let srv = TestServer::spawn().await;
    srv.register("frank").await;
    srv.register("grace").await;
    let usd = srv.open_account("frank", "USD").await;
    let eur = srv.open_account("grace", "EUR").await;
    let other_usd = srv.open_account("grace", "USD").await;

    let cases = [
        (json!({ "from_account_id": usd, "to_account_id": eur, "amount": 10, "currency": "USD" }), StatusCode::BAD_REQUEST),
        (json!({ "from_account_id": usd, "to_account_id": other_usd, "amount": 0, "currency": "USD" }), StatusCode::BAD_REQUEST),
        (json!({ "from_account_id": usd, "to_account_id": usd, "amount": 10, "currency": "USD" }), StatusCode::BAD_REQUEST),
        (json!({ "from_account_id": usd, "to_account_id": other_usd, "amount": 10, "currency": "XYZ" }), StatusCode::BAD_REQUEST),
        (json!({ "from_account_id": usd, "to_account_id": 999999, "amount": 10, "currency": "USD" }), StatusCode::NOT_FOUND),
    ];
    for (body, expected) in cases {
        let (status, response) = srv.post("/transfers", body.clone()).await;
        assert_eq!(status, expected, "request {body} answered {response}");
    }

    let (_, account) = srv.get(&format!("/accounts/{usd}")).await;
    assert_eq!(account["balance"], 0);
    let (_, entries) = srv.get(&format!("/accounts/{usd}/entries")).await;
    assert!(entries["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn verification_code_can_be_used_once() {
    let srv = TestServer::spawn().await;
    srv.register("heidi").await;

    let code = "a".repeat(32);
    let record = {
        let mut conn = srv.services.store().conn().await.unwrap();
        conn.create_verify_email(CreateVerifyEmailParams {
            username: "heidi".into(),
            email: "heidi@example.com".into(),
            secret_code: code.clone(),
            expired_at: Utc::now() + ChronoDuration::minutes(15),
        })
        .await
        .unwrap()
    };

    let (status, body) = srv
        .post("/verify_email", json!({ "email_id": record.id.get(), "secret_code": "b".repeat(32) }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "wrong code: {body}");

    let (status, body) = srv
        .post("/verify_email", json!({ "email_id": record.id.get(), "secret_code": code }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_verified"], true);

    let (status, _) = srv
        .post("/verify_email", json!({ "email_id": record.id.get(), "secret_code": "a".repeat(32) }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = srv
        .post("/verify_email", json!({ "email_id": record.id.get(), "secret_code": "short" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
