//! Workflow tests against the in-memory backend.
//!
//! Verifies:
//! - transfers move money atomically and conserve the total
//! - concurrent transfers in both directions neither lose updates nor deadlock
//! - row locks are taken in ascending account id order
//! - a failing step, hook, commit or timeout leaves no trace
//! - email verification is single-use

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use simplebank_core::{Account, AccountId, Currency};
use simplebank_db::{
    AfterCreate, CreateAccountParams, CreateOutboxMessageParams, CreateUserParams, CreateUserTxParams,
    CreateVerifyEmailParams, Database, ErrorKind, ListEntriesParams, ListTransfersParams, MemoryDatabase, Querier,
    QueryOp, SqlStore, Store, StoreError, StoreResult, TransferTxParams, TxOptions, VerifyEmailTxParams, exec_tx,
};

fn user_params(username: &str) -> CreateUserParams {
    CreateUserParams {
        username: username.to_string(),
        hashed_password: "$2a$10$hash".to_string(),
        first_name: "Test".to_string(),
        last_name: username.to_string(),
        email: format!("{username}@example.com"),
    }
}

fn setup() -> (MemoryDatabase, SqlStore) {
    let db = MemoryDatabase::new();
    let store = SqlStore::new(Arc::new(db.clone()));
    (db, store)
}

async fn open_account(store: &SqlStore, owner: &str, balance: i64) -> Account {
    let mut conn = store.conn().await.unwrap();
    if conn.get_user(owner).await.is_err() {
        conn.create_user(user_params(owner)).await.unwrap();
    }
    conn.create_account(CreateAccountParams {
        owner: owner.to_string(),
        balance,
        currency: Currency::Usd,
    })
    .await
    .unwrap()
}

async fn balance(store: &SqlStore, id: AccountId) -> i64 {
    store.conn().await.unwrap().get_account(id).await.unwrap().balance
}

async fn entries_of(store: &SqlStore, id: AccountId) -> Vec<i64> {
    store
        .conn()
        .await
        .unwrap()
        .list_entries(ListEntriesParams {
            account_id: id,
            limit: 1000,
            offset: 0,
        })
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.amount)
        .collect()
}

async fn transfer_count(store: &SqlStore, id: AccountId) -> usize {
    store
        .conn()
        .await
        .unwrap()
        .list_transfers(ListTransfersParams {
            account_id: id,
            limit: 1000,
            offset: 0,
        })
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn simple_transfer_moves_money_and_records_both_entries() {
    let (_db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 50).await;

    let result = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 30,
        })
        .await
        .unwrap();

    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.transfer.from_account_id, a.id);
    assert_eq!(result.transfer.to_account_id, b.id);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.from_entry.account_id, a.id);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(result.to_entry.account_id, b.id);
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);

    assert_eq!(balance(&store, a.id).await, 70);
    assert_eq!(balance(&store, b.id).await, 80);

    let mut conn = store.conn().await.unwrap();
    assert_eq!(conn.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
    assert_eq!(conn.get_entry(result.from_entry.id).await.unwrap(), result.from_entry);
}

#[tokio::test]
async fn transfer_from_higher_to_lower_id_reports_each_side_correctly() {
    let (_db, store) = setup();
    let low = open_account(&store, "low", 100).await;
    let high = open_account(&store, "high", 100).await;
    assert!(low.id < high.id);

    let result = store
        .transfer_tx(TransferTxParams {
            from_account_id: high.id,
            to_account_id: low.id,
            amount: 25,
        })
        .await
        .unwrap();

    assert_eq!(result.from_account.id, high.id);
    assert_eq!(result.from_account.balance, 75);
    assert_eq!(result.to_account.id, low.id);
    assert_eq!(result.to_account.balance, 125);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_in_one_direction_do_not_lose_updates() {
    let (_db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .transfer_tx(TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: 10,
                })
                .await
        }));
    }

    let mut seen_debits = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.from_entry.amount, -10);
        assert_eq!(result.to_entry.amount, 10);
        let moved = 100 - result.from_account.balance;
        assert_eq!(moved % 10, 0);
        assert_eq!(result.to_account.balance - 100, moved);
        seen_debits.push(moved / 10);
    }

    // Every transfer observed a distinct intermediate balance.
    seen_debits.sort_unstable();
    assert_eq!(seen_debits, vec![1, 2, 3, 4, 5]);

    assert_eq!(balance(&store, a.id).await, 50);
    assert_eq!(balance(&store, b.id).await, 150);
    assert_eq!(transfer_count(&store, a.id).await, 5);
    let entries = entries_of(&store, a.id).await.len() + entries_of(&store, b.id).await.len();
    assert_eq!(entries, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposing_concurrent_transfers_do_not_deadlock() {
    let (_db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .transfer_tx(TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 10,
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(balance(&store, b.id).await, 100);
    assert_eq!(transfer_count(&store, a.id).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfers_lock_the_lower_account_first() {
    let (db, store) = setup();
    let low = open_account(&store, "alice", 100).await;
    let high = open_account(&store, "bob", 100).await;
    assert!(low.id < high.id);

    let mut holder = db.begin().await.unwrap();
    holder.get_account_for_update(high.id).await.unwrap();

    // Money flows high -> low, but the transfer must still take `low` first
    // and then park on `high`.
    let transfer = tokio::spawn({
        let store = store.clone();
        let (from_account_id, to_account_id) = (high.id, low.id);
        async move {
            store
                .transfer_tx(TransferTxParams {
                    from_account_id,
                    to_account_id,
                    amount: 10,
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut contender = db.begin().await.unwrap();
    let blocked = tokio::time::timeout(Duration::from_millis(100), contender.get_account_for_update(low.id)).await;
    assert!(blocked.is_err(), "lower account was not locked while the transfer waited");
    contender.rollback().await.unwrap();

    holder.rollback().await.unwrap();
    let result = transfer.await.unwrap().unwrap();
    assert_eq!(result.from_account.id, high.id);
    assert_eq!(balance(&store, low.id).await, 110);
    assert_eq!(balance(&store, high.id).await, 90);
}

#[tokio::test]
async fn invalid_amount_is_rejected_before_opening_a_scope() {
    let (db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    // With the store unavailable, only a pre-scope check can produce Validation.
    db.set_available(false);
    for amount in [0, -5] {
        let err = store
            .transfer_tx(TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    db.set_available(true);

    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(transfer_count(&store, a.id).await, 0);
}

#[tokio::test]
async fn self_transfer_is_rejected() {
    let (_db, store) = setup();
    let a = open_account(&store, "alice", 100).await;

    let err = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: a.id,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(entries_of(&store, a.id).await.is_empty());
}

#[tokio::test]
async fn transfer_to_missing_account_leaves_no_trace() {
    let (_db, store) = setup();
    let a = open_account(&store, "alice", 100).await;

    let err = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: AccountId::new(9_999),
            amount: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(transfer_count(&store, a.id).await, 0);
}

#[tokio::test]
async fn failure_midway_rolls_back_the_whole_transfer() {
    let (db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    for op in [QueryOp::CreateEntry, QueryOp::AddAccountBalance] {
        db.inject_failure(op);
        let err = store
            .transfer_tx(TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{op:?}: {err}");
    }

    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(balance(&store, b.id).await, 100);
    assert!(entries_of(&store, a.id).await.is_empty());
    assert!(entries_of(&store, b.id).await.is_empty());
    assert_eq!(transfer_count(&store, a.id).await, 0);
}

#[tokio::test]
async fn commit_failure_is_returned_and_nothing_is_published() {
    let (db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    db.inject_failure(QueryOp::Commit);
    let err = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Commit"));
    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(transfer_count(&store, a.id).await, 0);
}

#[tokio::test]
async fn rollback_failure_does_not_mask_the_body_error() {
    let (db, store) = setup();
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    db.inject_failure(QueryOp::CreateTransfer);
    db.inject_failure(QueryOp::Rollback);
    let err = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("CreateTransfer"), "{err}");
    assert_eq!(balance(&store, a.id).await, 100);
}

#[tokio::test]
async fn begin_failure_never_invokes_the_body() {
    let db = MemoryDatabase::new();
    db.set_available(false);
    let invoked = AtomicBool::new(false);

    let result: StoreResult<()> = exec_tx(&db, &TxOptions::labeled("never"), |_q| {
        invoked.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    })
    .await;

    assert!(result.unwrap_err().is_retryable());
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn exec_tx_commits_the_closure_result() {
    let db = MemoryDatabase::new();
    let username = exec_tx(&db, &TxOptions::default(), |q| {
        Box::pin(async move {
            let user = q.create_user(user_params("erin")).await?;
            Ok(user.username)
        })
    })
    .await
    .unwrap();

    let mut conn = db.connect().await.unwrap();
    assert_eq!(conn.get_user(&username).await.unwrap().username, "erin");
}

#[tokio::test]
async fn timed_out_unit_is_rolled_back() {
    let db = MemoryDatabase::new();
    let options = TxOptions::labeled("slow").with_timeout(Some(Duration::from_millis(50)));

    let err = exec_tx(&db, &options, |q| {
        Box::pin(async move {
            q.create_user(user_params("slowpoke")).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
    })
    .await
    .unwrap_err();

    assert!(matches!(err, StoreError::Timeout(_)));
    let mut conn = db.connect().await.unwrap();
    assert!(conn.get_user("slowpoke").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn waiting_on_a_held_row_fails_with_lock_timeout() {
    let db = MemoryDatabase::with_lock_timeout(Duration::from_millis(100));
    let store = SqlStore::new(Arc::new(db.clone()));
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

    let mut holder = db.begin().await.unwrap();
    holder.get_account_for_update(b.id).await.unwrap();

    let err = store
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout(_)), "{err}");
    assert!(err.is_retryable());

    holder.rollback().await.unwrap();
    assert_eq!(balance(&store, a.id).await, 100);
    assert_eq!(transfer_count(&store, a.id).await, 0);
}

#[tokio::test]
async fn failing_registration_hook_rolls_back_the_user() {
    let (_db, store) = setup();

    let err = store
        .create_user_tx(CreateUserTxParams {
            params: user_params("frank"),
            after_create: AfterCreate::new(|_q, _user| {
                Box::pin(async { Err(StoreError::hook("task queue unreachable")) })
            }),
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Logic);
    let mut conn = store.conn().await.unwrap();
    assert!(conn.get_user("frank").await.unwrap_err().is_not_found());

    // The username is free again.
    store
        .create_user_tx(CreateUserTxParams {
            params: user_params("frank"),
            after_create: AfterCreate::noop(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn registration_writes_its_outbox_message_in_the_same_unit() {
    let (db, store) = setup();

    let result = store
        .create_user_tx(CreateUserTxParams {
            params: user_params("grace"),
            after_create: AfterCreate::outbox(|user| {
                CreateOutboxMessageParams::for_task(
                    "task:send_verify_email",
                    &serde_json::json!({ "username": user.username }),
                    "critical",
                    10,
                    10,
                )
            }),
        })
        .await
        .unwrap();
    assert_eq!(result.user.username, "grace");
    assert!(!result.user.is_email_verified);

    let mut tx = db.begin().await.unwrap();
    let pending = tx.claim_outbox_messages(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_type, "task:send_verify_email");
    assert_eq!(pending[0].payload["username"], "grace");
    assert_eq!(pending[0].queue, "critical");
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn failing_outbox_write_rolls_back_the_user() {
    let (db, store) = setup();
    db.inject_failure(QueryOp::CreateOutboxMessage);

    let err = store
        .create_user_tx(CreateUserTxParams {
            params: user_params("heidi"),
            after_create: AfterCreate::outbox(|user| {
                CreateOutboxMessageParams::for_task("task:send_verify_email", &user.username, "critical", 10, 0)
            }),
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let mut conn = store.conn().await.unwrap();
    assert!(conn.get_user("heidi").await.unwrap_err().is_not_found());
    assert!(conn.claim_outbox_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_username_or_email_is_a_conflict() {
    let (_db, store) = setup();
    let register = |params| CreateUserTxParams {
        params,
        after_create: AfterCreate::noop(),
    };

    store.create_user_tx(register(user_params("ivan"))).await.unwrap();

    let err = store.create_user_tx(register(user_params("ivan"))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let mut same_email = user_params("ivan2");
    same_email.email = "ivan@example.com".to_string();
    let err = store.create_user_tx(register(same_email)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

async fn pending_verification(store: &SqlStore, username: &str, ttl: chrono::Duration) -> simplebank_core::VerifyEmail {
    let mut conn = store.conn().await.unwrap();
    conn.create_user(user_params(username)).await.unwrap();
    conn.create_verify_email(CreateVerifyEmailParams {
        username: username.to_string(),
        email: format!("{username}@example.com"),
        secret_code: "s3cr3t-code".to_string(),
        expired_at: Utc::now() + ttl,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn verify_email_marks_user_verified_once() {
    let (_db, store) = setup();
    let record = pending_verification(&store, "judy", chrono::Duration::minutes(15)).await;

    let result = store
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "s3cr3t-code".to_string(),
        })
        .await
        .unwrap();
    assert!(result.verify_email.is_used);
    assert!(result.user.is_email_verified);

    let replay = store
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "s3cr3t-code".to_string(),
        })
        .await
        .unwrap_err();
    assert!(replay.is_not_found());
}

#[tokio::test]
async fn wrong_code_changes_nothing() {
    let (_db, store) = setup();
    let record = pending_verification(&store, "ken", chrono::Duration::minutes(15)).await;

    let err = store
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "guess".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let mut conn = store.conn().await.unwrap();
    assert!(!conn.get_verify_email(record.id).await.unwrap().is_used);
    assert!(!conn.get_user("ken").await.unwrap().is_email_verified);
}

#[tokio::test]
async fn expired_code_is_rejected() {
    let (_db, store) = setup();
    let record = pending_verification(&store, "leo", chrono::Duration::seconds(-1)).await;

    let err = store
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "s3cr3t-code".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn transfers_conserve_money_and_balance_entries(
        moves in prop::collection::vec((0usize..3, 0usize..3, -20i64..200), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (_db, store) = setup();
            let opening = [500i64, 300, 0];
            let mut accounts = Vec::new();
            for (i, amount) in opening.iter().enumerate() {
                accounts.push(open_account(&store, &format!("owner{i}"), *amount).await.id);
            }

            let mut applied = 0usize;
            for (from, to, amount) in moves {
                let outcome = store
                    .transfer_tx(TransferTxParams {
                        from_account_id: accounts[from],
                        to_account_id: accounts[to],
                        amount,
                    })
                    .await;
                match outcome {
                    Ok(_) => applied += 1,
                    Err(err) => prop_assert_eq!(err.kind(), ErrorKind::Validation),
                }
            }

            let mut total = 0;
            let mut entry_count = 0;
            let mut entry_sum = 0;
            for (id, opening) in accounts.iter().zip(opening) {
                let current = balance(&store, *id).await;
                let entries = entries_of(&store, *id).await;
                prop_assert_eq!(current, opening + entries.iter().sum::<i64>());
                total += current;
                entry_count += entries.len();
                entry_sum += entries.iter().sum::<i64>();
            }
            prop_assert_eq!(total, 800);
            prop_assert_eq!(entry_count, 2 * applied);
            prop_assert_eq!(entry_sum, 0);
            Ok(())
        })?;
    }
}
