//! Registration side effects that queue the verification email.

use std::sync::Arc;

use simplebank_db::{AfterCreate, CreateOutboxMessageParams, StoreError};

use crate::distributor::TaskDistributor;
use crate::task::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, TaskOptions};

/// Record the send-verify-email task in the outbox of the registration unit.
///
/// The task exists exactly when the user row does; [`crate::OutboxRelay`]
/// hands it to the queue after commit.
pub fn verify_email_via_outbox() -> AfterCreate {
    AfterCreate::outbox(|user| {
        let opts = TaskOptions::verify_email();
        CreateOutboxMessageParams::for_task(
            TASK_SEND_VERIFY_EMAIL,
            &PayloadSendVerifyEmail {
                username: user.username.clone(),
            },
            opts.queue,
            opts.max_retry as i32,
            opts.process_in.as_secs() as i64,
        )
    })
}

/// Enqueue the send-verify-email task directly from inside the registration unit.
///
/// A failed enqueue rolls the registration back. If the unit fails after a
/// successful enqueue, the task still runs and finds no user.
pub fn verify_email_via_queue(distributor: Arc<dyn TaskDistributor>) -> AfterCreate {
    AfterCreate::new(move |_q, user| {
        Box::pin(async move {
            let payload = PayloadSendVerifyEmail {
                username: user.username.clone(),
            };
            distributor
                .distribute_task_send_verify_email(&payload, TaskOptions::verify_email())
                .await
                .map_err(|e| StoreError::hook(format!("failed to distribute verify email task: {e}")))?;
            Ok(())
        })
    })
}
