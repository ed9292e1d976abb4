//! Registration and email verification workflows.

use serde::{Deserialize, Serialize};

use simplebank_core::{User, VerifyEmail, VerifyEmailId};

use crate::error::StoreResult;
use crate::params::{CreateOutboxMessageParams, CreateUserParams, UpdateUserParams, UpdateVerifyEmailParams};
use crate::querier::Querier;
use crate::unit_of_work::BoxFuture;

type AfterCreateFn =
    Box<dyn for<'a> FnOnce(&'a mut dyn Querier, &'a User) -> BoxFuture<'a, StoreResult<()>> + Send>;

/// Side effect run after the user row is inserted, inside the same unit.
///
/// The hook's result decides the unit's fate: an error rolls back the user
/// row. It receives the unit's querier, so it can record its intent as an
/// outbox row that commits (or not) together with the user.
pub struct AfterCreate(AfterCreateFn);

impl AfterCreate {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut dyn Querier, &'a User) -> BoxFuture<'a, StoreResult<()>>
            + Send
            + 'static,
    {
        Self(Box::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_, _| Box::pin(async { Ok(()) }))
    }

    /// Write the message built by `build` to the outbox of the same unit.
    pub fn outbox<B>(build: B) -> Self
    where
        B: FnOnce(&User) -> StoreResult<CreateOutboxMessageParams> + Send + 'static,
    {
        Self::new(move |q, user| {
            Box::pin(async move {
                let message = build(user)?;
                q.create_outbox_message(message).await?;
                Ok(())
            })
        })
    }

    async fn run(self, q: &mut dyn Querier, user: &User) -> StoreResult<()> {
        (self.0)(q, user).await
    }
}

impl core::fmt::Debug for AfterCreate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AfterCreate(..)")
    }
}

#[derive(Debug)]
pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserTxResult {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxParams {
    pub email_id: VerifyEmailId,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

pub async fn create_user(q: &mut dyn Querier, arg: CreateUserTxParams) -> StoreResult<CreateUserTxResult> {
    let user = q.create_user(arg.params).await?;
    arg.after_create.run(q, &user).await?;
    Ok(CreateUserTxResult { user })
}

/// Consume the verification record, then flag the owner's email as verified.
pub async fn verify_email(q: &mut dyn Querier, arg: VerifyEmailTxParams) -> StoreResult<VerifyEmailTxResult> {
    let verify_email = q
        .update_verify_email(UpdateVerifyEmailParams {
            id: arg.email_id,
            secret_code: arg.secret_code,
        })
        .await?;

    let user = q
        .update_user(UpdateUserParams {
            is_email_verified: Some(true),
            ..UpdateUserParams::for_user(verify_email.username.clone())
        })
        .await?;

    Ok(VerifyEmailTxResult { user, verify_email })
}
