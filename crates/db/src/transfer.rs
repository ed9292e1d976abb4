//! Funds transfer protocol.

use serde::{Deserialize, Serialize};
use tracing::debug;

use simplebank_core::{Account, AccountId, Entry, Transfer};

use crate::error::StoreResult;
use crate::params::{AddAccountBalanceParams, CreateEntryParams, CreateTransferParams};
use crate::querier::Querier;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Everything a completed transfer produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

/// Move `amount` from one account to another through `q`.
///
/// Must run inside a unit of work: the transfer record, both entries and
/// both balance deltas only make sense together.
///
/// Balance rows are always updated in ascending account id order, whichever
/// side is the source. Two transfers touching the same pair of accounts in
/// opposite directions therefore lock the rows in the same order and cannot
/// wait on each other in a cycle.
pub async fn transfer(q: &mut dyn Querier, arg: TransferTxParams) -> StoreResult<TransferTxResult> {
    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
        add_money(q, arg.from_account_id, -arg.amount, arg.to_account_id, arg.amount).await?
    } else {
        let (to_account, from_account) =
            add_money(q, arg.to_account_id, arg.amount, arg.from_account_id, -arg.amount).await?;
        (from_account, to_account)
    };

    debug!(
        transfer_id = %transfer.id,
        from_balance = from_account.balance,
        to_balance = to_account.balance,
        "transfer applied"
    );

    Ok(TransferTxResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply two balance deltas, `first` strictly before `second`.
async fn add_money(
    q: &mut dyn Querier,
    first_id: AccountId,
    first_amount: i64,
    second_id: AccountId,
    second_amount: i64,
) -> StoreResult<(Account, Account)> {
    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            amount: first_amount,
        })
        .await?;

    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            amount: second_amount,
        })
        .await?;

    Ok((first, second))
}
