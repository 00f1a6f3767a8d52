//! Database store for the credit ledger.
//!
//! ## Design Decisions
//!
//! ### Row locking
//! - **Per-account serialization**: every balance mutation locks the
//!   account row with `SELECT ... FOR UPDATE` inside the caller's
//!   transaction. Concurrency across accounts is unconstrained; concurrency
//!   on one account serializes on the row lock.
//! - **Deterministic lock order**: orchestrators always lock user, then
//!   platform, then agent accounts, so two operations touching the same set
//!   of accounts cannot deadlock.
//!
//! ### Lazy accounts
//! - Accounts are created on first reference. The unique
//!   `(owner_type, owner_id)` index resolves concurrent creation: the
//!   insert uses `ON CONFLICT DO NOTHING` and the loser re-selects the row
//!   the winner committed.
//!
//! ### Hourly refill
//! - Every locked read inside `income`/`deduction`/`expense` first applies
//!   any due free-credit refill, so balances are always current before the
//!   operation's own effect. Refills update balances without recording a
//!   ledger event.
//!
//! ### Platform accounts
//! - The four reserved platform accounts mirror user-side movements and may
//!   hold negative balances; they are exempt from the insufficient-funds
//!   check in `deduction_tx` and may record zero-amount income, so every
//!   message expense carries its platform fee leg.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use payloads::{
    AccountId, CreditDebit, CreditType, EventId, OwnerType, TxId, TxType,
};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::id::IdGenerator;
use crate::time::{TimeSource, truncate_to_hour};

pub mod credit;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate upstream transaction")]
    DuplicateUpstreamTx,
    #[error("Invalid amount: {0}")]
    InvalidAmount(&'static str),
    #[error("A note explaining the reason is required")]
    MissingNote,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Account not found")]
    AccountNotFound,
    #[error("Credit event not found")]
    EventNotFound,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
        {
            return StoreError::NotUnique(e);
        }
        StoreError::Database(e)
    }
}

/// A complete credit account row.
///
/// Three pools per account: `credits` (permanent, from recharges),
/// `free_credits` (hourly-refilled up to `free_quota`), and
/// `reward_credits` (promotional grants).
#[derive(Debug, Clone, FromRow)]
pub struct CreditAccount {
    pub id: AccountId,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub credits: Decimal,
    pub free_credits: Decimal,
    pub reward_credits: Decimal,
    pub free_quota: Decimal,
    pub refill_amount: Decimal,
    #[sqlx(try_from = "SqlxTs")]
    pub last_refill_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

impl CreditAccount {
    /// Sum of the three pools.
    pub fn total_balance(&self) -> Decimal {
        self.credits + self.free_credits + self.reward_credits
    }

    /// Balance of the pool named by `credit_type`.
    pub fn pool(&self, credit_type: CreditType) -> Decimal {
        match credit_type {
            CreditType::Permanent => self.credits,
            CreditType::Free => self.free_credits,
            CreditType::Reward => self.reward_credits,
        }
    }
}

/// One leg of the double entry attached to an event.
#[derive(Debug, Clone, FromRow)]
pub struct CreditTransaction {
    pub id: TxId,
    pub account_id: AccountId,
    pub event_id: EventId,
    pub tx_type: TxType,
    pub credit_debit: CreditDebit,
    pub change_amount: Decimal,
    pub credit_type: CreditType,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

/// Get an account by owner without creating it.
pub async fn get_account(
    owner_type: OwnerType,
    owner_id: &str,
    pool: &PgPool,
) -> Result<Option<CreditAccount>, StoreError> {
    Ok(sqlx::query_as::<_, CreditAccount>(
        "SELECT * FROM credit_accounts
        WHERE owner_type = $1 AND owner_id = $2",
    )
    .bind(owner_type)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?)
}

async fn select_account_tx(
    owner_type: OwnerType,
    owner_id: &str,
    for_update: bool,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<CreditAccount>, StoreError> {
    let sql = if for_update {
        "SELECT * FROM credit_accounts
        WHERE owner_type = $1 AND owner_id = $2
        FOR UPDATE"
    } else {
        "SELECT * FROM credit_accounts
        WHERE owner_type = $1 AND owner_id = $2"
    };
    Ok(sqlx::query_as::<_, CreditAccount>(sql)
        .bind(owner_type)
        .bind(owner_id)
        .fetch_optional(&mut **tx)
        .await?)
}

/// Get an account by owner and lock it for update. Must be called inside a
/// transaction; the lock is released at transaction end.
pub async fn get_account_for_update_tx(
    owner_type: OwnerType,
    owner_id: &str,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<CreditAccount>, StoreError> {
    select_account_tx(owner_type, owner_id, true, tx).await
}

/// Get an account, inserting a zeroed row if absent.
///
/// When `for_update` is set the returned row is locked until the
/// transaction commits. A concurrent-creation race is resolved by the
/// unique `(owner_type, owner_id)` index: the losing insert is a no-op and
/// the committed row is re-selected.
pub async fn get_or_create_tx(
    owner_type: OwnerType,
    owner_id: &str,
    for_update: bool,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<CreditAccount, StoreError> {
    if let Some(account) =
        select_account_tx(owner_type, owner_id, for_update, tx).await?
    {
        return Ok(account);
    }

    let now = time_source.now();
    let inserted = sqlx::query_as::<_, CreditAccount>(
        "INSERT INTO credit_accounts (
            id,
            owner_type,
            owner_id,
            last_refill_at,
            created_at,
            updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (owner_type, owner_id) DO NOTHING
        RETURNING *",
    )
    .bind(AccountId(ids.next_id()))
    .bind(owner_type)
    .bind(owner_id)
    .bind(now.to_sqlx())
    .bind(now.to_sqlx())
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(account) = inserted {
        return Ok(account);
    }

    // Lost a creation race; the winner's row is committed or in flight, so
    // this select blocks on the lock if needed and must find it.
    select_account_tx(owner_type, owner_id, for_update, tx)
        .await?
        .ok_or(StoreError::AccountNotFound)
}

/// Apply any due hourly refill to a locked account.
///
/// `free_credits` accrues `refill_amount` per whole elapsed hour, capped at
/// `free_quota`; `last_refill_at` advances to the start of the current
/// hour. Refills are balance maintenance, not ledger events.
async fn refill_free_credits_tx(
    account: &mut CreditAccount,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    if account.refill_amount <= Decimal::ZERO {
        return Ok(());
    }
    let now = time_source.now();
    let hours_elapsed =
        (now.as_second() - account.last_refill_at.as_second()) / 3600;
    if hours_elapsed < 1 {
        return Ok(());
    }

    let accrued = account.refill_amount * Decimal::from(hours_elapsed);
    let new_free = account.free_quota.min(account.free_credits + accrued);
    let refilled_at = truncate_to_hour(now);
    sqlx::query(
        "UPDATE credit_accounts
        SET free_credits = $1, last_refill_at = $2, updated_at = $3
        WHERE id = $4",
    )
    .bind(new_free)
    .bind(refilled_at.to_sqlx())
    .bind(now.to_sqlx())
    .bind(account.id)
    .execute(&mut **tx)
    .await?;

    tracing::debug!(
        "Refilled account {} free credits to {} after {} hour(s)",
        account.id,
        new_free,
        hours_elapsed
    );
    account.free_credits = new_free;
    account.last_refill_at = refilled_at;
    Ok(())
}

fn pool_column(credit_type: CreditType) -> &'static str {
    match credit_type {
        CreditType::Permanent => "credits",
        CreditType::Free => "free_credits",
        CreditType::Reward => "reward_credits",
    }
}

/// Apply a signed delta to one pool column, returning the updated row.
async fn adjust_pool_tx(
    account: &CreditAccount,
    credit_type: CreditType,
    delta: Decimal,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<CreditAccount, StoreError> {
    let column = pool_column(credit_type);
    Ok(sqlx::query_as::<_, CreditAccount>(&format!(
        "UPDATE credit_accounts
        SET {column} = {column} + $1, updated_at = $2
        WHERE id = $3
        RETURNING *"
    ))
    .bind(delta)
    .bind(time_source.now().to_sqlx())
    .bind(account.id)
    .fetch_one(&mut **tx)
    .await?)
}

/// Add `amount` to the pool named by `credit_type` on a locked account,
/// creating the account if needed.
///
/// Platform accounts accept a zero amount: every message expense credits
/// the platform fee account, even when the configured fee percentage makes
/// the share zero.
pub async fn income_tx(
    owner_type: OwnerType,
    owner_id: &str,
    amount: Decimal,
    credit_type: CreditType,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<CreditAccount, StoreError> {
    if amount < Decimal::ZERO
        || (amount == Decimal::ZERO && owner_type != OwnerType::Platform)
    {
        return Err(StoreError::InvalidAmount(
            "income amount must be positive",
        ));
    }
    let mut account =
        get_or_create_tx(owner_type, owner_id, true, ids, time_source, tx)
            .await?;
    refill_free_credits_tx(&mut account, time_source, tx).await?;
    adjust_pool_tx(&account, credit_type, amount, time_source, tx).await
}

/// Subtract `amount` from the pool named by `credit_type` on a locked
/// account. Does not fall back across pools.
///
/// Platform accounts are bookkeeping mirrors of user-side movements and are
/// allowed to go negative; all other owners must cover the full amount from
/// the named pool.
pub async fn deduction_tx(
    owner_type: OwnerType,
    owner_id: &str,
    amount: Decimal,
    credit_type: CreditType,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<CreditAccount, StoreError> {
    if amount <= Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "deduction amount must be positive",
        ));
    }
    let mut account =
        get_or_create_tx(owner_type, owner_id, true, ids, time_source, tx)
            .await?;
    refill_free_credits_tx(&mut account, time_source, tx).await?;
    if owner_type != OwnerType::Platform
        && account.pool(credit_type) < amount
    {
        return Err(StoreError::InsufficientFunds);
    }
    adjust_pool_tx(&account, credit_type, -amount, time_source, tx).await
}

/// Tri-pool deduction: consume `amount` in the fixed order free_credits ->
/// reward_credits -> credits.
///
/// Returns the updated account and the credit type of the deepest pool
/// touched, which labels the resulting event and routes fee income into the
/// same pool. A zero amount touches nothing and is labeled `Free`.
pub async fn expense_tx(
    owner_type: OwnerType,
    owner_id: &str,
    amount: Decimal,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(CreditAccount, CreditType), StoreError> {
    if amount < Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "expense amount cannot be negative",
        ));
    }
    let mut account =
        get_or_create_tx(owner_type, owner_id, true, ids, time_source, tx)
            .await?;
    refill_free_credits_tx(&mut account, time_source, tx).await?;
    if account.total_balance() < amount {
        return Err(StoreError::InsufficientFunds);
    }

    let mut remaining = amount;
    let from_free = remaining.min(account.free_credits);
    remaining -= from_free;
    let from_reward = remaining.min(account.reward_credits);
    remaining -= from_reward;
    let from_permanent = remaining;

    let credit_type = if from_permanent > Decimal::ZERO {
        CreditType::Permanent
    } else if from_reward > Decimal::ZERO {
        CreditType::Reward
    } else {
        CreditType::Free
    };

    let account = sqlx::query_as::<_, CreditAccount>(
        "UPDATE credit_accounts
        SET free_credits = free_credits - $1,
            reward_credits = reward_credits - $2,
            credits = credits - $3,
            updated_at = $4
        WHERE id = $5
        RETURNING *",
    )
    .bind(from_free)
    .bind(from_reward)
    .bind(from_permanent)
    .bind(time_source.now().to_sqlx())
    .bind(account.id)
    .fetch_one(&mut **tx)
    .await?;

    Ok((account, credit_type))
}
