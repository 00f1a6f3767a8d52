//! Credit ledger operations
//!
//! Implements the callable surface of the ledger:
//! - the five atomic operations: recharge, reward, adjustment, message
//!   expense, and daily-quota update
//! - the cursor-paginated event listings and the upstream-tx lookup
//!
//! Every mutating operation follows the same skeleton: advisory idempotency
//! check, input validation, one transaction that locks accounts in the
//! order user -> platform -> agent, one `CreditEvent`, the matching
//! `CreditTransaction` legs, commit. On any error the transaction is
//! dropped without commit and nothing is persisted.

use jiff_sqlx::ToSqlx;
use payloads::{
    AccountId, CreditDebit, CreditType, Direction, EventId, EventType,
    OwnerType, PLATFORM_ACCOUNT_ADJUSTMENT, PLATFORM_ACCOUNT_FEE,
    PLATFORM_ACCOUNT_RECHARGE, PLATFORM_ACCOUNT_REWARD, TxId, TxType,
    UpstreamType, quantize,
    responses::{CreditEvent, CreditEventsPage},
};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use super::{
    CreditAccount, StoreError, deduction_tx, expense_tx, get_account,
    get_account_for_update_tx, income_tx,
};
use crate::id::IdGenerator;
use crate::time::TimeSource;

/// Default page size for event listings.
pub const DEFAULT_EVENT_PAGE_SIZE: i64 = 20;

/// Reject an operation whose upstream transaction has already been
/// recorded.
///
/// Advisory only: two concurrent calls may both pass, in which case the
/// unique index on `(upstream_type, upstream_tx_id)` decides at insert time
/// and the loser fails with `DuplicateUpstreamTx` as well.
async fn check_upstream_tx_unused(
    upstream_type: UpstreamType,
    upstream_tx_id: &str,
    pool: &PgPool,
) -> Result<(), StoreError> {
    let existing: Option<EventId> = sqlx::query_scalar(
        "SELECT id FROM credit_events
        WHERE upstream_type = $1 AND upstream_tx_id = $2",
    )
    .bind(upstream_type)
    .bind(upstream_tx_id)
    .fetch_optional(pool)
    .await?;
    if existing.is_some() {
        return Err(StoreError::DuplicateUpstreamTx);
    }
    Ok(())
}

/// A unique violation on the upstream index means a concurrent operation
/// with the same upstream transaction won the race.
fn map_upstream_unique_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e
        && db_err.is_unique_violation()
        && db_err.constraint() == Some("credit_events_upstream_unique")
    {
        return StoreError::DuplicateUpstreamTx;
    }
    e.into()
}

/// Field set for one event insert.
struct EventRecord<'a> {
    event_type: EventType,
    upstream_type: UpstreamType,
    upstream_tx_id: &'a str,
    direction: Direction,
    account_id: AccountId,
    total_amount: Decimal,
    credit_type: CreditType,
    balance_after: Decimal,
    base_amount: Decimal,
    base_original_amount: Decimal,
    base_llm_amount: Option<Decimal>,
    fee_platform_amount: Option<Decimal>,
    fee_agent_amount: Option<Decimal>,
    fee_agent_account: Option<AccountId>,
    agent_id: Option<&'a str>,
    message_id: Option<&'a str>,
    start_message_id: Option<&'a str>,
    note: Option<&'a str>,
}

impl<'a> EventRecord<'a> {
    /// Record for a recharge, reward, or adjustment event; the message and
    /// fee fields stay null.
    fn simple(
        event_type: EventType,
        upstream_tx_id: &'a str,
        direction: Direction,
        account: &CreditAccount,
        amount: Decimal,
        credit_type: CreditType,
        note: Option<&'a str>,
    ) -> Self {
        Self {
            event_type,
            upstream_type: UpstreamType::Api,
            upstream_tx_id,
            direction,
            account_id: account.id,
            total_amount: amount,
            credit_type,
            balance_after: account.total_balance(),
            base_amount: amount,
            base_original_amount: amount,
            base_llm_amount: None,
            fee_platform_amount: None,
            fee_agent_amount: None,
            fee_agent_account: None,
            agent_id: None,
            message_id: None,
            start_message_id: None,
            note,
        }
    }
}

async fn insert_event_tx(
    record: EventRecord<'_>,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<EventId, StoreError> {
    let event_id = EventId(ids.next_id());
    sqlx::query(
        "INSERT INTO credit_events (
            id,
            event_type,
            upstream_type,
            upstream_tx_id,
            direction,
            account_id,
            total_amount,
            credit_type,
            balance_after,
            base_amount,
            base_original_amount,
            base_llm_amount,
            fee_platform_amount,
            fee_agent_amount,
            fee_agent_account,
            agent_id,
            message_id,
            start_message_id,
            note,
            created_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )",
    )
    .bind(event_id)
    .bind(record.event_type)
    .bind(record.upstream_type)
    .bind(record.upstream_tx_id)
    .bind(record.direction)
    .bind(record.account_id)
    .bind(record.total_amount)
    .bind(record.credit_type)
    .bind(record.balance_after)
    .bind(record.base_amount)
    .bind(record.base_original_amount)
    .bind(record.base_llm_amount)
    .bind(record.fee_platform_amount)
    .bind(record.fee_agent_amount)
    .bind(record.fee_agent_account)
    .bind(record.agent_id)
    .bind(record.message_id)
    .bind(record.start_message_id)
    .bind(record.note)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await
    .map_err(map_upstream_unique_error)?;
    Ok(event_id)
}

#[allow(clippy::too_many_arguments)]
async fn insert_leg_tx(
    account_id: AccountId,
    event_id: EventId,
    tx_type: TxType,
    credit_debit: CreditDebit,
    change_amount: Decimal,
    credit_type: CreditType,
    ids: &IdGenerator,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO credit_transactions (
            id,
            account_id,
            event_id,
            tx_type,
            credit_debit,
            change_amount,
            credit_type,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(TxId(ids.next_id()))
    .bind(account_id)
    .bind(event_id)
    .bind(tx_type)
    .bind(credit_debit)
    .bind(change_amount)
    .bind(credit_type)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Recharge credits to a user account.
///
/// Adds to the user's permanent pool and debits the platform recharge
/// account by the same amount.
#[tracing::instrument(skip(ids, time_source, pool))]
pub async fn recharge(
    user_id: &str,
    amount: Decimal,
    upstream_tx_id: &str,
    note: Option<&str>,
    ids: &IdGenerator,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CreditAccount, StoreError> {
    check_upstream_tx_unused(UpstreamType::Api, upstream_tx_id, pool).await?;
    if amount <= Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "recharge amount must be positive",
        ));
    }
    let amount = quantize(amount);

    let mut tx = pool.begin().await?;
    let user_account = income_tx(
        OwnerType::User,
        user_id,
        amount,
        CreditType::Permanent,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    let platform_account = deduction_tx(
        OwnerType::Platform,
        PLATFORM_ACCOUNT_RECHARGE,
        amount,
        CreditType::Permanent,
        ids,
        time_source,
        &mut tx,
    )
    .await?;

    let event_id = insert_event_tx(
        EventRecord::simple(
            EventType::Recharge,
            upstream_tx_id,
            Direction::Income,
            &user_account,
            amount,
            CreditType::Permanent,
            note,
        ),
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        user_account.id,
        event_id,
        TxType::Recharge,
        CreditDebit::Credit,
        amount,
        CreditType::Permanent,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        platform_account.id,
        event_id,
        TxType::Recharge,
        CreditDebit::Debit,
        amount,
        CreditType::Permanent,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    tracing::info!("Recharged {} credits to user {}", amount, user_id);
    Ok(user_account)
}

/// Grant reward credits to a user account.
///
/// Mirror of [`recharge`] on the reward pools, against the platform reward
/// account.
#[tracing::instrument(skip(ids, time_source, pool))]
pub async fn reward(
    user_id: &str,
    amount: Decimal,
    upstream_tx_id: &str,
    note: Option<&str>,
    ids: &IdGenerator,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CreditAccount, StoreError> {
    check_upstream_tx_unused(UpstreamType::Api, upstream_tx_id, pool).await?;
    if amount <= Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "reward amount must be positive",
        ));
    }
    let amount = quantize(amount);

    let mut tx = pool.begin().await?;
    let user_account = income_tx(
        OwnerType::User,
        user_id,
        amount,
        CreditType::Reward,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    let platform_account = deduction_tx(
        OwnerType::Platform,
        PLATFORM_ACCOUNT_REWARD,
        amount,
        CreditType::Reward,
        ids,
        time_source,
        &mut tx,
    )
    .await?;

    let event_id = insert_event_tx(
        EventRecord::simple(
            EventType::Reward,
            upstream_tx_id,
            Direction::Income,
            &user_account,
            amount,
            CreditType::Reward,
            note,
        ),
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        user_account.id,
        event_id,
        TxType::Reward,
        CreditDebit::Credit,
        amount,
        CreditType::Reward,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        platform_account.id,
        event_id,
        TxType::Reward,
        CreditDebit::Debit,
        amount,
        CreditType::Reward,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    tracing::info!("Rewarded {} credits to user {}", amount, user_id);
    Ok(user_account)
}

/// Manually adjust a user's named pool by a signed amount.
///
/// Positive amounts credit the user and debit the platform adjustment
/// account; negative amounts do the reverse. A negative adjustment may
/// drive the pool to exactly zero but never below.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(ids, time_source, pool))]
pub async fn adjustment(
    user_id: &str,
    credit_type: CreditType,
    amount: Decimal,
    upstream_tx_id: &str,
    note: &str,
    ids: &IdGenerator,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CreditAccount, StoreError> {
    check_upstream_tx_unused(UpstreamType::Api, upstream_tx_id, pool).await?;
    if amount == Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "adjustment amount cannot be zero",
        ));
    }
    if note.is_empty() {
        return Err(StoreError::MissingNote);
    }

    let is_income = amount > Decimal::ZERO;
    let abs_amount = quantize(amount.abs());
    let direction = if is_income {
        Direction::Income
    } else {
        Direction::Expense
    };

    let mut tx = pool.begin().await?;
    let user_account = if is_income {
        income_tx(
            OwnerType::User,
            user_id,
            abs_amount,
            credit_type,
            ids,
            time_source,
            &mut tx,
        )
        .await?
    } else {
        deduction_tx(
            OwnerType::User,
            user_id,
            abs_amount,
            credit_type,
            ids,
            time_source,
            &mut tx,
        )
        .await?
    };
    let platform_account = if is_income {
        deduction_tx(
            OwnerType::Platform,
            PLATFORM_ACCOUNT_ADJUSTMENT,
            abs_amount,
            credit_type,
            ids,
            time_source,
            &mut tx,
        )
        .await?
    } else {
        income_tx(
            OwnerType::Platform,
            PLATFORM_ACCOUNT_ADJUSTMENT,
            abs_amount,
            credit_type,
            ids,
            time_source,
            &mut tx,
        )
        .await?
    };

    let event_id = insert_event_tx(
        EventRecord::simple(
            EventType::Adjustment,
            upstream_tx_id,
            direction,
            &user_account,
            abs_amount,
            credit_type,
            Some(note),
        ),
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    let (user_side, platform_side) = if is_income {
        (CreditDebit::Credit, CreditDebit::Debit)
    } else {
        (CreditDebit::Debit, CreditDebit::Credit)
    };
    insert_leg_tx(
        user_account.id,
        event_id,
        TxType::Adjustment,
        user_side,
        abs_amount,
        credit_type,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        platform_account.id,
        event_id,
        TxType::Adjustment,
        platform_side,
        abs_amount,
        credit_type,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        "Adjusted user {} {} pool by {}",
        user_id,
        credit_type,
        amount
    );
    Ok(user_account)
}

/// Deduct message costs from a user, splitting fees to the platform and
/// (when the user does not own the agent) the agent.
///
/// The user pays `base + platform fee + agent fee` through the tri-pool
/// deduction; both fee shares are credited into the same pool the deduction
/// bottomed out in. `message_id` doubles as the executor-side upstream
/// transaction id, so a message can be expensed at most once.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(platform_fee_percentage, ids, time_source, pool))]
pub async fn expense_message(
    agent_id: &str,
    user_id: &str,
    message_id: &str,
    start_message_id: &str,
    base_llm_amount: Decimal,
    agent_fee_percentage: Decimal,
    agent_owner_id: &str,
    platform_fee_percentage: Decimal,
    ids: &IdGenerator,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CreditAccount, StoreError> {
    check_upstream_tx_unused(UpstreamType::Executor, message_id, pool)
        .await?;
    if base_llm_amount < Decimal::ZERO {
        return Err(StoreError::InvalidAmount(
            "base LLM amount must be non-negative",
        ));
    }

    let base_original_amount = quantize(base_llm_amount);
    let base_amount = base_original_amount;
    let fee_platform_amount = quantize(base_amount * platform_fee_percentage);
    // The owner pays no agent fee on their own agent.
    let fee_agent_amount = if user_id != agent_owner_id {
        quantize(base_amount * agent_fee_percentage)
    } else {
        Decimal::ZERO
    };
    let total_amount = base_amount + fee_platform_amount + fee_agent_amount;

    let mut tx = pool.begin().await?;
    let (user_account, credit_type) = expense_tx(
        OwnerType::User,
        user_id,
        total_amount,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    let platform_account = income_tx(
        OwnerType::Platform,
        PLATFORM_ACCOUNT_FEE,
        fee_platform_amount,
        credit_type,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    let agent_account = if fee_agent_amount > Decimal::ZERO {
        Some(
            income_tx(
                OwnerType::Agent,
                agent_id,
                fee_agent_amount,
                credit_type,
                ids,
                time_source,
                &mut tx,
            )
            .await?,
        )
    } else {
        None
    };

    let event_id = insert_event_tx(
        EventRecord {
            event_type: EventType::Message,
            upstream_type: UpstreamType::Executor,
            upstream_tx_id: message_id,
            direction: Direction::Expense,
            account_id: user_account.id,
            total_amount,
            credit_type,
            balance_after: user_account.total_balance(),
            base_amount,
            base_original_amount,
            base_llm_amount: Some(base_original_amount),
            fee_platform_amount: Some(fee_platform_amount),
            fee_agent_amount: Some(fee_agent_amount),
            fee_agent_account: agent_account.as_ref().map(|a| a.id),
            agent_id: Some(agent_id),
            message_id: Some(message_id),
            start_message_id: Some(start_message_id),
            note: None,
        },
        ids,
        time_source,
        &mut tx,
    )
    .await?;

    insert_leg_tx(
        user_account.id,
        event_id,
        TxType::Pay,
        CreditDebit::Debit,
        total_amount,
        credit_type,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    insert_leg_tx(
        platform_account.id,
        event_id,
        TxType::ReceiveFeePlatform,
        CreditDebit::Credit,
        fee_platform_amount,
        credit_type,
        ids,
        time_source,
        &mut tx,
    )
    .await?;
    if let Some(agent_account) = &agent_account {
        insert_leg_tx(
            agent_account.id,
            event_id,
            TxType::ReceiveFeeAgent,
            CreditDebit::Credit,
            fee_agent_amount,
            credit_type,
            ids,
            time_source,
            &mut tx,
        )
        .await?;
    }
    tx.commit().await?;

    tracing::info!(
        "Expensed {} credits from user {} for message {}",
        total_amount,
        user_id,
        message_id
    );
    Ok(user_account)
}

/// Update the free-quota settings on a user account.
///
/// Settings-only: no event and no transaction legs are recorded. The
/// account must already exist, and the resulting refill amount may not
/// exceed the resulting quota.
#[tracing::instrument(skip(time_source, pool))]
pub async fn update_daily_quota(
    user_id: &str,
    free_quota: Option<Decimal>,
    refill_amount: Option<Decimal>,
    note: &str,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CreditAccount, StoreError> {
    if free_quota.is_none() && refill_amount.is_none() {
        return Err(StoreError::InvalidAmount(
            "at least one of free_quota or refill_amount must be provided",
        ));
    }
    if note.is_empty() {
        return Err(StoreError::MissingNote);
    }

    let mut tx = pool.begin().await?;
    let account =
        get_account_for_update_tx(OwnerType::User, user_id, &mut tx)
            .await?
            .ok_or(StoreError::AccountNotFound)?;

    let free_quota = match free_quota {
        Some(quota) if quota <= Decimal::ZERO => {
            return Err(StoreError::InvalidAmount(
                "daily quota must be positive",
            ));
        }
        Some(quota) => quantize(quota),
        None => account.free_quota,
    };
    let refill_amount = match refill_amount {
        Some(refill) if refill < Decimal::ZERO => {
            return Err(StoreError::InvalidAmount(
                "refill amount cannot be negative",
            ));
        }
        Some(refill) => quantize(refill),
        None => account.refill_amount,
    };
    if refill_amount > free_quota {
        return Err(StoreError::InvalidAmount(
            "refill amount cannot exceed daily quota",
        ));
    }

    let account = sqlx::query_as::<_, CreditAccount>(
        "UPDATE credit_accounts
        SET free_quota = $1, refill_amount = $2, updated_at = $3
        WHERE id = $4
        RETURNING *",
    )
    .bind(free_quota)
    .bind(refill_amount)
    .bind(time_source.now().to_sqlx())
    .bind(account.id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(
        "Updated quota settings for user {}: free_quota {}, refill_amount {}",
        user_id,
        free_quota,
        refill_amount
    );
    Ok(account)
}

fn empty_page() -> CreditEventsPage {
    CreditEventsPage {
        events: Vec::new(),
        next_cursor: None,
        has_more: false,
    }
}

/// Fetch-one-extra pagination: truncate to `limit` and report whether more
/// rows remain.
fn paginate(mut events: Vec<CreditEvent>, limit: i64) -> CreditEventsPage {
    let has_more = events.len() as i64 > limit;
    events.truncate(limit.max(0) as usize);
    let next_cursor = events.last().map(|event| event.id);
    CreditEventsPage {
        events,
        next_cursor,
        has_more,
    }
}

/// List a user's events with cursor pagination, newest first.
///
/// The cursor is the id of the last event of the previous page. A missing
/// account yields an empty page rather than an error.
pub async fn list_user_events(
    user_id: &str,
    direction: Direction,
    cursor: Option<EventId>,
    limit: i64,
    event_type: Option<EventType>,
    pool: &PgPool,
) -> Result<CreditEventsPage, StoreError> {
    let Some(account) = get_account(OwnerType::User, user_id, pool).await?
    else {
        return Ok(empty_page());
    };

    let events = sqlx::query_as::<_, CreditEvent>(
        "SELECT * FROM credit_events
        WHERE account_id = $1
          AND direction = $2
          AND ($3::event_type IS NULL OR event_type = $3)
          AND ($4::uuid IS NULL OR id < $4)
        ORDER BY id DESC
        LIMIT $5",
    )
    .bind(account.id)
    .bind(direction)
    .bind(event_type)
    .bind(cursor)
    .bind(limit + 1)
    .fetch_all(pool)
    .await?;

    Ok(paginate(events, limit))
}

/// List message events that paid a fee to the given agent, newest first.
///
/// These events are income for the agent from users' expenses.
pub async fn list_agent_fee_events(
    agent_id: &str,
    cursor: Option<EventId>,
    limit: i64,
    pool: &PgPool,
) -> Result<CreditEventsPage, StoreError> {
    let Some(account) = get_account(OwnerType::Agent, agent_id, pool).await?
    else {
        return Ok(empty_page());
    };

    let events = sqlx::query_as::<_, CreditEvent>(
        "SELECT * FROM credit_events
        WHERE fee_agent_account = $1
          AND fee_agent_amount > 0
          AND ($2::uuid IS NULL OR id < $2)
        ORDER BY id DESC
        LIMIT $3",
    )
    .bind(account.id)
    .bind(cursor)
    .bind(limit + 1)
    .fetch_all(pool)
    .await?;

    Ok(paginate(events, limit))
}

/// Fetch the event recorded for an upstream transaction id.
pub async fn fetch_event_by_upstream_tx_id(
    upstream_tx_id: &str,
    pool: &PgPool,
) -> Result<CreditEvent, StoreError> {
    sqlx::query_as::<_, CreditEvent>(
        "SELECT * FROM credit_events WHERE upstream_tx_id = $1",
    )
    .bind(upstream_tx_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::EventNotFound)
}
