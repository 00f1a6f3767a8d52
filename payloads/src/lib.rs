//! Shared domain types for the credit ledger.
//!
//! Kept separate from the `ledger` crate so that callers (API services,
//! executors, admin tools) can speak the ledger's types without pulling in
//! sqlx. The `use-sqlx` feature adds the database derives.

pub mod responses;

use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved owner ids for the four platform bookkeeping accounts.
///
/// Platform accounts mirror user-side movements: money-in debits `recharge`,
/// promotional grants debit `reward`, manual corrections flow through
/// `adjustment`, and message fees accumulate on `fee`.
pub const PLATFORM_ACCOUNT_RECHARGE: &str = "recharge";
pub const PLATFORM_ACCOUNT_REWARD: &str = "reward";
pub const PLATFORM_ACCOUNT_ADJUSTMENT: &str = "adjustment";
pub const PLATFORM_ACCOUNT_FEE: &str = "fee";

/// Number of fractional digits carried by every credit amount.
///
/// Matches the `NUMERIC(22, 4)` columns, so amounts held in memory are
/// always equal to what the database stores.
pub const CREDIT_SCALE: u32 = 4;

/// Round an amount to the canonical credit scale.
pub fn quantize(amount: Decimal) -> Decimal {
    amount.round_dp(CREDIT_SCALE)
}

/// Id type wrappers help ensure we don't mix up ids for different tables.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct AccountId(pub Uuid);

/// Event ids are UUIDv7, so ordering by id equals ordering by creation
/// time. They double as pagination cursors.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct EventId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TxId(pub Uuid);

/// Who an account belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "owner_type", rename_all = "snake_case")
)]
pub enum OwnerType {
    User,
    Agent,
    Platform,
}

/// The three balance pools on an account.
///
/// Expenses consume them in the fixed order free -> reward -> permanent;
/// that ordering is a behavioral law of the ledger, not a property of this
/// enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "credit_type", rename_all = "snake_case")
)]
pub enum CreditType {
    Permanent,
    Free,
    Reward,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "event_type", rename_all = "snake_case")
)]
pub enum EventType {
    Recharge,
    Reward,
    Adjustment,
    Message,
}

/// Which upstream system supplied the idempotency key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "upstream_type", rename_all = "snake_case")
)]
pub enum UpstreamType {
    Api,
    Executor,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "direction", rename_all = "snake_case")
)]
pub enum Direction {
    Income,
    Expense,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "tx_type", rename_all = "snake_case")
)]
pub enum TxType {
    Recharge,
    Reward,
    Adjustment,
    Pay,
    ReceiveFeePlatform,
    ReceiveFeeAgent,
}

/// One side of a double-entry leg.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "credit_debit", rename_all = "snake_case")
)]
pub enum CreditDebit {
    Credit,
    Debit,
}
