//! Double-entry credit ledger.
//!
//! Tracks virtual credits for users, agents, and platform-owned bookkeeping
//! accounts. Every balance movement is recorded as one [`CreditEvent`] plus
//! its double-entry [`CreditTransaction`] legs, written atomically inside a
//! single database transaction and deduplicated by an upstream transaction
//! id.
//!
//! The callable surface lives in [`store::credit`]: the five orchestrators
//! (`recharge`, `reward`, `adjustment`, `expense_message`,
//! `update_daily_quota`) and the three queries (`list_user_events`,
//! `list_agent_fee_events`, `fetch_event_by_upstream_tx_id`). The account
//! primitives in [`store`] operate inside a caller-supplied transaction and
//! serialize per-account work on row-level locks.
//!
//! [`CreditEvent`]: payloads::responses::CreditEvent
//! [`CreditTransaction`]: store::CreditTransaction

pub mod id;
pub mod store;
pub mod telemetry;
pub mod time;

use rust_decimal::Decimal;

/// Configuration loaded from environment variables at startup.
///
/// Environment variables can be set directly or loaded from a .env file by
/// the embedding service before calling [`Config::from_env`].
///
/// - `DATABASE_URL`: PostgreSQL connection string (required)
/// - `PAYMENT_FEE_PLATFORM_PERCENTAGE`: platform share applied to every
///   message expense, a decimal in [0, 1] (optional, defaults to 0)
pub struct Config {
    pub database_url: String,
    pub payment_fee_platform_percentage: Decimal,
}

impl Config {
    pub fn from_env() -> Self {
        use std::env::var;

        Config {
            database_url: var("DATABASE_URL").unwrap(),
            payment_fee_platform_percentage: var(
                "PAYMENT_FEE_PLATFORM_PERCENTAGE",
            )
            .ok()
            .map(|v| {
                v.parse()
                    .expect("PAYMENT_FEE_PLATFORM_PERCENTAGE must be a decimal")
            })
            .unwrap_or(Decimal::ZERO),
        }
    }
}
