use jiff::Timestamp;
#[cfg(feature = "use-sqlx")]
use jiff_sqlx::Timestamp as SqlxTs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    AccountId, CreditType, Direction, EventId, EventType, UpstreamType,
};

/// One user-visible ledger operation.
///
/// The four `base_*`/`fee_*` amount fields are populated for message
/// expenses; income events carry the amount in `base_amount` and leave the
/// fee fields null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct CreditEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub upstream_type: UpstreamType,
    pub upstream_tx_id: String,
    pub direction: Direction,
    pub account_id: AccountId,
    pub total_amount: Decimal,
    pub credit_type: CreditType,
    /// Sum of the three pools on `account_id` just after this event.
    pub balance_after: Decimal,
    pub base_amount: Decimal,
    pub base_original_amount: Decimal,
    pub base_llm_amount: Option<Decimal>,
    pub fee_platform_amount: Option<Decimal>,
    pub fee_agent_amount: Option<Decimal>,
    pub fee_agent_account: Option<AccountId>,
    pub agent_id: Option<String>,
    pub message_id: Option<String>,
    pub start_message_id: Option<String>,
    pub note: Option<String>,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
}

/// One page of a cursor-paginated event listing.
///
/// `next_cursor` is the id of the last event on the page; pass it back to
/// continue. `has_more` is authoritative (computed by over-fetching one
/// row), so an exactly-full final page does not claim a next page exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditEventsPage {
    pub events: Vec<CreditEvent>,
    pub next_cursor: Option<EventId>,
    pub has_more: bool,
}
