use ledger::store::{StoreError, credit};
use payloads::{Direction, EventId, EventType, OwnerType};
use rust_decimal::Decimal;
use test_helpers::spawn_ledger;

async fn seed_income_events(
    app: &test_helpers::TestLedger,
    user_id: &str,
    count: usize,
) -> anyhow::Result<()> {
    for i in 0..count {
        credit::recharge(
            user_id,
            Decimal::new(10, 0),
            &format!("{user_id}-tx-{i}"),
            None,
            &app.ids,
            &app.time_source,
            &app.db_pool,
        )
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn user_events_paginate_in_descending_id_order() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    seed_income_events(&app, "user-1", 5).await?;

    let mut seen: Vec<EventId> = Vec::new();
    let mut cursor = None;
    loop {
        let page = credit::list_user_events(
            "user-1",
            Direction::Income,
            cursor,
            2,
            None,
            &app.db_pool,
        )
        .await?;
        assert!(page.events.len() <= 2);
        seen.extend(page.events.iter().map(|event| event.id));
        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
    }

    // Every event exactly once, in strictly decreasing id order.
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|pair| pair[0] > pair[1]));

    Ok(())
}

#[tokio::test]
async fn has_more_is_false_on_an_exactly_full_page() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    seed_income_events(&app, "user-1", 4).await?;

    let page = credit::list_user_events(
        "user-1",
        Direction::Income,
        None,
        4,
        None,
        &app.db_pool,
    )
    .await?;
    assert_eq!(page.events.len(), 4);
    assert!(!page.has_more);
    assert!(page.next_cursor.is_some());

    let next = credit::list_user_events(
        "user-1",
        Direction::Income,
        page.next_cursor,
        4,
        None,
        &app.db_pool,
    )
    .await?;
    assert!(next.events.is_empty());
    assert!(next.next_cursor.is_none());
    assert!(!next.has_more);

    Ok(())
}

#[tokio::test]
async fn user_events_filter_by_direction_and_type() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    credit::recharge(
        "user-1",
        Decimal::new(100, 0),
        "tx-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    credit::reward(
        "user-1",
        Decimal::new(5, 0),
        "promo-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    credit::expense_message(
        "agent-1",
        "user-1",
        "msg-1",
        "msg-0",
        Decimal::new(4, 0),
        Decimal::ZERO,
        "user-2",
        Decimal::ZERO,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    let income = credit::list_user_events(
        "user-1",
        Direction::Income,
        None,
        credit::DEFAULT_EVENT_PAGE_SIZE,
        None,
        &app.db_pool,
    )
    .await?;
    assert_eq!(income.events.len(), 2);

    let expenses = credit::list_user_events(
        "user-1",
        Direction::Expense,
        None,
        credit::DEFAULT_EVENT_PAGE_SIZE,
        None,
        &app.db_pool,
    )
    .await?;
    assert_eq!(expenses.events.len(), 1);
    assert_eq!(expenses.events[0].event_type, EventType::Message);

    let rewards = credit::list_user_events(
        "user-1",
        Direction::Income,
        None,
        credit::DEFAULT_EVENT_PAGE_SIZE,
        Some(EventType::Reward),
        &app.db_pool,
    )
    .await?;
    assert_eq!(rewards.events.len(), 1);
    assert_eq!(rewards.events[0].total_amount, Decimal::new(5, 0));

    Ok(())
}

#[tokio::test]
async fn listing_a_missing_account_returns_an_empty_page()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let page = credit::list_user_events(
        "no-such-user",
        Direction::Income,
        None,
        20,
        None,
        &app.db_pool,
    )
    .await?;
    assert!(page.events.is_empty());
    assert!(page.next_cursor.is_none());
    assert!(!page.has_more);

    let page =
        credit::list_agent_fee_events("no-such-agent", None, 20, &app.db_pool)
            .await?;
    assert!(page.events.is_empty());
    assert!(!page.has_more);

    Ok(())
}

#[tokio::test]
async fn agent_fee_events_list_only_fee_bearing_messages()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.seed_pools(
        OwnerType::User,
        "user-1",
        Decimal::new(100, 0),
        Decimal::ZERO,
        Decimal::ZERO,
    )
    .await?;

    for i in 0..3 {
        credit::expense_message(
            "agent-1",
            "user-1",
            &format!("msg-{i}"),
            "msg-0",
            Decimal::new(4, 0),
            Decimal::new(5, 1),
            "user-2",
            Decimal::ZERO,
            &app.ids,
            &app.time_source,
            &app.db_pool,
        )
        .await?;
    }
    // A message from the agent's owner pays no fee and must not appear.
    credit::expense_message(
        "agent-1",
        "user-1",
        "msg-own",
        "msg-0",
        Decimal::new(4, 0),
        Decimal::new(5, 1),
        "user-1",
        Decimal::ZERO,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    let page =
        credit::list_agent_fee_events("agent-1", None, 2, &app.db_pool)
            .await?;
    assert_eq!(page.events.len(), 2);
    assert!(page.has_more);
    assert!(
        page.events
            .iter()
            .all(|event| event.fee_agent_amount == Some(Decimal::new(2, 0)))
    );

    let rest = credit::list_agent_fee_events(
        "agent-1",
        page.next_cursor,
        2,
        &app.db_pool,
    )
    .await?;
    assert_eq!(rest.events.len(), 1);
    assert!(!rest.has_more);
    assert!(rest.events[0].id < page.events[1].id);

    Ok(())
}

#[tokio::test]
async fn events_are_found_by_upstream_tx_id() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    credit::recharge(
        "user-1",
        Decimal::new(100, 0),
        "tx-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    let event =
        credit::fetch_event_by_upstream_tx_id("tx-1", &app.db_pool).await?;
    assert_eq!(event.upstream_tx_id, "tx-1");

    let result =
        credit::fetch_event_by_upstream_tx_id("tx-missing", &app.db_pool)
            .await;
    assert!(matches!(result, Err(StoreError::EventNotFound)));

    Ok(())
}

#[tokio::test]
async fn balance_after_tracks_the_account_through_a_sequence()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;

    credit::recharge(
        "user-1",
        Decimal::new(100, 0),
        "tx-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    credit::reward(
        "user-1",
        Decimal::new(5, 0),
        "promo-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    credit::expense_message(
        "agent-1",
        "user-1",
        "msg-1",
        "msg-0",
        Decimal::new(30, 0),
        Decimal::ZERO,
        "user-2",
        Decimal::ZERO,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    let event =
        credit::fetch_event_by_upstream_tx_id("tx-1", &app.db_pool).await?;
    assert_eq!(event.balance_after, Decimal::new(100, 0));
    let event =
        credit::fetch_event_by_upstream_tx_id("promo-1", &app.db_pool)
            .await?;
    assert_eq!(event.balance_after, Decimal::new(105, 0));
    let event =
        credit::fetch_event_by_upstream_tx_id("msg-1", &app.db_pool).await?;
    assert_eq!(event.balance_after, Decimal::new(75, 0));

    let account = app.account(OwnerType::User, "user-1").await?;
    assert_eq!(account.total_balance(), Decimal::new(75, 0));

    Ok(())
}
