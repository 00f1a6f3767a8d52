use ledger::store::{StoreError, credit};
use payloads::{
    CreditDebit, CreditType, Direction, EventType, OwnerType,
    PLATFORM_ACCOUNT_RECHARGE, TxType, UpstreamType,
};
use rust_decimal::Decimal;
use test_helpers::{assert_legs_balanced, spawn_ledger};

#[tokio::test]
async fn recharge_credits_user_and_debits_platform() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let account = credit::recharge(
        "user-1",
        Decimal::new(100, 0),
        "tx-1",
        Some("card payment"),
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    assert_eq!(account.credits, Decimal::new(100, 0));
    assert_eq!(account.free_credits, Decimal::ZERO);
    assert_eq!(account.reward_credits, Decimal::ZERO);

    let platform = app
        .account(OwnerType::Platform, PLATFORM_ACCOUNT_RECHARGE)
        .await?;
    assert_eq!(platform.credits, Decimal::new(-100, 0));

    let event =
        credit::fetch_event_by_upstream_tx_id("tx-1", &app.db_pool).await?;
    assert_eq!(event.event_type, EventType::Recharge);
    assert_eq!(event.upstream_type, UpstreamType::Api);
    assert_eq!(event.direction, Direction::Income);
    assert_eq!(event.account_id, account.id);
    assert_eq!(event.total_amount, Decimal::new(100, 0));
    assert_eq!(event.credit_type, CreditType::Permanent);
    assert_eq!(event.balance_after, Decimal::new(100, 0));
    assert_eq!(event.note.as_deref(), Some("card payment"));

    let legs = app.transactions_for_event(event.id).await?;
    assert_eq!(legs.len(), 2);
    assert_legs_balanced(&legs);
    let user_leg = legs
        .iter()
        .find(|leg| leg.account_id == account.id)
        .unwrap();
    assert_eq!(user_leg.tx_type, TxType::Recharge);
    assert_eq!(user_leg.credit_debit, CreditDebit::Credit);
    assert_eq!(user_leg.change_amount, Decimal::new(100, 0));
    assert_eq!(user_leg.credit_type, CreditType::Permanent);
    let platform_leg = legs
        .iter()
        .find(|leg| leg.account_id == platform.id)
        .unwrap();
    assert_eq!(platform_leg.credit_debit, CreditDebit::Debit);
    assert_eq!(platform_leg.change_amount, Decimal::new(100, 0));

    Ok(())
}

#[tokio::test]
async fn duplicate_recharge_is_rejected() -> anyhow::Result<()> {
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

    let result = credit::recharge(
        "user-1",
        Decimal::new(100, 0),
        "tx-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::DuplicateUpstreamTx)));

    // Balances unchanged, still exactly one event.
    let account = app.account(OwnerType::User, "user-1").await?;
    assert_eq!(account.credits, Decimal::new(100, 0));
    assert_eq!(
        app.event_count_for_upstream(UpstreamType::Api, "tx-1").await?,
        1
    );

    Ok(())
}

#[tokio::test]
async fn recharge_rejects_non_positive_amounts() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    for amount in [Decimal::ZERO, Decimal::new(-5, 0)] {
        let result = credit::recharge(
            "user-1",
            amount,
            "tx-bad",
            None,
            &app.ids,
            &app.time_source,
            &app.db_pool,
        )
        .await;
        assert!(matches!(result, Err(StoreError::InvalidAmount(_))));
    }
    assert_eq!(
        app.event_count_for_upstream(UpstreamType::Api, "tx-bad").await?,
        0
    );

    Ok(())
}

#[tokio::test]
async fn recharges_accumulate_on_the_permanent_pool() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    credit::recharge(
        "user-1",
        Decimal::new(25, 1),
        "tx-1",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    let account = credit::recharge(
        "user-1",
        Decimal::new(75, 1),
        "tx-2",
        None,
        &app.ids,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    assert_eq!(account.credits, Decimal::new(10, 0));
    let platform = app
        .account(OwnerType::Platform, PLATFORM_ACCOUNT_RECHARGE)
        .await?;
    assert_eq!(platform.credits, Decimal::new(-10, 0));

    Ok(())
}

#[tokio::test]
async fn concurrent_duplicate_recharges_commit_exactly_once()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let spawn_recharge = || {
        let pool = app.db_pool.clone();
        let ids = app.ids.clone();
        let time_source = app.time_source.clone();
        tokio::spawn(async move {
            credit::recharge(
                "user-1",
                Decimal::new(100, 0),
                "race-tx",
                None,
                &ids,
                &time_source,
                &pool,
            )
            .await
        })
    };
    let (a, b) = tokio::join!(spawn_recharge(), spawn_recharge());
    let results = [a?, b?];

    // Both racers may pass the advisory check; the unique index decides.
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(StoreError::DuplicateUpstreamTx)))
    );
    assert_eq!(
        app.event_count_for_upstream(UpstreamType::Api, "race-tx")
            .await?,
        1
    );
    let account = app.account(OwnerType::User, "user-1").await?;
    assert_eq!(account.credits, Decimal::new(100, 0));

    Ok(())
}
