//! Provider webhook effects against the in-process ledger

use async_trait::async_trait;
use cardledger_core::{
    models::{Account, Card, CardStatus, EntryType, Referral, ReferralStatus},
    traits::{LedgerStore, Notifier, ProviderClient},
    AppError, AppResult,
};
use cardledger_db::MemoryLedgerStore;
use cardledger_services::{
    constants::DEFAULT_FEE_PERCENT, GradeService, LogNotifier, RevShareService, WebhookIngestor,
    WebhookOutcome, WebhookPayload,
};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

mock! {
    Sender {}

    #[async_trait]
    impl Notifier for Sender {
        async fn send(&self, endpoint: &str, message: &str) -> AppResult<()>;
    }
}

mock! {
    Provider {}

    #[async_trait]
    impl ProviderClient for Provider {
        async fn card_balance(&self, provider_card_id: &str) -> AppResult<Decimal>;
    }
}

fn seeded_store(balance: Decimal) -> Arc<MemoryLedgerStore> {
    let store = Arc::new(MemoryLedgerStore::new());
    store.insert_account(Account {
        id: 1,
        balance,
        notification_endpoint: Some("chat-1".to_string()),
        ..Default::default()
    });
    store
        .insert_card(Card {
            id: 10,
            account_id: 1,
            card_balance: dec!(5.00),
            provider_card_id: Some("ext-10".to_string()),
            masked_number: Some("411111******1234".to_string()),
            ..Default::default()
        })
        .unwrap();
    store
}

fn ingestor(store: &Arc<MemoryLedgerStore>, notifier: Arc<dyn Notifier>) -> WebhookIngestor {
    let grades = Arc::new(GradeService::new(
        store.clone(),
        store.clone(),
        DEFAULT_FEE_PERCENT,
    ));
    WebhookIngestor::new(store.clone(), grades, notifier)
}

fn event(event_type: &str) -> WebhookPayload {
    WebhookPayload {
        event_type: event_type.to_string(),
        card_id: "ext-10".to_string(),
        ..Default::default()
    }
}

fn capture(tx_id: &str, amount: Decimal) -> WebhookPayload {
    WebhookPayload {
        transaction_id: Some(tx_id.to_string()),
        amount: Some(amount),
        status: Some("approved".to_string()),
        merchant_name: Some("Airline".to_string()),
        ..event("capture")
    }
}

#[tokio::test]
async fn test_capture_debits_without_fee_and_notifies() {
    let store = seeded_store(dec!(100.00));

    let mut sender = MockSender::new();
    sender
        .expect_send()
        .withf(|_, message| {
            message.contains("25.00 RUB")
                && message.contains("*1234")
                && message.contains("Airline")
                && message.contains("75.00")
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let outcome = ingestor(&store, Arc::new(sender))
        .ingest(&capture("tx-1", dec!(25.00)))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed("capture".to_string()));
    assert_eq!(store.account_balance(1), Some(dec!(75.00)));

    let entries = store.entries_for_account(1).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, EntryType::Capture);
    assert_eq!(entries[0].fee, Decimal::ZERO);
    assert_eq!(entries[0].provider_tx_id.as_deref(), Some("tx-1"));
}

#[tokio::test]
async fn test_replayed_event_applies_once() {
    let store = seeded_store(dec!(100.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));
    let payload = capture("tx-dup", dec!(30.00));

    let first = ingestor.ingest(&payload).await.unwrap();
    let second = ingestor.ingest(&payload).await.unwrap();

    assert_eq!(first, WebhookOutcome::Processed("capture".to_string()));
    assert_eq!(second, WebhookOutcome::Duplicate("tx-dup".to_string()));
    assert_eq!(store.entry_count(), 1);
    assert_eq!(store.account_balance(1), Some(dec!(70.00)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_apply_once() {
    let store = seeded_store(dec!(100.00));
    let ingestor = Arc::new(ingestor(&store, Arc::new(LogNotifier::new())));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ingestor = ingestor.clone();
            tokio::spawn(async move { ingestor.ingest(&capture("tx-race", dec!(10.00))).await })
        })
        .collect();

    let mut processed = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            WebhookOutcome::Processed(_) => processed += 1,
            WebhookOutcome::Duplicate(tx_id) => assert_eq!(tx_id, "tx-race"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(store.entry_count(), 1);
    assert_eq!(store.account_balance(1), Some(dec!(90.00)));
}

#[tokio::test]
async fn test_capture_over_balance_is_an_error() {
    let store = seeded_store(dec!(10.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));

    let result = ingestor.ingest(&capture("tx-2", dec!(10.01))).await;

    assert!(matches!(result, Err(AppError::InsufficientBalance { .. })));
    assert_eq!(store.account_balance(1), Some(dec!(10.00)));
    assert_eq!(store.entry_count(), 0);
}

#[tokio::test]
async fn test_unsettled_capture_is_ignored() {
    let store = seeded_store(dec!(100.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));

    let mut payload = capture("tx-3", dec!(10.00));
    payload.status = Some("pending".to_string());

    assert!(matches!(
        ingestor.ingest(&payload).await.unwrap(),
        WebhookOutcome::Ignored(_)
    ));

    // payment_success has no status gate
    let mut payload = capture("tx-4", dec!(10.00));
    payload.event_type = "payment_success".to_string();
    payload.status = None;

    assert_eq!(
        ingestor.ingest(&payload).await.unwrap(),
        WebhookOutcome::Processed("payment_success".to_string())
    );
    assert_eq!(store.account_balance(1), Some(dec!(90.00)));
}

#[tokio::test]
async fn test_refund_credits_account() {
    let store = seeded_store(dec!(40.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));

    let payload = WebhookPayload {
        transaction_id: Some("tx-ref".to_string()),
        amount: Some(dec!(12.50)),
        ..event("reversal")
    };

    assert_eq!(
        ingestor.ingest(&payload).await.unwrap(),
        WebhookOutcome::Processed("reversal".to_string())
    );
    assert_eq!(store.account_balance(1), Some(dec!(52.50)));

    let entries = store.entries_for_account(1).await.unwrap();
    assert_eq!(entries[0].entry_type, EntryType::Refund);
    assert_eq!(entries[0].provider_tx_id.as_deref(), Some("tx-ref"));
}

#[tokio::test]
async fn test_three_ds_only_notifies() {
    let store = seeded_store(dec!(40.00));

    let mut sender = MockSender::new();
    sender
        .expect_send()
        .withf(|_, message| message.contains("482913") && message.contains("Hotel"))
        .times(1)
        .returning(|_, _| Ok(()));
    let ingestor = ingestor(&store, Arc::new(sender));

    let payload = WebhookPayload {
        auth_code: Some("482913".to_string()),
        merchant_name: Some("Hotel".to_string()),
        ..event("3ds_authentication")
    };

    assert!(matches!(
        ingestor.ingest(&payload).await.unwrap(),
        WebhookOutcome::Processed(_)
    ));
    assert_eq!(store.account_balance(1), Some(dec!(40.00)));
    assert_eq!(store.entry_count(), 0);
}

#[tokio::test]
async fn test_balance_update_touches_only_the_card() {
    let store = seeded_store(dec!(40.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));

    let payload = WebhookPayload {
        amount: Some(dec!(17.30)),
        ..event("balance_update")
    };
    ingestor.ingest(&payload).await.unwrap();

    assert_eq!(store.card_snapshot(10).unwrap().card_balance, dec!(17.30));
    assert_eq!(store.account_balance(1), Some(dec!(40.00)));

    // Without an amount and without a provider client there is nothing to sync
    assert!(matches!(
        ingestor.ingest(&event("balance_update")).await.unwrap(),
        WebhookOutcome::Ignored(_)
    ));
}

#[tokio::test]
async fn test_balance_update_falls_back_to_provider() {
    let store = seeded_store(dec!(40.00));

    let mut provider = MockProvider::new();
    provider
        .expect_card_balance()
        .withf(|id| id.starts_with("ext-10"))
        .times(1)
        .returning(|_| Ok(dec!(8.80)));

    let ingestor = ingestor(&store, Arc::new(LogNotifier::new())).with_provider(Arc::new(provider));
    ingestor.ingest(&event("balance_update")).await.unwrap();

    assert_eq!(store.card_snapshot(10).unwrap().card_balance, dec!(8.80));
}

#[tokio::test]
async fn test_unknown_card_and_unknown_kind() {
    let store = seeded_store(dec!(40.00));
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()));

    let mut orphan = capture("tx-5", dec!(1.00));
    orphan.card_id = "ext-404".to_string();
    assert!(matches!(
        ingestor.ingest(&orphan).await,
        Err(AppError::CardNotFound(_))
    ));

    assert!(matches!(
        ingestor.ingest(&event("card_created")).await.unwrap(),
        WebhookOutcome::Ignored(_)
    ));
    assert_eq!(store.entry_count(), 0);
}

#[tokio::test]
async fn test_settled_capture_credits_referrer_once() {
    let store = seeded_store(dec!(100.00));
    store.insert_account(Account {
        id: 2,
        ..Default::default()
    });
    store
        .insert_referral(Referral {
            id: 7,
            referrer_id: 2,
            referred_id: 1,
            status: ReferralStatus::Active,
            ..Default::default()
        })
        .unwrap();
    let ingestor = ingestor(&store, Arc::new(LogNotifier::new()))
        .with_revshare(Arc::new(RevShareService::new(store.clone(), dec!(5))));
    let payload = capture("tx-ref", dec!(40.00));

    ingestor.ingest(&payload).await.unwrap();
    ingestor.ingest(&payload).await.unwrap();

    assert_eq!(store.account_balance(2), Some(dec!(2.00)));
    assert_eq!(store.referral_snapshot(7).unwrap().commission_earned, dec!(2.00));
}

#[tokio::test]
async fn test_settled_capture_applies_to_blocked_card() {
    let store = seeded_store(dec!(100.00));
    store.block_card(10).await.unwrap();

    let outcome = ingestor(&store, Arc::new(LogNotifier::new()))
        .ingest(&capture("tx-late", dec!(10.00)))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed("capture".to_string()));
    assert_eq!(store.account_balance(1), Some(dec!(90.00)));
    assert_eq!(store.card_snapshot(10).unwrap().status, CardStatus::Blocked);
}
