// tests/dispatch_retry.rs
//
// Dispatcher state machine: pending -> sent on success, pending -> failed
// with the last error recorded after retry exhaustion, and no re-send of
// rows already marked sent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;

use recall_sentinel::alerts::{
    AlertCandidate, AlertChannel, AlertKind, AlertStatus, AlertStore, InsertOutcome, Recipient,
};
use recall_sentinel::ingest::types::{RecallKey, Source};
use recall_sentinel::matching::{InMemoryDirectory, User};
use recall_sentinel::notify::{
    DeliveryChannel, DeliveryOutcome, DeliveryRequest, Dispatcher, DispatcherConfig,
};
use recall_sentinel::priority::Priority;
use recall_sentinel::store::{Recall, RecallStore};
use recall_sentinel::UserDirectory;

fn store_with_recall() -> (Arc<RecallStore>, RecallKey) {
    let store = Arc::new(RecallStore::new());
    let key = RecallKey::new(Source::Cpsc, "1");
    let now = Utc::now();
    store.upsert(Recall {
        key: key.clone(),
        product: "Widget".into(),
        hazard: Some("Fire".into()),
        recall_date: None,
        details_url: None,
        classification: None,
        brand: None,
        category: None,
        upcs: vec![],
        vins: vec![],
        raw_payload: serde_json::Value::Null,
        payload_sha256: String::new(),
        fetched_at: now,
        inserted_at: now,
        remedy_updates: vec![],
    });
    (store, key)
}

fn directory() -> Arc<dyn UserDirectory> {
    Arc::new(InMemoryDirectory::new().with_user(User {
        id: 1,
        email: "one@example.test".into(),
        channel_pref: AlertChannel::Email,
        email_opt_in: true,
    }))
}

fn insert_alert(alerts: &AlertStore, key: &RecallKey) -> u64 {
    let candidate = AlertCandidate {
        recipient: Recipient::User(1),
        recall: key.clone(),
        product_id: None,
        subscription_id: None,
        channel: AlertChannel::Email,
        kind: AlertKind::NewRecall,
    };
    match alerts.insert(&candidate, Priority::Urgent, Utc::now()) {
        InsertOutcome::Inserted(id) => id,
        InsertOutcome::AlreadyExists => panic!("fresh store cannot hold the alert"),
    }
}

fn config() -> DispatcherConfig {
    DispatcherConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn three_failures_mark_the_alert_failed_with_error() {
    let (store, key) = store_with_recall();
    let alerts = Arc::new(AlertStore::new());
    let id = insert_alert(&alerts, &key);

    struct AlwaysFails;
    #[async_trait]
    impl DeliveryChannel for AlwaysFails {
        fn channel(&self) -> AlertChannel {
            AlertChannel::Email
        }
        async fn deliver(&self, _req: &DeliveryRequest) -> anyhow::Result<()> {
            Err(anyhow!("smtp unavailable"))
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store,
        directory(),
        vec![Arc::new(AlwaysFails)],
        config(),
    ));

    let outcome = dispatcher.deliver_with_retry(id).await;
    assert_eq!(outcome, DeliveryOutcome::Failed);

    let alert = alerts.get(id).unwrap();
    assert_eq!(alert.status, AlertStatus::Failed);
    assert!(alert.last_error.as_deref().unwrap().contains("smtp unavailable"));
    assert!(alert.sent_at.is_none());
}

#[tokio::test]
async fn transient_failure_recovers_within_the_attempt_budget() {
    let (store, key) = store_with_recall();
    let alerts = Arc::new(AlertStore::new());
    let id = insert_alert(&alerts, &key);

    struct FailsTwice {
        calls: AtomicU32,
    }
    #[async_trait]
    impl DeliveryChannel for FailsTwice {
        fn channel(&self) -> AlertChannel {
            AlertChannel::Email
        }
        async fn deliver(&self, _req: &DeliveryRequest) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("timeout"))
            } else {
                Ok(())
            }
        }
    }

    let channel = Arc::new(FailsTwice {
        calls: AtomicU32::new(0),
    });
    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store,
        directory(),
        vec![channel.clone()],
        config(),
    ));

    let outcome = dispatcher.deliver_with_retry(id).await;
    assert_eq!(outcome, DeliveryOutcome::Sent);
    assert_eq!(channel.calls.load(Ordering::SeqCst), 3);

    let alert = alerts.get(id).unwrap();
    assert_eq!(alert.status, AlertStatus::Sent);
    assert!(alert.sent_at.is_some());
    assert!(alert.last_error.is_none());
}

#[tokio::test]
async fn sent_rows_are_never_redelivered() {
    let (store, key) = store_with_recall();
    let alerts = Arc::new(AlertStore::new());
    let id = insert_alert(&alerts, &key);

    struct CountingOk {
        calls: AtomicU32,
    }
    #[async_trait]
    impl DeliveryChannel for CountingOk {
        fn channel(&self) -> AlertChannel {
            AlertChannel::Email
        }
        async fn deliver(&self, _req: &DeliveryRequest) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let channel = Arc::new(CountingOk {
        calls: AtomicU32::new(0),
    });
    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store,
        directory(),
        vec![channel.clone()],
        config(),
    ));

    assert_eq!(dispatcher.deliver_with_retry(id).await, DeliveryOutcome::Sent);
    assert_eq!(dispatcher.deliver_with_retry(id).await, DeliveryOutcome::Skipped);
    assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_transport_fails_permanently_without_retries() {
    let (store, key) = store_with_recall();
    let alerts = Arc::new(AlertStore::new());
    let id = insert_alert(&alerts, &key);

    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store,
        directory(),
        vec![], // nothing configured
        config(),
    ));

    assert_eq!(dispatcher.deliver_with_retry(id).await, DeliveryOutcome::Failed);
    let alert = alerts.get(id).unwrap();
    assert_eq!(alert.status, AlertStatus::Failed);
    assert!(alert
        .last_error
        .as_deref()
        .unwrap()
        .contains("no transport configured"));
}

#[tokio::test]
async fn delivered_alerts_are_broadcast_to_subscribers() {
    let (store, key) = store_with_recall();
    let alerts = Arc::new(AlertStore::new());
    let id = insert_alert(&alerts, &key);

    struct AlwaysOk;
    #[async_trait]
    impl DeliveryChannel for AlwaysOk {
        fn channel(&self) -> AlertChannel {
            AlertChannel::Email
        }
        async fn deliver(&self, _req: &DeliveryRequest) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store,
        directory(),
        vec![Arc::new(AlwaysOk)],
        config(),
    ));

    let mut events = dispatcher.handle().subscribe();
    dispatcher.deliver_with_retry(id).await;

    let event = events.try_recv().expect("delivered alert broadcast");
    assert_eq!(event.alert.id, id);
    assert_eq!(event.product, "Widget");
    assert_eq!(event.alert.status, AlertStatus::Sent);
}
