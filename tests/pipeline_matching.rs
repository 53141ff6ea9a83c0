// tests/pipeline_matching.rs
//
// The matching -> alert-generation path: the canonical subscription
// scenario, and the at-most-once guarantee when the same batch is processed
// twice (scheduler overlap).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use recall_sentinel::alerts::{self, AlertChannel, AlertStatus, AlertStore};
use recall_sentinel::ingest::types::{
    CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};
use recall_sentinel::ingest::{Pipeline, RefreshConfig};
use recall_sentinel::matching::{
    self, InMemoryDirectory, Subscription, SubscriptionOwner, User,
};
use recall_sentinel::notify::{Dispatcher, DispatcherConfig};
use recall_sentinel::store::{RecallStore, Watermarks};
use recall_sentinel::UserDirectory;

struct StaticAdapter {
    raws: Vec<RawRecall>,
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source(&self) -> Source {
        Source::Cpsc
    }

    async fn fetch(&self, _plan: &FetchPlan) -> FetchResult {
        FetchResult::ok(self.raws.clone())
    }
}

fn widget_raw() -> RawRecall {
    let date = (Utc::now().date_naive() - chrono::Duration::days(3)).to_string();
    RawRecall {
        source: Source::Cpsc,
        external_id: "1".into(),
        payload: serde_json::json!({
            "RecallID": 1,
            "Product": "Widget",
            "Hazard": "Fire",
            "RecallDate": date,
        }),
    }
}

fn subscribed_directory() -> InMemoryDirectory {
    InMemoryDirectory::new()
        .with_user(User {
            id: 1,
            email: "one@example.test".into(),
            channel_pref: AlertChannel::Email,
            email_opt_in: true,
        })
        .with_subscription(Subscription {
            id: 1,
            owner: SubscriptionOwner::User(1),
            source_filter: Some(Source::Cpsc),
            query: "widget".into(),
            channel: AlertChannel::Email,
        })
}

fn build_pipeline(
    raws: Vec<RawRecall>,
    directory: InMemoryDirectory,
) -> (Arc<Pipeline>, Arc<RecallStore>, Arc<AlertStore>) {
    let store = Arc::new(RecallStore::new());
    let alerts = Arc::new(AlertStore::new());
    let directory: Arc<dyn UserDirectory> = Arc::new(directory);
    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store.clone(),
        directory.clone(),
        vec![],
        DispatcherConfig::default(),
    ));
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        alerts.clone(),
        directory,
        dispatcher.handle(),
        Arc::new(Watermarks::new()),
        vec![Arc::new(StaticAdapter { raws })],
        RefreshConfig::default(),
    ));
    (pipeline, store, alerts)
}

#[tokio::test]
async fn matching_subscription_creates_exactly_one_pending_email_alert() {
    let (pipeline, _store, alerts) = build_pipeline(vec![widget_raw()], subscribed_directory());

    let summary = pipeline.run_refresh(CachePolicy::LiveOnly).await.unwrap();
    assert_eq!(summary.new, 1);
    assert_eq!(summary.alerts_created, 1);

    let pending = alerts.by_status(AlertStatus::Pending);
    assert_eq!(pending.len(), 1);
    let alert = &pending[0];
    assert_eq!(
        alert.recipient,
        recall_sentinel::alerts::Recipient::User(1)
    );
    assert_eq!(alert.channel, AlertChannel::Email);
    assert_eq!(alert.recall.to_string(), "cpsc:1");
    assert!(alert.sent_at.is_none());
}

#[tokio::test]
async fn same_recall_delivered_twice_leaves_one_alert() {
    let (pipeline, _store, alerts) = build_pipeline(vec![widget_raw()], subscribed_directory());

    pipeline.run_refresh(CachePolicy::LiveOnly).await.unwrap();
    let second = pipeline.run_refresh(CachePolicy::LiveOnly).await.unwrap();

    assert_eq!(second.alerts_created, 0);
    assert_eq!(alerts.count(), 1);
}

#[tokio::test]
async fn double_generation_over_the_same_batch_is_collapsed_by_the_store() {
    let store = RecallStore::new();
    let alerts = AlertStore::new();
    let directory = subscribed_directory();

    let cutoff = Utc::now().date_naive() - chrono::Duration::days(90);
    let recall =
        recall_sentinel::normalize::normalize(&widget_raw(), Utc::now(), cutoff).unwrap();
    let stored = store.upsert(recall).recall;

    let batch = vec![stored.clone()];
    let by_key = HashMap::from([(stored.key.clone(), stored)]);
    let now = Utc::now();

    // the generator is invoked twice on the same candidates; only the
    // uniqueness key keeps this at one row
    let candidates = matching::find_candidates(&batch, &directory);
    let first = alerts::generate(&alerts, &by_key, &candidates, now);
    let candidates_again = matching::find_candidates(&batch, &directory);
    let second = alerts::generate(&alerts, &by_key, &candidates_again, now);

    assert_eq!(first.created.len(), 1);
    assert!(second.created.is_empty());
    assert_eq!(second.duplicates, 1);
    assert_eq!(alerts.count(), 1);
}
