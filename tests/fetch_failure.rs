// tests/fetch_failure.rs
//
// Failure containment: one source exhausting its retries must not abort the
// others, and a total failure with no cache yields empty + error for that
// source alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;

use recall_sentinel::alerts::AlertStore;
use recall_sentinel::ingest::adapters::cpsc::CpscAdapter;
use recall_sentinel::ingest::http::{BackoffPolicy, SourceClient};
use recall_sentinel::ingest::types::{
    CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};
use recall_sentinel::ingest::{Pipeline, RefreshConfig};
use recall_sentinel::matching::InMemoryDirectory;
use recall_sentinel::notify::{Dispatcher, DispatcherConfig};
use recall_sentinel::store::{RecallStore, Watermarks};
use recall_sentinel::UserDirectory;

struct HealthyAdapter;

#[async_trait]
impl SourceAdapter for HealthyAdapter {
    fn source(&self) -> Source {
        Source::Usda
    }

    async fn fetch(&self, _plan: &FetchPlan) -> FetchResult {
        let date = (Utc::now().date_naive() - chrono::Duration::days(2)).to_string();
        FetchResult::ok(vec![RawRecall {
            source: Source::Usda,
            external_id: "FSIS-1".into(),
            payload: serde_json::json!({
                "title": "Frozen taquitos",
                "link": "https://example.test/fsis-1",
                "published": date,
                "summary": "Foreign material",
            }),
        }])
    }
}

struct BrokenAdapter;

#[async_trait]
impl SourceAdapter for BrokenAdapter {
    fn source(&self) -> Source {
        Source::Cpsc
    }

    async fn fetch(&self, _plan: &FetchPlan) -> FetchResult {
        FetchResult::failed(Vec::new(), anyhow!("connect refused on every retry"))
    }
}

#[tokio::test]
async fn one_broken_source_does_not_abort_the_others() {
    let store = Arc::new(RecallStore::new());
    let alerts = Arc::new(AlertStore::new());
    let directory: Arc<dyn UserDirectory> = Arc::new(InMemoryDirectory::new());
    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store.clone(),
        directory.clone(),
        vec![],
        DispatcherConfig::default(),
    ));
    let pipeline = Pipeline::new(
        store.clone(),
        alerts,
        directory,
        dispatcher.handle(),
        Arc::new(Watermarks::new()),
        vec![Arc::new(BrokenAdapter), Arc::new(HealthyAdapter)],
        RefreshConfig::default(),
    );

    let summary = pipeline
        .run_refresh(CachePolicy::LiveThenCache)
        .await
        .unwrap();
    assert_eq!(summary.new, 1);
    assert_eq!(store.count(), 1);
    assert_eq!(store.all()[0].key.source, Source::Usda);

    let health = pipeline.health_snapshot();
    assert_eq!(health[&Source::Cpsc].consecutive_failures, 1);
    assert!(health[&Source::Cpsc].last_success.is_none());
    assert_eq!(health[&Source::Usda].consecutive_failures, 0);
    assert!(health[&Source::Usda].last_success.is_some());
}

#[tokio::test]
async fn network_failure_with_no_cache_returns_empty_plus_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Arc::new(
        SourceClient::new(Duration::from_millis(200), dir.path())
            .expect("client")
            .with_backoff(BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            }),
    );
    // nothing listens on the discard port; every attempt fails fast
    let adapter = CpscAdapter::with_url(client, "http://127.0.0.1:9/recalls");

    let plan = FetchPlan::new(
        Utc::now().date_naive() - chrono::Duration::days(90),
        CachePolicy::LiveThenCache,
        Default::default(),
    );
    let result = adapter.fetch(&plan).await;
    assert!(result.raw.is_empty());
    assert!(result.error.is_some());
}
