// src/ingest/mod.rs
//! Fetch orchestration: run every registered adapter concurrently, join,
//! normalize the whole batch, upsert, then match + alert scoped to rows
//! inserted since the matching watermark. Each stage commits its own unit
//! of work; re-running any stage is safe.

pub mod adapters;
pub mod http;
pub mod scheduler;
pub mod types;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::alerts::{self, AlertStore};
use crate::ingest::types::{CachePolicy, FetchPlan, FetchResult, Source, SourceAdapter};
use crate::matching::{self, UserDirectory};
use crate::normalize;
use crate::notify::DispatcherHandle;
use crate::store::{Recall, RecallStore, Stage, Watermarks};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_raw_total", "Raw records parsed from sources.");
        describe_counter!("ingest_new_total", "Recalls inserted for the first time.");
        describe_counter!("ingest_updated_total", "Recalls refreshed in place.");
        describe_counter!(
            "ingest_skipped_total",
            "Raw records dropped by the normalizer (unusable or pre-cutoff)."
        );
        describe_counter!("ingest_source_errors_total", "Source fetch/parse errors.");
        describe_counter!("ingest_http_retries_total", "Upstream request retries.");
        describe_counter!(
            "ingest_source_flagged_total",
            "Sources flagged after consecutive failures."
        );
        describe_counter!("alerts_created_total", "Alert rows inserted.");
        describe_counter!(
            "alerts_duplicate_total",
            "Alert inserts collapsed by the uniqueness key."
        );
        describe_counter!("dispatch_sent_total", "Alerts delivered.");
        describe_counter!("dispatch_retries_total", "Delivery attempts that failed.");
        describe_counter!("dispatch_failed_total", "Alerts marked permanently failed.");
        describe_counter!("remedy_updates_total", "Remedy revisions appended.");
        describe_histogram!("refresh_duration_ms", "Wall-clock time of one refresh.");
        describe_gauge!("ingest_last_run_ts", "Unix ts when a refresh last finished.");
    });
}

/// Summary handed back to admin/ops callers after one refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub new: usize,
    pub updated: usize,
    pub total: usize,
    pub alerts_created: usize,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Recalls older than this many days are not worth ingesting.
    pub cutoff_days: i64,
    /// Hard wall-clock budget per source; an overrun abandons that source
    /// only.
    pub source_budget: Duration,
    /// Consecutive failures before a source is flagged for external
    /// alerting.
    pub flag_after: u32,
    /// Optional per-source polling interval. A source with an entry here is
    /// skipped on ticks that arrive before its interval has elapsed; the
    /// scheduler tick is the base granularity.
    pub per_source_interval: HashMap<Source, Duration>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cutoff_days: 90,
            source_budget: Duration::from_secs(300),
            flag_after: 3,
            per_source_interval: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub struct Pipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    store: Arc<RecallStore>,
    alerts: Arc<AlertStore>,
    directory: Arc<dyn UserDirectory>,
    dispatcher: DispatcherHandle,
    watermarks: Arc<Watermarks>,
    health: Mutex<HashMap<Source, SourceHealth>>,
    run_gate: tokio::sync::Mutex<()>,
    config: RefreshConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<RecallStore>,
        alerts: Arc<AlertStore>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: DispatcherHandle,
        watermarks: Arc<Watermarks>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            adapters,
            store,
            alerts,
            directory,
            dispatcher,
            watermarks,
            health: Mutex::new(HashMap::new()),
            run_gate: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// One full refresh: fetch -> normalize -> upsert -> match -> alert.
    /// At most one refresh runs at a time; an overlapping call errors out
    /// and the caller just waits for the next tick (correctness never
    /// depends on this guard, only resource use).
    pub async fn run_refresh(&self, cache: CachePolicy) -> Result<RefreshSummary> {
        ensure_metrics_described();
        let Ok(_gate) = self.run_gate.try_lock() else {
            anyhow::bail!("refresh already running");
        };

        let started = Instant::now();
        let now = Utc::now();
        let cutoff = now.date_naive() - chrono::Duration::days(self.config.cutoff_days);

        let mut join = JoinSet::new();
        for adapter in &self.adapters {
            if !self.source_is_due(adapter.source(), now) {
                tracing::debug!(source = %adapter.source(), "interval not elapsed, skipped");
                continue;
            }
            let adapter = adapter.clone();
            let plan = FetchPlan::new(cutoff, cache, self.store.external_ids(adapter.source()));
            let budget = self.config.source_budget;
            join.spawn(async move {
                let source = adapter.source();
                match tokio::time::timeout(budget, adapter.fetch(&plan)).await {
                    Ok(result) => (source, result),
                    Err(_) => (
                        source,
                        FetchResult::failed(
                            Vec::new(),
                            anyhow::anyhow!("fetch exceeded {}s wall-clock budget", budget.as_secs()),
                        ),
                    ),
                }
            });
        }

        // join point: no partial batches reach the normalizer
        let mut raw_batch = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((source, result)) => {
                    self.note_outcome(source, &result, now);
                    raw_batch.extend(result.raw);
                }
                Err(e) => tracing::warn!(error = ?e, "adapter task panicked"),
            }
        }

        let mut new = 0usize;
        let mut updated = 0usize;
        let mut skipped = 0usize;
        for raw in &raw_batch {
            match normalize::normalize(raw, now, cutoff) {
                Some(recall) => {
                    if self.store.upsert(recall).was_new {
                        new += 1;
                    } else {
                        updated += 1;
                    }
                }
                None => {
                    skipped += 1;
                    tracing::debug!(
                        source = %raw.source,
                        id = %raw.external_id,
                        "record skipped by normalizer"
                    );
                }
            }
        }
        counter!("ingest_new_total").increment(new as u64);
        counter!("ingest_updated_total").increment(updated as u64);
        counter!("ingest_skipped_total").increment(skipped as u64);

        let alerts_created = self.match_and_alert(now);

        if let Err(e) = self.store.save_snapshot().await {
            tracing::warn!(error = ?e, "recall snapshot write failed");
        }

        histogram!("refresh_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        gauge!("ingest_last_run_ts").set(now.timestamp() as f64);

        Ok(RefreshSummary {
            new,
            updated,
            total: self.store.count(),
            alerts_created,
        })
    }

    /// Match + generate alerts for everything inserted since the matching
    /// watermark. Scoping by watermark rather than "this run's inserts"
    /// means a crash between upsert and matching is repaired on the next
    /// pass.
    fn match_and_alert(&self, now: DateTime<Utc>) -> usize {
        let watermark = self.watermarks.get(Stage::Matching);
        let fresh = self.store.inserted_since(watermark);
        if fresh.is_empty() {
            return 0;
        }

        let candidates = matching::find_candidates(&fresh, self.directory.as_ref());
        let by_key: HashMap<_, Recall> =
            fresh.iter().map(|r| (r.key.clone(), r.clone())).collect();
        let stats = alerts::generate(&self.alerts, &by_key, &candidates, now);
        for id in &stats.created {
            self.dispatcher.enqueue(*id);
        }

        let max_inserted = fresh
            .iter()
            .map(|r| r.inserted_at)
            .max()
            .expect("non-empty batch has a max");
        self.watermarks.advance(Stage::Matching, max_inserted);

        stats.created.len()
    }

    /// Whether this source's own polling interval (if any) has elapsed.
    fn source_is_due(&self, source: Source, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.config.per_source_interval.get(&source) else {
            return true;
        };
        let health = self.health.lock().expect("health mutex poisoned");
        match health.get(&source).and_then(|h| h.last_attempt) {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).to_std().unwrap_or_default() >= *interval
            }
        }
    }

    fn note_outcome(&self, source: Source, result: &FetchResult, now: DateTime<Utc>) {
        let mut health = self.health.lock().expect("health mutex poisoned");
        let entry = health.entry(source).or_default();
        entry.last_attempt = Some(now);
        match &result.error {
            None => {
                entry.last_success = Some(now);
                entry.consecutive_failures = 0;
            }
            Some(e) => {
                entry.consecutive_failures += 1;
                tracing::warn!(
                    source = %source,
                    error = ?e,
                    failures = entry.consecutive_failures,
                    salvaged = result.raw.len(),
                    "source fetch failed"
                );
                if entry.consecutive_failures == self.config.flag_after {
                    counter!("ingest_source_flagged_total", "source" => source.as_str())
                        .increment(1);
                    tracing::error!(
                        source = %source,
                        failures = entry.consecutive_failures,
                        "source flagged for external alerting"
                    );
                }
            }
        }
    }

    /// Manual/administrative trigger: refresh, then return the full store.
    pub async fn fetch_all(&self, use_cache: bool) -> Vec<Recall> {
        let policy = if use_cache {
            CachePolicy::LiveThenCache
        } else {
            CachePolicy::LiveOnly
        };
        if let Err(e) = self.run_refresh(policy).await {
            tracing::warn!(error = ?e, "fetch_all refresh did not run");
        }
        self.store.all()
    }

    pub fn health_snapshot(&self) -> HashMap<Source, SourceHealth> {
        self.health.lock().expect("health mutex poisoned").clone()
    }
}
