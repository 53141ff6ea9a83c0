// src/ingest/adapters/fda.rs
use std::sync::Arc;

use metrics::counter;

use crate::ingest::adapters::{build_raws, record_array};
use crate::ingest::http::SourceClient;
use crate::ingest::types::{
    dedup_page, CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};
use crate::normalize::parse_recall_date;

const FOOD_URL: &str =
    "https://api.fda.gov/food/enforcement.json?search=status:%22Ongoing%22&sort=report_date:desc";
const DRUG_URL: &str =
    "https://api.fda.gov/drug/enforcement.json?search=status:%22Ongoing%22&sort=report_date:desc";
const DEVICE_URL: &str =
    "https://api.fda.gov/device/enforcement.json?search=status:%22Ongoing%22&sort=report_date:desc";

const RECORD_KEYS: [&str; 1] = ["results"];
const ID_POINTERS: [&str; 2] = ["/recall_number", "/event_id"];
const DATE_POINTERS: [&str; 2] = ["/recall_initiation_date", "/report_date"];

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

/// openFDA enforcement adapter, shared by the food, drug, and device feeds.
/// Pages newest-first with `skip`, stopping on a short page, an already-seen
/// page, or records older than the cutoff.
pub struct FdaEnforcementAdapter {
    source: Source,
    client: Arc<SourceClient>,
    endpoint: String,
}

impl FdaEnforcementAdapter {
    pub fn food(client: Arc<SourceClient>) -> Self {
        Self {
            source: Source::FdaFood,
            client,
            endpoint: std::env::var("FDA_FOOD_URL").unwrap_or_else(|_| FOOD_URL.to_string()),
        }
    }

    pub fn drug(client: Arc<SourceClient>) -> Self {
        Self {
            source: Source::FdaDrug,
            client,
            endpoint: std::env::var("FDA_DRUG_URL").unwrap_or_else(|_| DRUG_URL.to_string()),
        }
    }

    pub fn device(client: Arc<SourceClient>) -> Self {
        Self {
            source: Source::FdaDevice,
            client,
            endpoint: std::env::var("FDA_DEVICE_URL").unwrap_or_else(|_| DEVICE_URL.to_string()),
        }
    }

    fn page_url(&self, skip: usize) -> String {
        format!("{}&limit={}&skip={}", self.endpoint, PAGE_SIZE, skip)
    }

    fn parse_page(&self, payload: &serde_json::Value) -> Vec<RawRecall> {
        build_raws(
            self.source,
            record_array(payload, &RECORD_KEYS),
            &ID_POINTERS,
        )
    }

    /// True when every record in the page predates the cutoff; with a
    /// newest-first sort there is nothing worth fetching after it.
    fn page_is_stale(&self, raws: &[RawRecall], plan: &FetchPlan) -> bool {
        !raws.is_empty()
            && raws.iter().all(|r| {
                crate::normalize::first_string(&r.payload, &DATE_POINTERS)
                    .and_then(|s| parse_recall_date(&s))
                    .map(|d| d < plan.cutoff)
                    .unwrap_or(false)
            })
    }
}

#[async_trait::async_trait]
impl SourceAdapter for FdaEnforcementAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, plan: &FetchPlan) -> FetchResult {
        let mut collected: Vec<RawRecall> = Vec::new();
        let mut all_records: Vec<serde_json::Value> = Vec::new();
        let mut fetch_error: Option<anyhow::Error> = None;

        for page in 0..MAX_PAGES {
            let url = self.page_url(page * PAGE_SIZE);
            let payload = match self.client.get_json(self.source, &url).await {
                Ok(p) => p,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            };
            let raws = self.parse_page(&payload);
            let page_len = raws.len();
            let seen_hit = raws.iter().any(|r| plan.seen.contains(&r.external_id));
            let stale = self.page_is_stale(&raws, plan);

            all_records.extend(record_array(&payload, &RECORD_KEYS));
            collected.extend(raws);

            // short page = end of feed; seen/stale = nothing older is new
            if page_len < PAGE_SIZE || seen_hit || stale {
                break;
            }
        }

        if let Some(err) = fetch_error {
            counter!("ingest_source_errors_total", "source" => self.source.as_str()).increment(1);
            if collected.is_empty() && plan.cache == CachePolicy::LiveThenCache {
                if let Ok(payload) = self.client.read_snapshot(self.source).await {
                    tracing::warn!(source = %self.source, "live fetch failed, serving cached snapshot");
                    return FetchResult::failed(dedup_page(self.parse_page(&payload)), err);
                }
            }
            return FetchResult::failed(dedup_page(collected), err);
        }

        let snapshot = serde_json::json!({ "results": all_records });
        if let Err(e) = self.client.write_snapshot(self.source, &snapshot).await {
            tracing::warn!(error = ?e, source = %self.source, "snapshot write failed");
        }

        let raws = dedup_page(collected);
        counter!("ingest_raw_total", "source" => self.source.as_str())
            .increment(raws.len() as u64);
        FetchResult::ok(raws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn adapter() -> FdaEnforcementAdapter {
        let dir = tempfile::tempdir().expect("tempdir");
        let client =
            Arc::new(SourceClient::new(Duration::from_secs(1), dir.path()).expect("client"));
        FdaEnforcementAdapter::food(client)
    }

    fn plan(cutoff: &str) -> FetchPlan {
        FetchPlan::new(
            chrono::NaiveDate::parse_from_str(cutoff, "%Y-%m-%d").unwrap(),
            CachePolicy::LiveOnly,
            HashSet::new(),
        )
    }

    #[test]
    fn stale_page_detection_requires_every_record_old() {
        let a = adapter();
        let old = serde_json::json!({
            "recall_number": "F-1", "recall_initiation_date": "20240101"
        });
        let fresh = serde_json::json!({
            "recall_number": "F-2", "recall_initiation_date": "20250601"
        });
        let p = plan("2025-01-01");

        let all_old = a.parse_page(&serde_json::json!({ "results": [old.clone()] }));
        assert!(a.page_is_stale(&all_old, &p));

        let mixed = a.parse_page(&serde_json::json!({ "results": [old, fresh] }));
        assert!(!a.page_is_stale(&mixed, &p));
    }

    #[test]
    fn undated_records_never_count_as_stale() {
        let a = adapter();
        let undated = serde_json::json!({ "recall_number": "F-3" });
        let raws = a.parse_page(&serde_json::json!({ "results": [undated] }));
        assert!(!a.page_is_stale(&raws, &plan("2025-01-01")));
    }

    #[test]
    fn page_url_paginates_with_skip() {
        let a = adapter();
        assert!(a.page_url(0).ends_with("&limit=100&skip=0"));
        assert!(a.page_url(200).ends_with("&limit=100&skip=200"));
    }
}
