// src/ingest/adapters/cpsc.rs
use std::sync::Arc;

use metrics::counter;

use crate::ingest::adapters::{build_raws, record_array};
use crate::ingest::http::SourceClient;
use crate::ingest::types::{
    dedup_page, CachePolicy, FetchPlan, FetchResult, Source, SourceAdapter,
};

const DEFAULT_URL: &str = "https://www.saferproducts.gov/RestWebServices/Recall?format=json";

/// Envelope keys seen across saferproducts.gov API versions, tried in order.
const RECORD_KEYS: [&str; 4] = ["results", "Results", "recalls", "Recalls"];
const ID_POINTERS: [&str; 2] = ["/RecallID", "/RecallNumber"];

/// CPSC publishes the whole feed in one response; there is no pagination to
/// early-stop, so the cutoff is enforced downstream by the normalizer.
pub struct CpscAdapter {
    client: Arc<SourceClient>,
    url: String,
}

impl CpscAdapter {
    pub fn from_env(client: Arc<SourceClient>) -> Self {
        Self {
            client,
            url: std::env::var("CPSC_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        }
    }

    pub fn with_url(client: Arc<SourceClient>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    fn parse(&self, payload: &serde_json::Value) -> Vec<crate::ingest::types::RawRecall> {
        let records = record_array(payload, &RECORD_KEYS);
        let raws = dedup_page(build_raws(Source::Cpsc, records, &ID_POINTERS));
        counter!("ingest_raw_total", "source" => Source::Cpsc.as_str())
            .increment(raws.len() as u64);
        raws
    }
}

#[async_trait::async_trait]
impl SourceAdapter for CpscAdapter {
    fn source(&self) -> Source {
        Source::Cpsc
    }

    async fn fetch(&self, plan: &FetchPlan) -> FetchResult {
        match self.client.get_json(Source::Cpsc, &self.url).await {
            Ok(payload) => {
                if let Err(e) = self.client.write_snapshot(Source::Cpsc, &payload).await {
                    tracing::warn!(error = ?e, source = "cpsc", "snapshot write failed");
                }
                FetchResult::ok(self.parse(&payload))
            }
            Err(err) => {
                counter!("ingest_source_errors_total", "source" => Source::Cpsc.as_str())
                    .increment(1);
                if plan.cache == CachePolicy::LiveThenCache {
                    if let Ok(payload) = self.client.read_snapshot(Source::Cpsc).await {
                        tracing::warn!(source = "cpsc", "live fetch failed, serving cached snapshot");
                        return FetchResult::failed(self.parse(&payload), err);
                    }
                }
                FetchResult::failed(Vec::new(), err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn adapter() -> CpscAdapter {
        let dir = tempfile::tempdir().expect("tempdir");
        let client =
            Arc::new(SourceClient::new(Duration::from_secs(1), dir.path()).expect("client"));
        CpscAdapter::with_url(client, "http://unused.test")
    }

    #[test]
    fn parses_wrapped_and_deduped_records() {
        let payload = serde_json::json!({
            "Recalls": [
                { "RecallID": 1, "Title": "Widget recall" },
                { "RecallID": 2, "Title": "Other recall" },
                { "RecallID": 1, "Title": "Widget recall (dup)" }
            ]
        });
        let raws = adapter().parse(&payload);
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].external_id, "1");
        assert_eq!(raws[0].payload["Title"], "Widget recall");
    }

    #[test]
    fn empty_envelope_yields_nothing() {
        let raws = adapter().parse(&serde_json::json!({ "unexpected": true }));
        assert!(raws.is_empty());
    }
}
