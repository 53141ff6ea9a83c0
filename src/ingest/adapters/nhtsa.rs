// src/ingest/adapters/nhtsa.rs
use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;

use crate::ingest::adapters::{build_raws, record_array, record_id};
use crate::ingest::http::SourceClient;
use crate::ingest::types::{
    dedup_page, CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};
use crate::matching::UserDirectory;
use crate::normalize::parse_recall_date;

const DEFAULT_URL: &str = "https://api.nhtsa.gov/Recalls/vehicle";
const DEFAULT_VIN_URL: &str = "https://api.nhtsa.gov/recalls/recallcampaigns?vin={vin}";

const RECORD_KEYS: [&str; 2] = ["results", "Results"];
const ID_POINTERS: [&str; 2] = ["/NHTSACampaignNumber", "/RecallID"];
const DATE_POINTERS: [&str; 2] = ["/ReportReceivedDate", "/RecallDate"];

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 20;

/// Vehicle campaign feed, paged newest-first with `page=`.
pub struct NhtsaCampaignAdapter {
    client: Arc<SourceClient>,
    endpoint: String,
}

impl NhtsaCampaignAdapter {
    pub fn from_env(client: Arc<SourceClient>) -> Self {
        Self {
            client,
            endpoint: std::env::var("NHTSA_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        }
    }

    fn page_url(&self, page: usize) -> String {
        format!("{}?format=json&page={}", self.endpoint, page)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for NhtsaCampaignAdapter {
    fn source(&self) -> Source {
        Source::Nhtsa
    }

    async fn fetch(&self, plan: &FetchPlan) -> FetchResult {
        let mut collected: Vec<RawRecall> = Vec::new();
        let mut all_records: Vec<serde_json::Value> = Vec::new();
        let mut fetch_error: Option<anyhow::Error> = None;

        for page in 1..=MAX_PAGES {
            let url = self.page_url(page);
            let payload = match self.client.get_json(Source::Nhtsa, &url).await {
                Ok(p) => p,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            };
            let records = record_array(&payload, &RECORD_KEYS);
            let raws = build_raws(Source::Nhtsa, records.clone(), &ID_POINTERS);
            let page_len = records.len();
            let seen_hit = raws.iter().any(|r| plan.seen.contains(&r.external_id));
            let stale = !raws.is_empty()
                && raws.iter().all(|r| {
                    crate::normalize::first_string(&r.payload, &DATE_POINTERS)
                        .and_then(|s| parse_recall_date(&s))
                        .map(|d| d < plan.cutoff)
                        .unwrap_or(false)
                });

            all_records.extend(records);
            collected.extend(raws);

            if page_len < PAGE_SIZE || seen_hit || stale {
                break;
            }
        }

        if let Some(err) = fetch_error {
            counter!("ingest_source_errors_total", "source" => Source::Nhtsa.as_str())
                .increment(1);
            if collected.is_empty() && plan.cache == CachePolicy::LiveThenCache {
                if let Ok(payload) = self.client.read_snapshot(Source::Nhtsa).await {
                    tracing::warn!(source = "nhtsa", "live fetch failed, serving cached snapshot");
                    let raws = dedup_page(build_raws(
                        Source::Nhtsa,
                        record_array(&payload, &RECORD_KEYS),
                        &ID_POINTERS,
                    ));
                    return FetchResult::failed(raws, err);
                }
            }
            return FetchResult::failed(dedup_page(collected), err);
        }

        let snapshot = serde_json::json!({ "results": all_records });
        if let Err(e) = self.client.write_snapshot(Source::Nhtsa, &snapshot).await {
            tracing::warn!(error = ?e, source = "nhtsa", "snapshot write failed");
        }

        let raws = dedup_page(collected);
        counter!("ingest_raw_total", "source" => Source::Nhtsa.as_str())
            .increment(raws.len() as u64);
        FetchResult::ok(raws)
    }
}

/// Per-VIN campaign lookups for every VIN registered on a user product.
/// One campaign touching several monitored VINs becomes a single record
/// whose payload carries all of them.
pub struct NhtsaVinAdapter {
    client: Arc<SourceClient>,
    directory: Arc<dyn UserDirectory>,
    url_template: String,
}

impl NhtsaVinAdapter {
    pub fn from_env(client: Arc<SourceClient>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            client,
            directory,
            url_template: std::env::var("NHTSA_VIN_URL")
                .unwrap_or_else(|_| DEFAULT_VIN_URL.to_string()),
        }
    }

    fn monitored_vins(&self) -> Vec<String> {
        let mut vins: Vec<String> = self
            .directory
            .products()
            .into_iter()
            .filter_map(|p| p.vin)
            .map(|v| v.trim().to_ascii_uppercase())
            .filter(|v| !v.is_empty())
            .collect();
        vins.sort();
        vins.dedup();
        vins
    }

    fn label_for(record: &serde_json::Value) -> Option<String> {
        let make = record.get("Make").and_then(|v| v.as_str()).unwrap_or("");
        let model = record.get("Model").and_then(|v| v.as_str()).unwrap_or("");
        let year = record
            .get("ModelYear")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => String::new(),
            })
            .unwrap_or_default();
        let label = [make, model, year.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        (!label.is_empty()).then_some(label)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for NhtsaVinAdapter {
    fn source(&self) -> Source {
        Source::NhtsaVin
    }

    async fn fetch(&self, _plan: &FetchPlan) -> FetchResult {
        let vins = self.monitored_vins();
        if vins.is_empty() {
            return FetchResult::ok(Vec::new());
        }

        // campaign number -> (payload, matched vins)
        let mut campaigns: HashMap<String, (serde_json::Value, Vec<String>)> = HashMap::new();
        let mut fetch_error: Option<anyhow::Error> = None;

        for vin in &vins {
            let url = self.url_template.replace("{vin}", vin);
            let payload = match self.client.get_json(Source::NhtsaVin, &url).await {
                Ok(p) => p,
                Err(e) => {
                    counter!("ingest_source_errors_total", "source" => Source::NhtsaVin.as_str())
                        .increment(1);
                    tracing::warn!(error = ?e, vin = %vin, "vin campaign lookup failed");
                    fetch_error = Some(e);
                    continue;
                }
            };
            for record in record_array(&payload, &RECORD_KEYS) {
                let Some(id) = record_id(&record, &ID_POINTERS) else {
                    continue;
                };
                let entry = campaigns
                    .entry(id)
                    .or_insert_with(|| (record.clone(), Vec::new()));
                if !entry.1.contains(vin) {
                    entry.1.push(vin.clone());
                }
            }
        }

        let mut raws: Vec<RawRecall> = campaigns
            .into_iter()
            .map(|(id, (mut record, vins))| {
                if let Some(label) = Self::label_for(&record) {
                    record["product_label"] = serde_json::Value::String(label);
                }
                record["vins"] = serde_json::json!(vins);
                RawRecall {
                    source: Source::NhtsaVin,
                    external_id: id,
                    payload: record,
                }
            })
            .collect();
        raws.sort_by(|a, b| a.external_id.cmp(&b.external_id));

        counter!("ingest_raw_total", "source" => Source::NhtsaVin.as_str())
            .increment(raws.len() as u64);
        match fetch_error {
            Some(err) => FetchResult::failed(raws, err),
            None => FetchResult::ok(raws),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_composes_make_model_year() {
        let record = serde_json::json!({
            "Make": "ACME", "Model": "Roadster", "ModelYear": 2022
        });
        assert_eq!(
            NhtsaVinAdapter::label_for(&record).as_deref(),
            Some("ACME Roadster 2022")
        );
        assert_eq!(NhtsaVinAdapter::label_for(&serde_json::json!({})), None);
    }
}
