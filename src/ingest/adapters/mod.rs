// src/ingest/adapters/mod.rs
//! One adapter per upstream. Registration is an explicit list, so the set of
//! live sources is visible in one place and in the config.

pub mod cpsc;
pub mod fda;
pub mod misc;
pub mod nhtsa;
pub mod usda;

use std::sync::Arc;

use crate::ingest::http::SourceClient;
use crate::ingest::types::{RawRecall, Source, SourceAdapter};
use crate::matching::UserDirectory;

/// Resolve the record array out of an upstream envelope, trying the listed
/// keys in order. A bare top-level array is accepted as-is.
pub(crate) fn record_array(
    payload: &serde_json::Value,
    keys: &[&str],
) -> Vec<serde_json::Value> {
    if let Some(arr) = payload.as_array() {
        return arr.clone();
    }
    for key in keys {
        if let Some(arr) = payload.get(*key).and_then(|v| v.as_array()) {
            return arr.clone();
        }
    }
    Vec::new()
}

/// Extract the source-assigned id for one record, first pointer wins.
/// Numeric ids are stringified.
pub(crate) fn record_id(record: &serde_json::Value, pointers: &[&str]) -> Option<String> {
    for p in pointers {
        match record.pointer(p) {
            Some(serde_json::Value::String(s)) => {
                let t = s.trim();
                if !t.is_empty() {
                    return Some(t.to_string());
                }
            }
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Records without a usable id are dropped here; everything else becomes a
/// RawRecall carrying the untouched record as payload.
pub(crate) fn build_raws(
    source: Source,
    records: Vec<serde_json::Value>,
    id_pointers: &[&str],
) -> Vec<RawRecall> {
    records
        .into_iter()
        .filter_map(|record| {
            let external_id = record_id(&record, id_pointers)?;
            Some(RawRecall {
                source,
                external_id,
                payload: record,
            })
        })
        .collect()
}

/// The full adapter roster. `enabled` narrows it (config-driven); None means
/// everything.
pub fn registry(
    client: Arc<SourceClient>,
    directory: Arc<dyn UserDirectory>,
    enabled: Option<&[Source]>,
) -> Vec<Arc<dyn SourceAdapter>> {
    let all: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(cpsc::CpscAdapter::from_env(client.clone())),
        Arc::new(fda::FdaEnforcementAdapter::food(client.clone())),
        Arc::new(fda::FdaEnforcementAdapter::drug(client.clone())),
        Arc::new(fda::FdaEnforcementAdapter::device(client.clone())),
        Arc::new(usda::UsdaFsisAdapter::from_env(client.clone())),
        Arc::new(nhtsa::NhtsaCampaignAdapter::from_env(client.clone())),
        Arc::new(nhtsa::NhtsaVinAdapter::from_env(client.clone(), directory)),
        Arc::new(misc::MiscScrapeAdapter::from_env(client)),
    ];
    match enabled {
        None => all,
        Some(sources) => all
            .into_iter()
            .filter(|a| sources.contains(&a.source()))
            .collect(),
    }
}
