// src/ingest/types.rs
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Upstream recall publishers we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cpsc,
    FdaFood,
    FdaDrug,
    FdaDevice,
    Usda,
    Nhtsa,
    NhtsaVin,
    Misc,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cpsc => "cpsc",
            Source::FdaFood => "fda_food",
            Source::FdaDrug => "fda_drug",
            Source::FdaDevice => "fda_device",
            Source::Usda => "usda",
            Source::Nhtsa => "nhtsa",
            Source::NhtsaVin => "nhtsa_vin",
            Source::Misc => "misc",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s {
            "cpsc" => Some(Source::Cpsc),
            "fda_food" => Some(Source::FdaFood),
            "fda_drug" => Some(Source::FdaDrug),
            "fda_device" => Some(Source::FdaDevice),
            "usda" => Some(Source::Usda),
            "nhtsa" => Some(Source::Nhtsa),
            "nhtsa_vin" => Some(Source::NhtsaVin),
            "misc" => Some(Source::Misc),
            _ => None,
        }
    }

    /// Sources whose detail pages are known to publish remedy updates
    /// after the initial notice.
    pub fn publishes_remedy_updates(&self) -> bool {
        matches!(self, Source::Cpsc | Source::Nhtsa | Source::NhtsaVin)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dedup key: identity of one recall across fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecallKey {
    pub source: Source,
    pub external_id: String,
}

impl RecallKey {
    pub fn new(source: Source, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for RecallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// One source-specific payload fragment, alive only between an adapter call
/// and normalization. Never persisted as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecall {
    pub source: Source,
    pub external_id: String,
    pub payload: serde_json::Value,
}

/// Whether a fetch may degrade to the last-known-good on-disk snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Attempt the live API; on total failure, read the cached snapshot.
    LiveThenCache,
    /// Live only; total failure returns empty + error.
    LiveOnly,
}

/// Everything an adapter needs for one fetch pass. `seen` is a read-only
/// snapshot of external ids already stored for this adapter's source, so
/// newest-first pagination can stop early without the adapter touching the
/// store itself.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub cutoff: NaiveDate,
    pub cache: CachePolicy,
    pub seen: Arc<HashSet<String>>,
}

impl FetchPlan {
    pub fn new(cutoff: NaiveDate, cache: CachePolicy, seen: HashSet<String>) -> Self {
        Self {
            cutoff,
            cache,
            seen: Arc::new(seen),
        }
    }
}

/// What a fetch pass produced. Retry exhaustion still hands back whatever
/// was accumulated, with the error alongside.
#[derive(Debug)]
pub struct FetchResult {
    pub raw: Vec<RawRecall>,
    pub error: Option<anyhow::Error>,
}

impl FetchResult {
    pub fn ok(raw: Vec<RawRecall>) -> Self {
        Self { raw, error: None }
    }

    pub fn failed(raw: Vec<RawRecall>, error: anyhow::Error) -> Self {
        Self {
            raw,
            error: Some(error),
        }
    }
}

/// Source-specific fetch+parse unit. Implementations are pure with respect
/// to the recall store; persistence is the orchestrator's job.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;
    async fn fetch(&self, plan: &FetchPlan) -> FetchResult;
}

/// Drop duplicate external ids within a single fetched page, keeping the
/// first occurrence.
pub fn dedup_page(raw: Vec<RawRecall>) -> Vec<RawRecall> {
    let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
    raw.into_iter()
        .filter(|r| seen.insert(r.external_id.clone()))
        .collect()
}
