// src/store.rs
//! Canonical recall storage: idempotent upsert keyed by (source, external id),
//! watermark-scoped queries, and a JSON snapshot for restarts.
//!
//! The keyed map behind a single lock is the uniqueness primitive the rest of
//! the pipeline relies on; callers never check-then-insert around it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::ingest::types::{RecallKey, Source};

/// One extracted remedy-text revision. The sequence on a recall is
/// append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedyUpdate {
    pub time: DateTime<Utc>,
    pub text: String,
}

/// Canonical recall entity. Created on first sighting, mutated on every
/// subsequent sighting, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recall {
    pub key: RecallKey,
    pub product: String,
    pub hazard: Option<String>,
    /// None means the upstream date was missing or unparseable; cutoff logic
    /// treats it as "today".
    pub recall_date: Option<NaiveDate>,
    pub details_url: Option<String>,
    pub classification: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub upcs: Vec<String>,
    pub vins: Vec<String>,
    /// Opaque upstream payload, kept for debugging and remedy re-parsing.
    pub raw_payload: serde_json::Value,
    pub payload_sha256: String,
    pub fetched_at: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
    pub remedy_updates: Vec<RemedyUpdate>,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub recall: Recall,
    pub was_new: bool,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<RecallKey, Recall>,
}

pub struct RecallStore {
    inner: Mutex<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl Default for RecallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecallStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Store that can persist itself to `path` as a JSON snapshot.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot_path: Some(path.into()),
        }
    }

    /// Insert-or-update under one lock scope. A concurrent caller with the
    /// same key serializes here; whichever arrives second sees `was_new ==
    /// false`.
    pub fn upsert(&self, fresh: Recall) -> UpsertOutcome {
        let mut inner = self.inner.lock().expect("recall store mutex poisoned");
        match inner.by_key.get_mut(&fresh.key) {
            Some(existing) => {
                existing.product = fresh.product;
                existing.hazard = fresh.hazard;
                existing.recall_date = fresh.recall_date;
                existing.details_url = fresh.details_url;
                existing.classification = fresh.classification;
                existing.brand = fresh.brand;
                existing.category = fresh.category;
                existing.upcs = fresh.upcs;
                existing.vins = fresh.vins;
                existing.raw_payload = fresh.raw_payload;
                existing.payload_sha256 = fresh.payload_sha256;
                existing.fetched_at = fresh.fetched_at;
                // inserted_at and remedy_updates survive re-fetches
                UpsertOutcome {
                    recall: existing.clone(),
                    was_new: false,
                }
            }
            None => {
                let mut recall = fresh;
                recall.inserted_at = recall.fetched_at;
                inner.by_key.insert(recall.key.clone(), recall.clone());
                UpsertOutcome {
                    recall,
                    was_new: true,
                }
            }
        }
    }

    pub fn get(&self, key: &RecallKey) -> Option<Recall> {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        inner.by_key.get(key).cloned()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        inner.by_key.len()
    }

    pub fn all(&self) -> Vec<Recall> {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        let mut rows: Vec<Recall> = inner.by_key.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.inserted_at
                .cmp(&b.inserted_at)
                .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
        });
        rows
    }

    /// External ids already stored for one source; handed to adapters so
    /// newest-first pagination can stop early.
    pub fn external_ids(&self, source: Source) -> HashSet<String> {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        inner
            .by_key
            .keys()
            .filter(|k| k.source == source)
            .map(|k| k.external_id.clone())
            .collect()
    }

    /// Recalls first inserted after `watermark`, oldest first.
    pub fn inserted_since(&self, watermark: DateTime<Utc>) -> Vec<Recall> {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        let mut rows: Vec<Recall> = inner
            .by_key
            .values()
            .filter(|r| r.inserted_at > watermark)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.inserted_at);
        rows
    }

    /// Recalls worth a remedy re-check: from sources that publish updates,
    /// carrying a details URL, whose last activity (last remedy entry, else
    /// the original fetch) is at least `min_gap` old.
    pub fn due_for_remedy_poll(&self, now: DateTime<Utc>, min_gap: Duration) -> Vec<Recall> {
        let inner = self.inner.lock().expect("recall store mutex poisoned");
        let mut rows: Vec<Recall> = inner
            .by_key
            .values()
            .filter(|r| r.key.source.publishes_remedy_updates() && r.details_url.is_some())
            .filter(|r| {
                let last = r
                    .remedy_updates
                    .last()
                    .map(|u| u.time)
                    .unwrap_or(r.fetched_at);
                now.signed_duration_since(last) >= min_gap
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        rows
    }

    /// Append a remedy revision unless it trim-equals the last recorded one.
    /// Returns the 1-based sequence number of the appended entry, or None
    /// when nothing changed (or the recall is unknown).
    pub fn append_remedy_update(
        &self,
        key: &RecallKey,
        text: &str,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock().expect("recall store mutex poisoned");
        let recall = inner.by_key.get_mut(key)?;
        if let Some(last) = recall.remedy_updates.last() {
            if last.text.trim() == trimmed {
                return None;
            }
        }
        recall.remedy_updates.push(RemedyUpdate {
            time: now,
            text: trimmed.to_string(),
        });
        Some(recall.remedy_updates.len() as u32)
    }

    /// Load the snapshot written by a previous run. A missing file is not an
    /// error; returns how many recalls were loaded.
    pub async fn load_snapshot(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };
        let text = match fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        let rows: Vec<Recall> = serde_json::from_str(&text)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        let n = rows.len();
        let mut inner = self.inner.lock().expect("recall store mutex poisoned");
        for r in rows {
            inner.by_key.insert(r.key.clone(), r);
        }
        Ok(n)
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let rows = self.all();
        let bytes = serde_json::to_vec_pretty(&rows).context("serializing recall snapshot")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, bytes)
            .await
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        Ok(())
    }
}

/// Pipeline stages that keep their own "processed up to here" boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Matching,
    Remedy,
}

/// Per-stage high-water marks, advanced only after a stage completes without
/// fatal error. A crash mid-run leaves the mark behind and the next run
/// safely re-processes (every downstream write is idempotent).
#[derive(Default)]
pub struct Watermarks {
    inner: Mutex<HashMap<Stage, DateTime<Utc>>>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stage: Stage) -> DateTime<Utc> {
        let inner = self.inner.lock().expect("watermark mutex poisoned");
        inner.get(&stage).copied().unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Move the mark forward; never backward.
    pub fn advance(&self, stage: Stage, to: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("watermark mutex poisoned");
        let entry = inner.entry(stage).or_insert(DateTime::UNIX_EPOCH);
        if to > *entry {
            *entry = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, fetched_at: DateTime<Utc>) -> Recall {
        Recall {
            key: RecallKey::new(Source::Cpsc, id),
            product: "Widget".into(),
            hazard: Some("Fire".into()),
            recall_date: None,
            details_url: Some("https://example.test/recall/1".into()),
            classification: None,
            brand: None,
            category: None,
            upcs: vec![],
            vins: vec![],
            raw_payload: serde_json::json!({ "RecallID": id }),
            payload_sha256: "abc".into(),
            fetched_at,
            inserted_at: fetched_at,
            remedy_updates: vec![],
        }
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let store = RecallStore::new();
        let first = store.upsert(sample("1", ts(8)));
        assert!(first.was_new);

        let mut again = sample("1", ts(9));
        again.hazard = Some("Burn".into());
        let second = store.upsert(again);
        assert!(!second.was_new);
        assert_eq!(second.recall.hazard.as_deref(), Some("Burn"));
        // identity fields survive the update
        assert_eq!(second.recall.inserted_at, ts(8));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn inserted_since_scopes_to_new_rows() {
        let store = RecallStore::new();
        store.upsert(sample("1", ts(8)));
        store.upsert(sample("2", ts(10)));

        let fresh = store.inserted_since(ts(9));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].key.external_id, "2");
    }

    #[test]
    fn remedy_append_skips_whitespace_only_changes() {
        let store = RecallStore::new();
        let key = RecallKey::new(Source::Cpsc, "1");
        store.upsert(sample("1", ts(8)));

        assert_eq!(store.append_remedy_update(&key, "Refund available", ts(9)), Some(1));
        assert_eq!(
            store.append_remedy_update(&key, "  Refund available \n", ts(10)),
            None
        );
        assert_eq!(
            store.append_remedy_update(&key, "Replacement offered", ts(11)),
            Some(2)
        );
        let recall = store.get(&key).unwrap();
        assert_eq!(recall.remedy_updates.len(), 2);
    }

    #[test]
    fn remedy_poll_respects_min_gap_and_source() {
        let store = RecallStore::new();
        store.upsert(sample("old", ts(0)));
        store.upsert(sample("new", ts(10)));
        let mut fda = sample("fda", ts(0));
        fda.key = RecallKey::new(Source::FdaFood, "fda");
        store.upsert(fda);

        let due = store.due_for_remedy_poll(ts(10), Duration::hours(6));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key.external_id, "old");
    }

    #[test]
    fn watermarks_only_move_forward() {
        let w = Watermarks::new();
        assert_eq!(w.get(Stage::Matching), DateTime::UNIX_EPOCH);
        w.advance(Stage::Matching, ts(10));
        w.advance(Stage::Matching, ts(5));
        assert_eq!(w.get(Stage::Matching), ts(10));
    }
}
