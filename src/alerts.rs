// src/alerts.rs
//! Alert rows and their at-most-once creation.
//!
//! The store's unique-key set is the only duplicate guard; the generator
//! never pre-checks existence, so concurrent or re-run batches collapse to
//! one row per (recipient, recall, product, kind).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::ingest::types::RecallKey;
use crate::priority::{self, Priority};
use crate::store::Recall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Email,
    Push,
    Slack,
    Webhook,
}

impl AlertChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannel::Email => "email",
            AlertChannel::Push => "push",
            AlertChannel::Slack => "slack",
            AlertChannel::Webhook => "webhook",
        }
    }
}

/// Who an alert is addressed to. Users get their preferred channel; external
/// owners (Slack channels, partner webhooks) carry their own address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(u64),
    SlackChannel(String),
    PartnerWebhook(String),
}

/// What triggered the alert. Remedy re-alerts carry the 1-based sequence
/// number of the appended update, which keys them separately from the
/// original notice in the uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NewRecall,
    RemedyUpdate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub recipient: Recipient,
    pub recall: RecallKey,
    pub product_id: Option<u64>,
    pub subscription_id: Option<u64>,
    pub channel: AlertChannel,
    pub kind: AlertKind,
    pub priority: Priority,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A (recipient, recall, product-or-subscription) tuple the matcher surfaced.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub recipient: Recipient,
    pub recall: RecallKey,
    pub product_id: Option<u64>,
    pub subscription_id: Option<u64>,
    pub channel: AlertChannel,
    pub kind: AlertKind,
}

/// Insert result as data, so callers branch without catching store errors.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(u64),
    AlreadyExists,
}

type UniqueKey = (Recipient, RecallKey, Option<u64>, AlertKind);

#[derive(Default)]
struct Inner {
    rows: BTreeMap<u64, Alert>,
    unique: HashSet<UniqueKey>,
    next_id: u64,
}

#[derive(Default)]
pub struct AlertStore {
    inner: Mutex<Inner>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt the insert; the unique-key set decides, atomically with the
    /// row write.
    pub fn insert(
        &self,
        candidate: &AlertCandidate,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> InsertOutcome {
        let key: UniqueKey = (
            candidate.recipient.clone(),
            candidate.recall.clone(),
            candidate.product_id,
            candidate.kind,
        );
        let mut inner = self.inner.lock().expect("alert store mutex poisoned");
        if !inner.unique.insert(key) {
            return InsertOutcome::AlreadyExists;
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let alert = Alert {
            id,
            recipient: candidate.recipient.clone(),
            recall: candidate.recall.clone(),
            product_id: candidate.product_id,
            subscription_id: candidate.subscription_id,
            channel: candidate.channel,
            kind: candidate.kind,
            priority,
            status: AlertStatus::Pending,
            created_at: now,
            sent_at: None,
            last_error: None,
        };
        inner.rows.insert(id, alert);
        InsertOutcome::Inserted(id)
    }

    pub fn get(&self, id: u64) -> Option<Alert> {
        let inner = self.inner.lock().expect("alert store mutex poisoned");
        inner.rows.get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.lock().expect("alert store mutex poisoned");
        inner.rows.len()
    }

    pub fn by_status(&self, status: AlertStatus) -> Vec<Alert> {
        let inner = self.inner.lock().expect("alert store mutex poisoned");
        inner
            .rows
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    /// The only transition into Sent; sets the authoritative delivery
    /// timestamp.
    pub fn mark_sent(&self, id: u64, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("alert store mutex poisoned");
        if let Some(a) = inner.rows.get_mut(&id) {
            a.status = AlertStatus::Sent;
            a.sent_at = Some(now);
            a.last_error = None;
        }
    }

    /// Retry exhaustion: record the last error for ops inspection, keep
    /// `sent_at` empty.
    pub fn mark_failed(&self, id: u64, error: &str) {
        let mut inner = self.inner.lock().expect("alert store mutex poisoned");
        if let Some(a) = inner.rows.get_mut(&id) {
            a.status = AlertStatus::Failed;
            a.last_error = Some(error.to_string());
        }
    }

    /// Distinct user recipients that were ever alerted for a recall; the
    /// audience for remedy re-alerts.
    pub fn users_alerted_for(&self, recall: &RecallKey) -> Vec<u64> {
        let inner = self.inner.lock().expect("alert store mutex poisoned");
        let mut ids: Vec<u64> = inner
            .rows
            .values()
            .filter(|a| &a.recall == recall)
            .filter_map(|a| match a.recipient {
                Recipient::User(id) => Some(id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Default)]
pub struct GenerationStats {
    pub created: Vec<u64>,
    pub duplicates: usize,
}

/// Turn candidate tuples into alert rows. Duplicate keys are a no-op signal;
/// each tuple fails or succeeds on its own and the batch always continues.
pub fn generate(
    store: &AlertStore,
    recalls: &HashMap<RecallKey, Recall>,
    candidates: &[AlertCandidate],
    now: DateTime<Utc>,
) -> GenerationStats {
    let mut stats = GenerationStats::default();
    for c in candidates {
        let priority = match recalls.get(&c.recall) {
            Some(r) => priority::classify(r.classification.as_deref(), r.hazard.as_deref()),
            None => Priority::Digest,
        };
        match store.insert(c, priority, now) {
            InsertOutcome::Inserted(id) => {
                counter!("alerts_created_total").increment(1);
                stats.created.push(id);
            }
            InsertOutcome::AlreadyExists => {
                counter!("alerts_duplicate_total").increment(1);
                stats.duplicates += 1;
            }
        }
    }
    stats
}
