// src/remedy.rs
//! Remedy-update polling: re-fetch a recall's detail page, pull the remedy
//! text out of the HTML, and re-open notification for previously alerted
//! users only when the text actually changed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::alerts::{self, AlertCandidate, AlertChannel, AlertKind, AlertStore, Recipient};
use crate::ingest::http::SourceClient;
use crate::matching::UserDirectory;
use crate::normalize::clean_text;
use crate::notify::DispatcherHandle;
use crate::store::{RecallStore, Stage, Watermarks};

/// Heuristic remedy extraction: a heading containing "remedy" followed by
/// the nearest paragraph; fallback, a bold/strong tag containing "remedy"
/// with its trailing text.
pub fn extract_remedy(html: &str) -> Option<String> {
    static RE_HEADING: OnceCell<Regex> = OnceCell::new();
    let re_heading = RE_HEADING.get_or_init(|| {
        Regex::new(r"(?is)<h[1-6][^>]*>[^<]*remedy[^<]*</h[1-6]>.*?<p[^>]*>(.*?)</p>").unwrap()
    });
    if let Some(cap) = re_heading.captures(html) {
        let text = clean_text(&cap[1]);
        if !text.is_empty() {
            return Some(text);
        }
    }

    static RE_STRONG: OnceCell<Regex> = OnceCell::new();
    let re_strong = RE_STRONG.get_or_init(|| {
        Regex::new(r"(?is)<(?:b|strong)[^>]*>[^<]*remedy[^<]*</(?:b|strong)>\s*:?\s*([^<]+)")
            .unwrap()
    });
    if let Some(cap) = re_strong.captures(html) {
        let text = clean_text(cap[1].trim_start_matches(':'));
        if !text.is_empty() {
            return Some(text);
        }
    }

    None
}

#[derive(Debug, Clone)]
pub struct RemedyPollerConfig {
    /// Per-recall gap between detail-page checks.
    pub min_gap: Duration,
}

impl Default for RemedyPollerConfig {
    fn default() -> Self {
        Self {
            min_gap: Duration::hours(24),
        }
    }
}

#[derive(Debug, Default)]
pub struct RemedyPollSummary {
    pub checked: usize,
    pub updated: usize,
    pub alerts_created: usize,
}

pub struct RemedyPoller {
    store: Arc<RecallStore>,
    alerts: Arc<AlertStore>,
    directory: Arc<dyn UserDirectory>,
    dispatcher: DispatcherHandle,
    client: Arc<SourceClient>,
    watermarks: Arc<Watermarks>,
    config: RemedyPollerConfig,
}

impl RemedyPoller {
    pub fn new(
        store: Arc<RecallStore>,
        alerts: Arc<AlertStore>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: DispatcherHandle,
        client: Arc<SourceClient>,
        watermarks: Arc<Watermarks>,
        config: RemedyPollerConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            directory,
            dispatcher,
            client,
            watermarks,
            config,
        }
    }

    /// One polling pass. Per-recall failures are logged and skipped; the
    /// pass itself always completes.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RemedyPollSummary {
        let mut summary = RemedyPollSummary::default();
        let due = self.store.due_for_remedy_poll(now, self.config.min_gap);

        for recall in due {
            summary.checked += 1;
            let Some(url) = recall.details_url.clone() else {
                continue;
            };
            let html = match self.client.get_text(recall.key.source, &url).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(
                        recall = %recall.key,
                        error = ?e,
                        "remedy detail fetch failed"
                    );
                    continue;
                }
            };
            let Some(remedy) = extract_remedy(&html) else {
                continue;
            };
            let Some(seq) = self.store.append_remedy_update(&recall.key, &remedy, now) else {
                continue;
            };
            counter!("remedy_updates_total").increment(1);
            summary.updated += 1;
            tracing::info!(recall = %recall.key, seq, "remedy text changed");

            summary.alerts_created += self.realert(&recall.key, seq, now);
        }

        self.watermarks.advance(Stage::Remedy, now);
        summary
    }

    /// Re-open notification for everyone previously alerted on this recall.
    /// The update sequence keys the new alerts, so re-polling the same
    /// revision never re-alerts.
    fn realert(&self, key: &crate::ingest::types::RecallKey, seq: u32, now: DateTime<Utc>) -> usize {
        let audience = self.alerts.users_alerted_for(key);
        if audience.is_empty() {
            return 0;
        }
        let pref: std::collections::HashMap<u64, AlertChannel> = self
            .directory
            .users()
            .into_iter()
            .map(|u| (u.id, u.channel_pref))
            .collect();

        let candidates: Vec<AlertCandidate> = audience
            .into_iter()
            .map(|uid| AlertCandidate {
                recipient: Recipient::User(uid),
                recall: key.clone(),
                product_id: None,
                subscription_id: None,
                channel: pref.get(&uid).copied().unwrap_or(AlertChannel::Email),
                kind: AlertKind::RemedyUpdate(seq),
            })
            .collect();

        let by_key = match self.store.get(key) {
            Some(r) => std::collections::HashMap::from([(key.clone(), r)]),
            None => std::collections::HashMap::new(),
        };
        let stats = alerts::generate(&self.alerts, &by_key, &candidates, now);
        for id in &stats.created {
            self.dispatcher.enqueue(*id);
        }
        stats.created.len()
    }
}
