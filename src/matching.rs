// src/matching.rs
//! Read-only matching of freshly inserted recalls against user products and
//! saved subscriptions. Produces candidate tuples; all writes happen in the
//! alert generator.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::alerts::{AlertCandidate, AlertChannel, AlertKind, Recipient};
use crate::ingest::types::Source;
use crate::store::Recall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub channel_pref: AlertChannel,
    pub email_opt_in: bool,
}

/// A user-owned item to monitor. Creation and editing belong to the CRUD
/// layer; the pipeline only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub upc: Option<String>,
    pub vin: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionOwner {
    User(u64),
    SlackChannel(String),
    PartnerWebhook(String),
}

/// A saved query: source filter plus free-text product filter. Matching is
/// computed fresh on every run; subscriptions carry no state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub owner: SubscriptionOwner,
    pub source_filter: Option<Source>,
    pub query: String,
    pub channel: AlertChannel,
}

/// Read access to users/products/subscriptions, owned by the out-of-scope
/// CRUD layer and injected into the pipeline.
pub trait UserDirectory: Send + Sync {
    fn users(&self) -> Vec<User>;
    fn products(&self) -> Vec<Product>;
    fn subscriptions(&self) -> Vec<Subscription>;
    fn email_for(&self, user_id: u64) -> Option<String>;
    fn push_tokens_for(&self, user_id: u64) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: Vec<User>,
    products: Vec<Product>,
    subscriptions: Vec<Subscription>,
    push_tokens: HashMap<u64, Vec<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.push(user);
        self
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.products.push(product);
        self
    }

    pub fn with_subscription(mut self, sub: Subscription) -> Self {
        self.subscriptions.push(sub);
        self
    }

    pub fn with_push_token(mut self, user_id: u64, token: impl Into<String>) -> Self {
        self.push_tokens.entry(user_id).or_default().push(token.into());
        self
    }

    /// Small demo population for local runs.
    pub fn demo_seed() -> Self {
        Self::new()
            .with_user(User {
                id: 1,
                email: "demo@example.test".into(),
                channel_pref: AlertChannel::Email,
                email_opt_in: true,
            })
            .with_product(Product {
                id: 1,
                user_id: 1,
                name: "Infant rocker".into(),
                upc: Some("012345678905".into()),
                vin: None,
                brand: Some("Acme".into()),
                category: Some("Nursery".into()),
            })
            .with_subscription(Subscription {
                id: 1,
                owner: SubscriptionOwner::User(1),
                source_filter: Some(Source::Cpsc),
                query: "rocker".into(),
                channel: AlertChannel::Email,
            })
    }
}

impl UserDirectory for InMemoryDirectory {
    fn users(&self) -> Vec<User> {
        self.users.clone()
    }

    fn products(&self) -> Vec<Product> {
        self.products.clone()
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.clone()
    }

    fn email_for(&self, user_id: u64) -> Option<String> {
        self.users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.email.clone())
    }

    fn push_tokens_for(&self, user_id: u64) -> Vec<String> {
        self.push_tokens.get(&user_id).cloned().unwrap_or_default()
    }
}

fn recipient_for(owner: &SubscriptionOwner) -> Recipient {
    match owner {
        SubscriptionOwner::User(id) => Recipient::User(*id),
        SubscriptionOwner::SlackChannel(ch) => Recipient::SlackChannel(ch.clone()),
        SubscriptionOwner::PartnerWebhook(url) => Recipient::PartnerWebhook(url.clone()),
    }
}

/// Candidate set for a batch of new recalls.
///
/// Rule order per recall:
/// 1. exact code membership: product UPC/VIN against the recall's embedded
///    code lists;
/// 2. subscription substring: case-insensitive `product contains query`,
///    scoped by the subscription's source filter;
/// 3. brand+category equality, only when the recall carries no explicit
///    codes.
///
/// Every distinct (recipient, product-or-subscription) pair yields at most
/// one candidate; no ranking between matches.
pub fn find_candidates(recalls: &[Recall], dir: &dyn UserDirectory) -> Vec<AlertCandidate> {
    let users = dir.users();
    let products = dir.products();
    let subscriptions = dir.subscriptions();

    let pref: HashMap<u64, AlertChannel> = users
        .iter()
        .map(|u| (u.id, u.channel_pref))
        .collect();
    let opted_in: HashSet<u64> = users
        .iter()
        .filter(|u| u.email_opt_in)
        .map(|u| u.id)
        .collect();

    let mut out = Vec::new();
    let mut surfaced: HashSet<(Recipient, Option<u64>, Option<u64>, String)> = HashSet::new();

    for recall in recalls {
        let product_lower = recall.product.to_lowercase();
        let has_codes = !recall.upcs.is_empty() || !recall.vins.is_empty();

        // 1. exact UPC / VIN membership
        for p in &products {
            let upc_hit = p
                .upc
                .as_deref()
                .map(|u| recall.upcs.iter().any(|r| r == u))
                .unwrap_or(false);
            let vin_hit = p
                .vin
                .as_deref()
                .map(|v| recall.vins.iter().any(|r| r.eq_ignore_ascii_case(v)))
                .unwrap_or(false);
            if upc_hit || vin_hit {
                push_candidate(
                    &mut out,
                    &mut surfaced,
                    AlertCandidate {
                        recipient: Recipient::User(p.user_id),
                        recall: recall.key.clone(),
                        product_id: Some(p.id),
                        subscription_id: None,
                        channel: pref.get(&p.user_id).copied().unwrap_or(AlertChannel::Email),
                        kind: AlertKind::NewRecall,
                    },
                );
            }
        }

        // 2. subscription substring, scoped by source filter
        for s in &subscriptions {
            if s.query.trim().is_empty() {
                continue;
            }
            if let Some(filter) = s.source_filter {
                if filter != recall.key.source {
                    continue;
                }
            }
            if let SubscriptionOwner::User(uid) = s.owner {
                if !opted_in.contains(&uid) {
                    continue;
                }
            }
            if !product_lower.contains(&s.query.trim().to_lowercase()) {
                continue;
            }
            push_candidate(
                &mut out,
                &mut surfaced,
                AlertCandidate {
                    recipient: recipient_for(&s.owner),
                    recall: recall.key.clone(),
                    product_id: None,
                    subscription_id: Some(s.id),
                    channel: s.channel,
                    kind: AlertKind::NewRecall,
                },
            );
        }

        // 3. brand+category fallback when explicit codes are absent
        if !has_codes {
            if let (Some(rb), Some(rc)) = (recall.brand.as_deref(), recall.category.as_deref()) {
                for p in &products {
                    let brand_eq = p
                        .brand
                        .as_deref()
                        .map(|b| b.eq_ignore_ascii_case(rb))
                        .unwrap_or(false);
                    let category_eq = p
                        .category
                        .as_deref()
                        .map(|c| c.eq_ignore_ascii_case(rc))
                        .unwrap_or(false);
                    if brand_eq && category_eq {
                        push_candidate(
                            &mut out,
                            &mut surfaced,
                            AlertCandidate {
                                recipient: Recipient::User(p.user_id),
                                recall: recall.key.clone(),
                                product_id: Some(p.id),
                                subscription_id: None,
                                channel: pref
                                    .get(&p.user_id)
                                    .copied()
                                    .unwrap_or(AlertChannel::Email),
                                kind: AlertKind::NewRecall,
                            },
                        );
                    }
                }
            }
        }
    }

    out
}

fn push_candidate(
    out: &mut Vec<AlertCandidate>,
    surfaced: &mut HashSet<(Recipient, Option<u64>, Option<u64>, String)>,
    candidate: AlertCandidate,
) {
    let key = (
        candidate.recipient.clone(),
        candidate.product_id,
        candidate.subscription_id,
        candidate.recall.to_string(),
    );
    if surfaced.insert(key) {
        out.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::RecallKey;
    use chrono::TimeZone;

    fn recall(source: Source, id: &str, product: &str) -> Recall {
        let fetched = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        Recall {
            key: RecallKey::new(source, id),
            product: product.into(),
            hazard: None,
            recall_date: None,
            details_url: None,
            classification: None,
            brand: None,
            category: None,
            upcs: vec![],
            vins: vec![],
            raw_payload: serde_json::Value::Null,
            payload_sha256: String::new(),
            fetched_at: fetched,
            inserted_at: fetched,
            remedy_updates: vec![],
        }
    }

    fn user(id: u64) -> User {
        User {
            id,
            email: format!("u{id}@example.test"),
            channel_pref: AlertChannel::Email,
            email_opt_in: true,
        }
    }

    #[test]
    fn upc_membership_matches_product() {
        let mut r = recall(Source::FdaFood, "F-1", "Peanut butter");
        r.upcs = vec!["012345678905".into()];
        let dir = InMemoryDirectory::new()
            .with_user(user(1))
            .with_product(Product {
                id: 10,
                user_id: 1,
                name: "PB jar".into(),
                upc: Some("012345678905".into()),
                vin: None,
                brand: None,
                category: None,
            });
        let c = find_candidates(&[r], &dir);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].recipient, Recipient::User(1));
        assert_eq!(c[0].product_id, Some(10));
    }

    #[test]
    fn subscription_substring_is_case_insensitive_and_source_scoped() {
        let dir = InMemoryDirectory::new()
            .with_user(user(1))
            .with_subscription(Subscription {
                id: 5,
                owner: SubscriptionOwner::User(1),
                source_filter: Some(Source::Cpsc),
                query: "widget".into(),
                channel: AlertChannel::Email,
            });

        let hit = recall(Source::Cpsc, "1", "Widget Deluxe");
        let wrong_source = recall(Source::Usda, "2", "Widget Deluxe");
        let c = find_candidates(&[hit, wrong_source], &dir);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].subscription_id, Some(5));
        assert_eq!(c[0].recall.source, Source::Cpsc);
    }

    #[test]
    fn opted_out_user_subscription_is_skipped() {
        let mut u = user(1);
        u.email_opt_in = false;
        let dir = InMemoryDirectory::new()
            .with_user(u)
            .with_subscription(Subscription {
                id: 5,
                owner: SubscriptionOwner::User(1),
                source_filter: None,
                query: "widget".into(),
                channel: AlertChannel::Email,
            });
        let c = find_candidates(&[recall(Source::Cpsc, "1", "Widget")], &dir);
        assert!(c.is_empty());
    }

    #[test]
    fn brand_category_fallback_requires_absent_codes() {
        let mut with_codes = recall(Source::Cpsc, "1", "Stroller");
        with_codes.brand = Some("Acme".into());
        with_codes.category = Some("Nursery".into());
        with_codes.upcs = vec!["999999999999".into()];

        let mut without_codes = recall(Source::Cpsc, "2", "Stroller");
        without_codes.brand = Some("ACME".into());
        without_codes.category = Some("nursery".into());

        let dir = InMemoryDirectory::new()
            .with_user(user(1))
            .with_product(Product {
                id: 10,
                user_id: 1,
                name: "Stroller".into(),
                upc: None,
                vin: None,
                brand: Some("acme".into()),
                category: Some("Nursery".into()),
            });

        let c = find_candidates(&[with_codes, without_codes], &dir);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].recall.external_id, "2");
    }

    #[test]
    fn multiple_matches_for_one_user_all_surface() {
        let mut r = recall(Source::Cpsc, "1", "Acme Widget");
        r.upcs = vec!["012345678905".into()];
        let dir = InMemoryDirectory::new()
            .with_user(user(1))
            .with_product(Product {
                id: 10,
                user_id: 1,
                name: "Widget".into(),
                upc: Some("012345678905".into()),
                vin: None,
                brand: None,
                category: None,
            })
            .with_subscription(Subscription {
                id: 5,
                owner: SubscriptionOwner::User(1),
                source_filter: None,
                query: "widget".into(),
                channel: AlertChannel::Slack,
            });
        let c = find_candidates(&[r], &dir);
        // one per distinct (recipient, product-or-subscription) pair
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn external_channel_subscription_matches() {
        let dir = InMemoryDirectory::new().with_subscription(Subscription {
            id: 9,
            owner: SubscriptionOwner::SlackChannel("C012AB3CD".into()),
            source_filter: Some(Source::Cpsc),
            query: "widget".into(),
            channel: AlertChannel::Slack,
        });
        let c = find_candidates(&[recall(Source::Cpsc, "1", "Widget")], &dir);
        assert_eq!(c.len(), 1);
        assert_eq!(
            c[0].recipient,
            Recipient::SlackChannel("C012AB3CD".into())
        );
    }
}
