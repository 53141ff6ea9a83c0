// src/ingest/adapters/usda.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::ingest::http::SourceClient;
use crate::ingest::types::{
    dedup_page, CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};

const DEFAULT_FEED: &str = "https://www.fsis.usda.gov/recalls/rss.xml";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// `Wed, 28 May 2025 14:00:00 GMT` -> `2025-05-28`. Unparseable dates stay
/// absent so the normalizer's cutoff logic treats them as unknown.
fn rfc2822_to_iso_date(ts: &str) -> Option<String> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).date().to_string())
}

/// FSIS recall feed. Single RSS page, newest-first; items become synthetic
/// JSON payloads so the normalizer's rule table stays uniform across
/// sources.
pub struct UsdaFsisAdapter {
    client: Arc<SourceClient>,
    feed_url: String,
}

impl UsdaFsisAdapter {
    pub fn from_env(client: Arc<SourceClient>) -> Self {
        Self {
            client,
            feed_url: std::env::var("USDA_RSS_URL").unwrap_or_else(|_| DEFAULT_FEED.to_string()),
        }
    }

    pub fn parse_feed(xml: &str) -> Result<Vec<RawRecall>> {
        let rss: Rss = from_str(xml).context("parsing fsis rss xml")?;
        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let external_id = it
                .guid
                .as_deref()
                .or(it.link.as_deref())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let Some(external_id) = external_id else { continue };

            let published = it.pub_date.as_deref().and_then(rfc2822_to_iso_date);
            out.push(RawRecall {
                source: Source::Usda,
                external_id,
                payload: serde_json::json!({
                    "title": it.title,
                    "link": it.link,
                    "published": published,
                    "summary": it.description,
                }),
            });
        }
        Ok(dedup_page(out))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for UsdaFsisAdapter {
    fn source(&self) -> Source {
        Source::Usda
    }

    async fn fetch(&self, plan: &FetchPlan) -> FetchResult {
        let body = match self.client.get_text(Source::Usda, &self.feed_url).await {
            Ok(b) => b,
            Err(err) => {
                counter!("ingest_source_errors_total", "source" => Source::Usda.as_str())
                    .increment(1);
                if plan.cache == CachePolicy::LiveThenCache {
                    if let Ok(snapshot) = self.client.read_snapshot(Source::Usda).await {
                        if let Some(xml) = snapshot.get("xml").and_then(|v| v.as_str()) {
                            if let Ok(raws) = Self::parse_feed(xml) {
                                tracing::warn!(
                                    source = "usda",
                                    "live fetch failed, serving cached snapshot"
                                );
                                return FetchResult::failed(raws, err);
                            }
                        }
                    }
                }
                return FetchResult::failed(Vec::new(), err);
            }
        };

        match Self::parse_feed(&body) {
            Ok(raws) => {
                let snapshot = serde_json::json!({ "xml": body });
                if let Err(e) = self.client.write_snapshot(Source::Usda, &snapshot).await {
                    tracing::warn!(error = ?e, source = "usda", "snapshot write failed");
                }
                counter!("ingest_raw_total", "source" => Source::Usda.as_str())
                    .increment(raws.len() as u64);
                FetchResult::ok(raws)
            }
            Err(err) => {
                counter!("ingest_source_errors_total", "source" => Source::Usda.as_str())
                    .increment(1);
                FetchResult::failed(Vec::new(), err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>FSIS Recalls</title>
    <item>
      <title>Acme Foods Recalls Frozen Taquitos</title>
      <link>https://www.fsis.usda.gov/recalls/acme-taquitos</link>
      <guid>FSIS-2025-031</guid>
      <pubDate>Wed, 28 May 2025 14:00:00 GMT</pubDate>
      <description>Possible foreign material contamination.</description>
    </item>
    <item>
      <title>Duplicate Entry</title>
      <guid>FSIS-2025-031</guid>
      <pubDate>Wed, 28 May 2025 14:00:00 GMT</pubDate>
    </item>
    <item>
      <title>No identity at all</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn feed_parses_and_dedupes_by_guid() {
        let raws = UsdaFsisAdapter::parse_feed(FEED).expect("parse");
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].external_id, "FSIS-2025-031");
        assert_eq!(raws[0].payload["published"], "2025-05-28");
        assert_eq!(
            raws[0].payload["title"],
            "Acme Foods Recalls Frozen Taquitos"
        );
    }

    #[test]
    fn bad_pub_date_stays_absent() {
        assert_eq!(rfc2822_to_iso_date("not a date"), None);
        assert_eq!(
            rfc2822_to_iso_date("Wed, 28 May 2025 14:00:00 GMT").as_deref(),
            Some("2025-05-28")
        );
    }

    #[test]
    fn broken_xml_is_an_error() {
        assert!(UsdaFsisAdapter::parse_feed("<rss><channel>").is_err());
    }
}
