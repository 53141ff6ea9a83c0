// src/ingest/adapters/misc.rs
use std::sync::Arc;

use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use strsim::normalized_levenshtein;

use crate::ingest::http::SourceClient;
use crate::ingest::types::{
    dedup_page, CachePolicy, FetchPlan, FetchResult, RawRecall, Source, SourceAdapter,
};
use crate::normalize::clean_text;

/// Listing titles this similar are treated as re-renders of one notice.
const NEAR_DUP_THRESHOLD: f64 = 0.92;

/// Scraper for recall listings published without an API. The page is
/// expected to mark each notice with a `recall` class; the first anchor
/// inside provides the link and title. Disabled unless MISC_RECALLS_URL is
/// set.
pub struct MiscScrapeAdapter {
    client: Arc<SourceClient>,
    page_url: Option<String>,
}

impl MiscScrapeAdapter {
    pub fn from_env(client: Arc<SourceClient>) -> Self {
        Self {
            client,
            page_url: std::env::var("MISC_RECALLS_URL").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.page_url.is_some()
    }

    pub fn parse_listing(html: &str) -> Vec<RawRecall> {
        static RE_ITEM: OnceCell<Regex> = OnceCell::new();
        let re_item = RE_ITEM.get_or_init(|| {
            Regex::new(r#"(?is)<(article|li|div)[^>]*class="[^"]*recall[^"]*"[^>]*>(.*?)</(article|li|div)>"#)
                .unwrap()
        });
        static RE_ANCHOR: OnceCell<Regex> = OnceCell::new();
        let re_anchor = RE_ANCHOR
            .get_or_init(|| Regex::new(r#"(?is)<a[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap());

        let mut out: Vec<RawRecall> = Vec::new();
        let mut titles: Vec<String> = Vec::new();

        for item in re_item.captures_iter(html) {
            let body = &item[2];
            let Some(anchor) = re_anchor.captures(body) else {
                continue;
            };
            let link = anchor[1].trim().to_string();
            let title = clean_text(&anchor[2]);
            if title.is_empty() {
                continue;
            }

            // collapse re-rendered duplicates of the same notice
            let near_dup = titles
                .iter()
                .any(|t| normalized_levenshtein(t, &title) >= NEAR_DUP_THRESHOLD);
            if near_dup {
                continue;
            }
            titles.push(title.clone());

            let summary = {
                let stripped = re_anchor.replace_all(body, " ");
                let s = clean_text(&stripped);
                (!s.is_empty()).then_some(s)
            };

            out.push(RawRecall {
                source: Source::Misc,
                external_id: slug(&title),
                payload: serde_json::json!({
                    "title": title,
                    "link": link,
                    "published": serde_json::Value::Null,
                    "summary": summary,
                }),
            });
        }

        dedup_page(out)
    }
}

fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

#[async_trait::async_trait]
impl SourceAdapter for MiscScrapeAdapter {
    fn source(&self) -> Source {
        Source::Misc
    }

    async fn fetch(&self, plan: &FetchPlan) -> FetchResult {
        let Some(url) = &self.page_url else {
            return FetchResult::ok(Vec::new());
        };

        match self.client.get_text(Source::Misc, url).await {
            Ok(html) => {
                let snapshot = serde_json::json!({ "html": html });
                if let Err(e) = self.client.write_snapshot(Source::Misc, &snapshot).await {
                    tracing::warn!(error = ?e, source = "misc", "snapshot write failed");
                }
                let raws = Self::parse_listing(&html);
                counter!("ingest_raw_total", "source" => Source::Misc.as_str())
                    .increment(raws.len() as u64);
                FetchResult::ok(raws)
            }
            Err(err) => {
                counter!("ingest_source_errors_total", "source" => Source::Misc.as_str())
                    .increment(1);
                if plan.cache == CachePolicy::LiveThenCache {
                    if let Ok(snapshot) = self.client.read_snapshot(Source::Misc).await {
                        if let Some(html) = snapshot.get("html").and_then(|v| v.as_str()) {
                            tracing::warn!(
                                source = "misc",
                                "live fetch failed, serving cached snapshot"
                            );
                            return FetchResult::failed(Self::parse_listing(html), err);
                        }
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

    const PAGE: &str = r#"
        <html><body>
        <article class="recall-item">
          <a href="/recalls/toy-blocks">Toy Blocks Recalled for Choking Hazard</a>
          <p>Small parts may detach.</p>
        </article>
        <article class="recall-item">
          <a href="/recalls/toy-blocks-2">Toy Blocks Recalled for Choking Hazards</a>
        </article>
        <article class="recall-item">
          <a href="/recalls/space-heater">Space Heaters Recalled for Fire Risk</a>
        </article>
        <div class="promo"><a href="/buy">Buy now</a></div>
        </body></html>
    "#;

    #[test]
    fn listing_extracts_items_and_collapses_near_duplicates() {
        let raws = MiscScrapeAdapter::parse_listing(PAGE);
        assert_eq!(raws.len(), 2);
        assert_eq!(
            raws[0].external_id,
            "toy-blocks-recalled-for-choking-hazard"
        );
        assert_eq!(raws[0].payload["link"], "/recalls/toy-blocks");
        assert_eq!(
            raws[0].payload["summary"],
            "Small parts may detach."
        );
        assert_eq!(
            raws[1].external_id,
            "space-heaters-recalled-for-fire-risk"
        );
    }

    #[test]
    fn slug_is_stable_and_lowercase() {
        assert_eq!(slug("Space Heaters — Fire Risk!"), "space-heaters-fire-risk");
        assert_eq!(slug("   "), "");
    }
}
