// src/normalize.rs
//! Pure RawRecall -> Recall coercion.
//!
//! Every source's field mapping lives in one ordered rule table below:
//! JSON pointers tried first-hit-wins, so the fallback order is data, not
//! scattered `get(..).or(..)` chains. Normalization is deterministic:
//! identical input always yields an identical Recall, which is what makes
//! the store's upsert diffing meaningful.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::ingest::types::{RawRecall, RecallKey, Source};
use crate::store::Recall;

/// Ordered JSON-pointer extraction rules for one source.
pub struct FieldRules {
    pub product: &'static [&'static str],
    pub hazard: &'static [&'static str],
    pub date: &'static [&'static str],
    pub url: &'static [&'static str],
    pub classification: &'static [&'static str],
    pub brand: &'static [&'static str],
    pub category: &'static [&'static str],
    pub upcs: &'static [&'static str],
    pub vins: &'static [&'static str],
}

const CPSC_RULES: FieldRules = FieldRules {
    product: &["/Product", "/Products/0/Name", "/Title"],
    hazard: &["/Hazards/0/Name", "/Hazard"],
    date: &["/RecallDate"],
    url: &["/URL"],
    classification: &[],
    brand: &["/Manufacturers/0/Name", "/Products/0/Manufacturer"],
    category: &["/Products/0/Type"],
    upcs: &["/Products/0/UPC", "/UPC"],
    vins: &[],
};

const FDA_RULES: FieldRules = FieldRules {
    product: &["/product_description"],
    hazard: &["/reason_for_recall"],
    date: &["/recall_initiation_date", "/report_date"],
    url: &["/link"],
    classification: &["/classification"],
    brand: &["/openfda/brand_name/0", "/recalling_firm"],
    category: &["/product_type"],
    upcs: &["/code_info", "/more_code_info"],
    vins: &[],
};

const USDA_RULES: FieldRules = FieldRules {
    product: &["/title"],
    hazard: &["/summary"],
    date: &["/published"],
    url: &["/link"],
    classification: &[],
    brand: &[],
    category: &[],
    upcs: &[],
    vins: &[],
};

const NHTSA_RULES: FieldRules = FieldRules {
    product: &["/Component", "/Model"],
    hazard: &["/Summary"],
    date: &["/ReportReceivedDate", "/RecallDate"],
    url: &["/URL"],
    classification: &[],
    brand: &["/Make"],
    category: &["/Component"],
    upcs: &[],
    vins: &[],
};

const NHTSA_VIN_RULES: FieldRules = FieldRules {
    product: &["/product_label", "/Component", "/Model"],
    hazard: &["/Summary"],
    date: &["/ReportReceivedDate", "/RecallDate"],
    url: &["/URL"],
    classification: &[],
    brand: &["/Make"],
    category: &["/Component"],
    upcs: &[],
    vins: &["/vins", "/vin"],
};

const MISC_RULES: FieldRules = FieldRules {
    product: &["/title"],
    hazard: &["/summary"],
    date: &["/published"],
    url: &["/link"],
    classification: &[],
    brand: &["/brand"],
    category: &["/category"],
    upcs: &[],
    vins: &[],
};

pub fn rules_for(source: Source) -> &'static FieldRules {
    match source {
        Source::Cpsc => &CPSC_RULES,
        Source::FdaFood | Source::FdaDrug | Source::FdaDevice => &FDA_RULES,
        Source::Usda => &USDA_RULES,
        Source::Nhtsa => &NHTSA_RULES,
        Source::NhtsaVin => &NHTSA_VIN_RULES,
        Source::Misc => &MISC_RULES,
    }
}

/// Resolve the first pointer that yields a non-empty scalar. A list value
/// falls back to its first element, which covers upstreams that wrap the
/// product name in an array.
pub(crate) fn first_string(payload: &serde_json::Value, pointers: &[&str]) -> Option<String> {
    for p in pointers {
        let Some(v) = payload.pointer(p) else { continue };
        if let Some(s) = scalar_to_string(v) {
            return Some(s);
        }
        if let Some(arr) = v.as_array() {
            if let Some(s) = arr.first().and_then(scalar_to_string) {
                return Some(s);
            }
        }
    }
    None
}

fn scalar_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Collect tokens from all pointers: arrays contribute string elements,
/// strings are split on commas/whitespace.
fn string_tokens(payload: &serde_json::Value, pointers: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for p in pointers {
        let Some(v) = payload.pointer(p) else { continue };
        match v {
            serde_json::Value::Array(arr) => {
                out.extend(arr.iter().filter_map(scalar_to_string));
            }
            serde_json::Value::String(s) => {
                out.extend(
                    s.split(|c: char| c == ',' || c.is_whitespace())
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                );
            }
            _ => {}
        }
    }
    out
}

fn dedup_preserving_order(tokens: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokens
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// UPC-looking tokens: 12 or 13 digits.
fn extract_upcs(payload: &serde_json::Value, pointers: &[&str]) -> Vec<String> {
    dedup_preserving_order(
        string_tokens(payload, pointers)
            .into_iter()
            .filter(|t| (t.len() == 12 || t.len() == 13) && t.bytes().all(|b| b.is_ascii_digit()))
            .collect(),
    )
}

/// VIN-looking tokens: 17 alphanumeric characters, upper-cased.
fn extract_vins(payload: &serde_json::Value, pointers: &[&str]) -> Vec<String> {
    dedup_preserving_order(
        string_tokens(payload, pointers)
            .into_iter()
            .filter(|t| t.len() == 17 && t.bytes().all(|b| b.is_ascii_alphanumeric()))
            .map(|t| t.to_ascii_uppercase())
            .collect(),
    )
}

/// Parse the date formats seen across upstreams. Unparseable input maps to
/// None, never "now": a bad date must not retroactively satisfy the cutoff.
pub fn parse_recall_date(s: &str) -> Option<NaiveDate> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
            return Some(d);
        }
    }
    // ISO datetime without offset, e.g. "2025-05-30T00:00:00"
    if let Some(prefix) = t.get(0..10) {
        if t.len() > 10 && t.as_bytes().get(10) == Some(&b'T') {
            if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return Some(d);
            }
        }
    }
    None
}

/// Decode entities, strip tags, collapse whitespace. Applied to every
/// free-text field so upstream HTML fragments do not leak into the store.
pub fn clean_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }
    out
}

/// Coerce one raw record into the canonical shape. Returns None when the
/// record is unusable (no id, no product after the fallback chain) or dated
/// before the cutoff; records with unknown dates are treated as today and
/// kept.
pub fn normalize(
    raw: &RawRecall,
    fetched_at: DateTime<Utc>,
    cutoff: NaiveDate,
) -> Option<Recall> {
    let external_id = raw.external_id.trim();
    if external_id.is_empty() {
        return None;
    }
    let rules = rules_for(raw.source);

    let product = first_string(&raw.payload, rules.product).map(|s| clean_text(&s))?;
    if product.is_empty() {
        return None;
    }

    let recall_date =
        first_string(&raw.payload, rules.date).and_then(|s| parse_recall_date(&s));
    if let Some(d) = recall_date {
        if d < cutoff {
            return None;
        }
    }

    let hazard = first_string(&raw.payload, rules.hazard)
        .map(|s| clean_text(&s))
        .filter(|s| !s.is_empty());
    let details_url = first_string(&raw.payload, rules.url)
        .filter(|s| s.starts_with("http://") || s.starts_with("https://"));
    let classification = first_string(&raw.payload, rules.classification);
    let brand = first_string(&raw.payload, rules.brand).map(|s| clean_text(&s));
    let category = first_string(&raw.payload, rules.category).map(|s| clean_text(&s));

    let payload_sha256 = {
        let mut hasher = Sha256::new();
        hasher.update(raw.payload.to_string().as_bytes());
        hex_digest(hasher.finalize().as_slice())
    };

    Some(Recall {
        key: RecallKey::new(raw.source, external_id),
        product,
        hazard,
        recall_date,
        details_url,
        classification,
        brand,
        category,
        upcs: extract_upcs(&raw.payload, rules.upcs),
        vins: extract_vins(&raw.payload, rules.vins),
        raw_payload: raw.payload.clone(),
        payload_sha256,
        fetched_at,
        inserted_at: fetched_at,
        remedy_updates: Vec::new(),
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
