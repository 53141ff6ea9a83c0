// src/config.rs
//! Process configuration: environment variables with sane defaults, plus an
//! optional sources file narrowing which adapters run.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::ingest::types::Source;

const ENV_SOURCES_PATH: &str = "SOURCES_PATH";

const ALL_SOURCES: [Source; 8] = [
    Source::Cpsc,
    Source::FdaFood,
    Source::FdaDrug,
    Source::FdaDevice,
    Source::Usda,
    Source::Nhtsa,
    Source::NhtsaVin,
    Source::Misc,
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub refresh_interval: Duration,
    /// Per-source overrides, e.g. REFRESH_INTERVAL_SECS_NHTSA=7200. The
    /// base tick remains the scheduling granularity.
    pub per_source_interval: std::collections::HashMap<Source, Duration>,
    pub remedy_interval: Duration,
    pub cutoff_days: i64,
    pub http_timeout: Duration,
    pub source_budget: Duration,
    pub flag_after: u32,
    pub cache_dir: PathBuf,
    pub state_path: PathBuf,
    pub max_delivery_attempts: u8,
    pub delivery_backoff: Duration,
    pub demo_seed: bool,
    pub enabled_sources: Option<Vec<Source>>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));

        let enabled_sources = match load_enabled_sources() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "sources file ignored");
                None
            }
        };

        let mut per_source_interval = std::collections::HashMap::new();
        for source in ALL_SOURCES {
            let key = format!(
                "REFRESH_INTERVAL_SECS_{}",
                source.as_str().to_ascii_uppercase()
            );
            if let Some(secs) = std::env::var(&key).ok().and_then(|v| v.parse().ok()) {
                per_source_interval.insert(source, Duration::from_secs(secs));
            }
        }

        Self {
            listen_addr,
            refresh_interval: Duration::from_secs(env_u64("REFRESH_INTERVAL_SECS", 3600)),
            per_source_interval,
            remedy_interval: Duration::from_secs(env_u64("REMEDY_POLL_INTERVAL_SECS", 21_600)),
            cutoff_days: env_u64("RECALL_CUTOFF_DAYS", 90) as i64,
            http_timeout: Duration::from_secs(env_u64("HTTP_TIMEOUT_SECS", 15)),
            source_budget: Duration::from_secs(env_u64("SOURCE_BUDGET_SECS", 300)),
            flag_after: env_u64("SOURCE_FLAG_AFTER", 3) as u32,
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cache")),
            state_path: std::env::var("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("state/recalls.json")),
            max_delivery_attempts: env_u64("DELIVERY_MAX_ATTEMPTS", 3) as u8,
            delivery_backoff: Duration::from_secs(env_u64("DELIVERY_BACKOFF_SECS", 2)),
            demo_seed: env_flag("DEMO_SEED"),
            enabled_sources,
        }
    }
}

/// Load the enabled-source list. Resolution order:
/// 1) $SOURCES_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
/// No file at all means every adapter runs.
pub fn load_enabled_sources() -> Result<Option<Vec<Source>>> {
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("SOURCES_PATH points to non-existent path"));
        }
        return load_sources_from(&pb).map(Some);
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_sources_from(&toml_p).map(Some);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_sources_from(&json_p).map(Some);
    }
    Ok(None)
}

pub fn load_sources_from(path: &Path) -> Result<Vec<Source>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let names = parse_source_names(&content, ext.as_str())?;

    let mut out = Vec::new();
    for name in names {
        match Source::parse(&name) {
            Some(s) => out.push(s),
            None => tracing::warn!(source = %name, "unknown source name in config, skipped"),
        }
    }
    Ok(out)
}

fn parse_source_names(s: &str, hint_ext: &str) -> Result<Vec<String>> {
    let try_toml = hint_ext == "toml" || s.contains("sources");
    if try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    if !try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    Err(anyhow!("unsupported sources file format"))
}

fn parse_toml(s: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct SourcesFile {
        sources: Vec<String>,
    }
    let v: SourcesFile = toml::from_str(s)?;
    Ok(clean_list(v.sources))
}

fn parse_json(s: &str) -> Result<Vec<String>> {
    let v: Vec<String> = serde_json::from_str(s)?;
    Ok(clean_list(v))
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    use std::collections::BTreeSet;
    let mut set = BTreeSet::new();
    for it in items {
        let t = it.trim();
        if !t.is_empty() {
            set.insert(t.to_string());
        }
    }
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn both_formats_parse_and_dedup() {
        let toml = r#"sources = [" cpsc ", "", "usda", "usda"]"#;
        assert_eq!(parse_toml(toml).unwrap(), vec!["cpsc", "usda"]);
        let json = r#"["nhtsa", "  cpsc  ", ""]"#;
        assert_eq!(parse_json(json).unwrap(), vec!["cpsc", "nhtsa"]);
    }

    #[test]
    fn unknown_names_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("sources.json");
        fs::write(&p, r#"["cpsc", "bloomberg", "fda_food"]"#).unwrap();
        let out = load_sources_from(&p).unwrap();
        assert_eq!(out, vec![Source::Cpsc, Source::FdaFood]);
    }

    #[serial_test::serial]
    #[test]
    fn env_path_must_exist() {
        std::env::set_var(ENV_SOURCES_PATH, "/definitely/not/here.toml");
        assert!(load_enabled_sources().is_err());
        std::env::remove_var(ENV_SOURCES_PATH);
    }
}
