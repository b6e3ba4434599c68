//! Runner configuration from the environment plus the optional source registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use pulse_adapters::AdapterSettings;
use pulse_core::SourceKind;
use pulse_storage::{BackoffPolicy, HttpClientConfig, RetryPolicy, TokenBucketConfig};
use serde::Deserialize;

pub const REGISTRY_FILE: &str = "sources.yaml";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub log_filter: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
    pub parallel_sources: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://pulse.db".to_string()),
            http_timeout_secs: parsed(&lookup, "PULSE_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: lookup("PULSE_USER_AGENT").unwrap_or_else(|| "pulse-ingest/0.1".to_string()),
            max_retries: parsed(&lookup, "PULSE_MAX_RETRIES").unwrap_or(3),
            base_delay_ms: parsed(&lookup, "PULSE_BASE_DELAY_MS").unwrap_or(1000),
            log_filter: lookup("PULSE_LOG").unwrap_or_else(|| "info".to_string()),
            scheduler_enabled: flag("PULSE_SCHEDULER_ENABLED", false),
            sync_cron: lookup("PULSE_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            workspace_root: lookup("PULSE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            parallel_sources: flag("PULSE_PARALLEL_SOURCES", true),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            ..BackoffPolicy::default()
        })
    }

    /// The database layer retries three times, five seconds apart.
    pub fn connect_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
        })
    }

    pub fn http_client_config(&self, registry: &SourceRegistry) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_buckets: registry.token_buckets(),
            ..HttpClientConfig::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

fn parsed<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub seed_keywords: Vec<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Earliest publication date to request (news and guardian).
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
}

fn default_enabled() -> bool {
    true
}

impl SourceEntry {
    fn enabled(kind: SourceKind) -> Self {
        Self {
            kind,
            enabled: true,
            page_size: None,
            language: None,
            subreddit: None,
            limit: None,
            seed_keywords: Vec::new(),
            batch_size: None,
            requests_per_minute: None,
            from_date: None,
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: SourceKind::ALL.into_iter().map(SourceEntry::enabled).collect(),
        }
    }
}

impl SourceRegistry {
    /// A missing file means every source runs with built-in settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn entry(&self, kind: SourceKind) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.kind == kind)
    }

    pub fn is_enabled(&self, kind: SourceKind) -> bool {
        self.entry(kind).map(|s| s.enabled).unwrap_or(false)
    }

    /// Enabled kinds in registry order, first occurrence wins.
    pub fn enabled_kinds(&self) -> Vec<SourceKind> {
        let mut kinds = Vec::new();
        for entry in self.sources.iter().filter(|s| s.enabled) {
            if !kinds.contains(&entry.kind) {
                kinds.push(entry.kind);
            }
        }
        kinds
    }

    pub fn seed_keywords(&self) -> Vec<String> {
        self.entry(SourceKind::Trends)
            .map(|s| s.seed_keywords.clone())
            .unwrap_or_default()
    }

    pub fn token_buckets(&self) -> HashMap<String, TokenBucketConfig> {
        self.sources
            .iter()
            .filter_map(|s| {
                let per_minute = s.requests_per_minute.filter(|n| *n > 0)?;
                Some((
                    s.kind.as_str().to_string(),
                    TokenBucketConfig {
                        capacity: per_minute,
                        refill_every: Duration::from_secs(60) / per_minute,
                    },
                ))
            })
            .collect()
    }

    /// Fold per-source overrides into adapter settings.
    pub fn adapter_settings(&self, retry: RetryPolicy) -> AdapterSettings {
        let mut settings = AdapterSettings {
            retry,
            ..AdapterSettings::default()
        };
        if let Some(news) = self.entry(SourceKind::News) {
            if let Some(page_size) = news.page_size {
                settings.news.page_size = page_size;
            }
            if let Some(language) = &news.language {
                settings.news.language = language.clone();
            }
            settings.news.from_date = news.from_date;
        }
        if let Some(guardian) = self.entry(SourceKind::Guardian) {
            if let Some(page_size) = guardian.page_size {
                settings.guardian.page_size = page_size;
            }
            settings.guardian.from_date = guardian.from_date;
        }
        if let Some(reddit) = self.entry(SourceKind::Reddit) {
            if reddit.subreddit.is_some() {
                settings.reddit.subreddit = reddit.subreddit.clone();
            }
            if let Some(limit) = reddit.limit {
                settings.reddit.limit = limit;
            }
        }
        if let Some(trends) = self.entry(SourceKind::Trends) {
            if let Some(batch_size) = trends.batch_size {
                settings.trends.batch_size = batch_size;
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = IngestConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "sqlite://pulse.db");
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sync_cron, "0 0 6 * * *");
        assert!(!config.scheduler_enabled);
        assert!(config.parallel_sources);
        assert_eq!(config.retry_policy().backoff().base_delay, Duration::from_secs(1));
    }

    #[test]
    fn env_values_override_and_bad_numbers_fall_back() {
        let config = IngestConfig::from_lookup(|name| match name {
            "PULSE_MAX_RETRIES" => Some("5".to_string()),
            "PULSE_HTTP_TIMEOUT_SECS" => Some("soon".to_string()),
            "PULSE_SCHEDULER_ENABLED" => Some("true".to_string()),
            "PULSE_WORKSPACE_ROOT" => Some("/srv/pulse".to_string()),
            _ => None,
        });
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.http_timeout_secs, 30);
        assert!(config.scheduler_enabled);
        assert_eq!(config.registry_path(), PathBuf::from("/srv/pulse/sources.yaml"));
    }

    #[test]
    fn registry_overrides_reach_adapter_settings() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - kind: news
    page_size: 20
    language: de
  - kind: reddit
    subreddit: rust
    limit: 25
    requests_per_minute: 30
  - kind: trends
    seed_keywords: [rust, zig]
    batch_size: 3
  - kind: guardian
    enabled: false
    from_date: "2024-03-01"
"#,
        )
        .unwrap();

        assert_eq!(
            registry.enabled_kinds(),
            vec![SourceKind::News, SourceKind::Reddit, SourceKind::Trends]
        );
        assert!(!registry.is_enabled(SourceKind::Guardian));
        assert_eq!(registry.seed_keywords(), vec!["rust", "zig"]);

        let settings = registry.adapter_settings(RetryPolicy::default());
        assert_eq!(settings.news.page_size, 20);
        assert_eq!(settings.news.language, "de");
        assert_eq!(settings.reddit.subreddit.as_deref(), Some("rust"));
        assert_eq!(settings.reddit.limit, 25);
        assert_eq!(settings.trends.batch_size, 3);
        assert_eq!(settings.guardian.from_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(settings.news.from_date, None);

        let buckets = registry.token_buckets();
        assert_eq!(buckets["reddit"].capacity, 30);
        assert_eq!(buckets["reddit"].refill_every, Duration::from_secs(2));
    }

    #[test]
    fn missing_registry_enables_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join(REGISTRY_FILE)).unwrap();
        assert_eq!(registry.enabled_kinds().len(), 4);
    }
}
