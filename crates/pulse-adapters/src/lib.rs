//! Source adapter contract plus one concrete adapter per external API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_core::{sanitize_keyword, RawRecord, SourceKind};
use pulse_storage::{FetchError, HttpFetcher, RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod guardian;
pub mod news;
pub mod reddit;
pub mod trends;

pub use guardian::{GuardianAdapter, GuardianConfig};
pub use news::{NewsAdapter, NewsConfig};
pub use reddit::{subreddit_for_topic, RedditAdapter, RedditConfig};
pub use trends::{keywords_from_records, TrendsAdapter, TrendsConfig};

pub const CRATE_NAME: &str = "pulse-adapters";

/// Parameters shared by every adapter; each adapter reads what applies to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
}

impl FetchQuery {
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            from_date: None,
        }
    }
}

/// `"AI Tools" OR ML` for keywords `["AI Tools", "ML"]`. Each keyword goes
/// through [`sanitize_keyword`] first, so embedded quotes never reach the query.
pub fn or_query(keywords: &[String]) -> Option<String> {
    let terms: Vec<String> = keywords
        .iter()
        .filter_map(|k| sanitize_keyword(k))
        .map(|k| {
            if k.contains(char::is_whitespace) {
                format!("\"{k}\"")
            } else {
                k
            }
        })
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    /// Retries ran out on a retryable failure; records are empty.
    Exhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceFetch {
    pub records: Vec<RawRecord>,
    /// Records the adapter itself rejected before normalization.
    pub excluded: usize,
    /// Keyword batches abandoned after their own retries (trends only).
    pub failed_batches: usize,
    pub status: FetchStatus,
}

impl SourceFetch {
    pub fn complete(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            excluded: 0,
            failed_batches: 0,
            status: FetchStatus::Complete,
        }
    }

    pub fn exhausted(attempts: usize, last_error: impl ToString) -> Self {
        Self {
            records: Vec::new(),
            excluded: 0,
            failed_batches: 0,
            status: FetchStatus::Exhausted {
                attempts,
                last_error: last_error.to_string(),
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == FetchStatus::Complete
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: fatal request error after {attempts} attempt(s): {error}")]
    Fatal {
        source_id: &'static str,
        attempts: usize,
        #[source]
        error: FetchError,
    },
}

impl AdapterError {
    pub fn fatal(source_id: &'static str, error: FetchError) -> Self {
        AdapterError::Fatal {
            source_id,
            attempts: 0,
            error,
        }
    }
}

/// Exhausted retries become an empty, non-fatal fetch; fatal errors propagate.
pub fn settle<T>(source_id: &'static str, result: Result<T, RetryError<FetchError>>) -> Result<Result<T, SourceFetch>, AdapterError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(RetryError::Exhausted { error, attempts }) => {
            warn!(source_id, attempts, %error, "retries exhausted; continuing with no records");
            Ok(Err(SourceFetch::exhausted(attempts, error)))
        }
        Err(RetryError::Fatal { error, attempts }) => Err(AdapterError::Fatal {
            source_id,
            attempts,
            error,
        }),
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError>;
}

/// Credential lookup, e.g. API keys from the environment.
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;

    fn get_credential(&self, name: &str) -> Result<String, FetchError> {
        self.lookup(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FetchError::MissingCredential(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Per-source settings for [`adapter_for_source`].
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub retry: RetryPolicy,
    pub news: NewsConfig,
    pub guardian: GuardianConfig,
    pub reddit: RedditConfig,
    pub trends: TrendsConfig,
}

pub fn adapter_for_source(
    kind: SourceKind,
    settings: &AdapterSettings,
    credentials: Arc<dyn CredentialProvider>,
) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::News => Box::new(NewsAdapter::new(settings.news.clone(), settings.retry, credentials)),
        SourceKind::Guardian => Box::new(GuardianAdapter::new(
            settings.guardian.clone(),
            settings.retry,
            credentials,
        )),
        SourceKind::Reddit => Box::new(RedditAdapter::new(
            settings.reddit.clone(),
            settings.retry,
            credentials,
        )),
        SourceKind::Trends => Box::new(TrendsAdapter::new(settings.trends.clone(), settings.retry)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or_query_quotes_phrases() {
        let keywords = vec!["AI Tools".to_string(), "ML".to_string(), " ".to_string()];
        assert_eq!(or_query(&keywords).as_deref(), Some("\"AI Tools\" OR ML"));
        assert_eq!(or_query(&[]), None);
    }

    #[test]
    fn or_query_strips_embedded_quotes() {
        let keywords = vec!["say \"hi\"".to_string(), "\"".to_string(), "ML".to_string()];
        assert_eq!(or_query(&keywords).as_deref(), Some("\"say hi\" OR ML"));
    }

    #[test]
    fn missing_or_blank_credentials_are_fatal() {
        let creds = StaticCredentials::default().with("NEWS_API_KEY", "  ");
        let err = creds.get_credential("NEWS_API_KEY").unwrap_err();
        assert!(matches!(err, FetchError::MissingCredential(name) if name == "NEWS_API_KEY"));
        assert!(creds.get_credential("GUARDIAN_API_KEY").is_err());
    }

    #[test]
    fn settle_turns_exhaustion_into_empty_fetch() {
        let exhausted: Result<(), _> = Err(RetryError::Exhausted {
            error: FetchError::HttpStatus {
                status: 503,
                url: "https://newsapi.org/v2/everything".into(),
            },
            attempts: 4,
        });
        let fetch = settle("news", exhausted).unwrap().unwrap_err();
        assert!(fetch.records.is_empty());
        assert!(matches!(fetch.status, FetchStatus::Exhausted { attempts: 4, .. }));

        let fatal: Result<(), _> = Err(RetryError::Fatal {
            error: FetchError::HttpStatus {
                status: 401,
                url: "https://newsapi.org/v2/everything".into(),
            },
            attempts: 1,
        });
        assert!(matches!(settle("news", fatal), Err(AdapterError::Fatal { attempts: 1, .. })));
    }
}
