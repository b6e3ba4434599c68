//! NewsAPI `/everything` search.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_core::{RawRecord, SourceKind};
use pulse_storage::{FetchError, HttpFetcher, RequestSpec, RetryPolicy};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{or_query, settle, AdapterError, CredentialProvider, FetchQuery, SourceAdapter, SourceFetch};

const SOURCE_ID: &str = "news";
/// NewsAPI rejects `pageSize` above this.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsConfig {
    pub base_url: String,
    pub language: String,
    pub page_size: usize,
    pub sort_by: String,
    /// Used when the query carries no `from_date` of its own.
    pub from_date: Option<NaiveDate>,
    pub api_key_var: String,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://newsapi.org/v2".to_string(),
            language: "en".to_string(),
            page_size: MAX_PAGE_SIZE,
            sort_by: "publishedAt".to_string(),
            from_date: None,
            api_key_var: "NEWS_API_KEY".to_string(),
        }
    }
}

pub struct NewsAdapter {
    config: NewsConfig,
    retry: RetryPolicy,
    credentials: Arc<dyn CredentialProvider>,
}

impl NewsAdapter {
    pub fn new(config: NewsConfig, retry: RetryPolicy, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            retry,
            credentials,
        }
    }

    fn page_size(&self) -> usize {
        self.config.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

/// Parse an `/everything` body into at most `page_size` raw articles.
pub fn parse_everything(url: &str, body: &[u8], page_size: usize) -> Result<Vec<RawRecord>, FetchError> {
    let doc: JsonValue = serde_json::from_slice(body).map_err(|e| FetchError::malformed(url, e))?;

    if doc.get("status").and_then(JsonValue::as_str) == Some("error") {
        let code = doc
            .get("code")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = doc
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let retryable = code == "rateLimited";
        return Err(FetchError::Api {
            code,
            message,
            retryable,
        });
    }

    let articles = doc
        .get("articles")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::malformed(url, "missing `articles` array"))?;

    Ok(articles
        .iter()
        .take(page_size)
        .cloned()
        .map(|payload| RawRecord::new(SourceKind::News, payload))
        .collect())
}

#[async_trait]
impl SourceAdapter for NewsAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::News
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError> {
        let Some(q) = or_query(&query.keywords) else {
            warn!(source_id = SOURCE_ID, "no keywords supplied; nothing to search");
            return Ok(SourceFetch::complete(Vec::new()));
        };
        let api_key = self
            .credentials
            .get_credential(&self.config.api_key_var)
            .map_err(|e| AdapterError::fatal(SOURCE_ID, e))?;

        info!(source_id = SOURCE_ID, query = %q, "fetching news articles");
        let page_size = self.page_size();
        let mut spec = RequestSpec::get(format!("{}/everything", self.config.base_url.trim_end_matches('/')))
            .query("q", &q)
            .query("language", &self.config.language)
            .query("sortBy", &self.config.sort_by)
            .query("pageSize", page_size)
            .header("X-Api-Key", api_key);
        if let Some(from) = query.from_date.or(self.config.from_date) {
            spec = spec.query("from", from.format("%Y-%m-%d"));
        }

        let result = http
            .fetch_parsed(&self.retry, SOURCE_ID, &spec, |resp| {
                parse_everything(&resp.final_url, &resp.body, page_size)
            })
            .await;
        let records = match settle(SOURCE_ID, result)? {
            Ok(records) => records,
            Err(empty) => return Ok(empty),
        };

        info!(source_id = SOURCE_ID, fetched = records.len(), "news articles fetched");
        Ok(SourceFetch::complete(records))
    }
}
