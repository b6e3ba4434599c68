//! Guardian content search with full field expansion.
//!
//! The Guardian path is stricter than the generic normalizer: a result must
//! carry byline, title, trail text, URL and publication date, otherwise it is
//! excluded here and never reaches normalization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_core::{RawRecord, SourceKind};
use pulse_storage::{FetchError, HttpFetcher, RequestSpec, RetryPolicy};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{or_query, settle, AdapterError, CredentialProvider, FetchQuery, SourceAdapter, SourceFetch};

const SOURCE_ID: &str = "guardian";

const REQUIRED_FIELDS: [&str; 5] = [
    "/fields/byline",
    "/webTitle",
    "/fields/trailText",
    "/webUrl",
    "/webPublicationDate",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianConfig {
    pub base_url: String,
    pub page_size: usize,
    pub from_date: Option<NaiveDate>,
    pub api_key_var: String,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            base_url: "https://content.guardianapis.com".to_string(),
            page_size: 50,
            from_date: None,
            api_key_var: "GUARDIAN_API_KEY".to_string(),
        }
    }
}

pub struct GuardianAdapter {
    config: GuardianConfig,
    retry: RetryPolicy,
    credentials: Arc<dyn CredentialProvider>,
}

impl GuardianAdapter {
    pub fn new(config: GuardianConfig, retry: RetryPolicy, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            retry,
            credentials,
        }
    }
}

/// First required field that is absent or blank, if any.
pub fn missing_required_field(result: &JsonValue) -> Option<&'static str> {
    REQUIRED_FIELDS.into_iter().find(|pointer| {
        result
            .pointer(pointer)
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
    })
}

/// Parse `/search` and split results into complete records and an excluded count.
pub fn parse_search(url: &str, body: &[u8]) -> Result<(Vec<RawRecord>, usize), FetchError> {
    let doc: JsonValue = serde_json::from_slice(body).map_err(|e| FetchError::malformed(url, e))?;
    let results = doc
        .pointer("/response/results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::malformed(url, "missing `response.results`"))?;

    let mut records = Vec::with_capacity(results.len());
    let mut excluded = 0usize;
    for result in results {
        if let Some(field) = missing_required_field(result) {
            excluded += 1;
            warn!(
                source_id = SOURCE_ID,
                missing = field,
                url = result.get("webUrl").and_then(JsonValue::as_str).unwrap_or("<none>"),
                "guardian article missing required field; skipping"
            );
            continue;
        }
        records.push(RawRecord::new(SourceKind::Guardian, result.clone()));
    }
    Ok((records, excluded))
}

#[async_trait]
impl SourceAdapter for GuardianAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Guardian
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError> {
        let api_key = self
            .credentials
            .get_credential(&self.config.api_key_var)
            .map_err(|e| AdapterError::fatal(SOURCE_ID, e))?;

        let mut spec = RequestSpec::get(format!("{}/search", self.config.base_url.trim_end_matches('/')))
            .query("api-key", api_key)
            .query("show-fields", "all")
            .query("order-by", "newest")
            .query("page-size", self.config.page_size.max(1));
        if let Some(q) = or_query(&query.keywords) {
            spec = spec.query("q", q);
        }
        if let Some(from) = query.from_date.or(self.config.from_date) {
            spec = spec.query("from-date", from.format("%Y-%m-%d"));
        }

        let result = http
            .fetch_parsed(&self.retry, SOURCE_ID, &spec, |resp| parse_search(&resp.final_url, &resp.body))
            .await;
        let (records, excluded) = match settle(SOURCE_ID, result)? {
            Ok(parsed) => parsed,
            Err(empty) => return Ok(empty),
        };

        info!(source_id = SOURCE_ID, fetched = records.len(), excluded, "guardian articles fetched");
        let mut fetch = SourceFetch::complete(records);
        fetch.excluded = excluded;
        Ok(fetch)
    }
}
