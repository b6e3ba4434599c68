//! Reddit hot listings through the application-only OAuth flow.

use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{RawRecord, SourceKind};
use pulse_storage::{FetchError, HttpFetcher, RequestSpec, RetryPolicy};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{settle, AdapterError, CredentialProvider, FetchQuery, SourceAdapter, SourceFetch};

const SOURCE_ID: &str = "reddit";

/// Topic keyword to the subreddit that covers it.
const SUBREDDIT_MAPPING: [(&str, &str); 4] = [
    ("technology", "technology"),
    ("artificial intelligence", "artificial"),
    ("machine learning", "MachineLearning"),
    ("python programming", "Python"),
];

const FALLBACK_SUBREDDIT: &str = "technology";

pub fn subreddit_for_topic(topic: &str) -> &'static str {
    let topic = topic.trim().to_lowercase();
    SUBREDDIT_MAPPING
        .iter()
        .find(|(t, _)| *t == topic)
        .map(|(_, sub)| *sub)
        .unwrap_or(FALLBACK_SUBREDDIT)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedditConfig {
    pub auth_url: String,
    pub api_base: String,
    /// `None` picks a subreddit from the first keyword.
    pub subreddit: Option<String>,
    pub limit: usize,
    pub client_id_var: String,
    pub client_secret_var: String,
    pub user_agent_var: String,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            api_base: "https://oauth.reddit.com".to_string(),
            subreddit: Some("all".to_string()),
            limit: 10,
            client_id_var: "REDDIT_CLIENT_ID".to_string(),
            client_secret_var: "REDDIT_CLIENT_SECRET".to_string(),
            user_agent_var: "REDDIT_USER_AGENT".to_string(),
        }
    }
}

pub struct RedditAdapter {
    config: RedditConfig,
    retry: RetryPolicy,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RedditAdapter {
    pub fn new(config: RedditConfig, retry: RetryPolicy, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            retry,
            credentials,
        }
    }

    fn subreddit(&self, query: &FetchQuery) -> String {
        match &self.config.subreddit {
            Some(sub) => sub.clone(),
            None => query
                .keywords
                .first()
                .map(|k| subreddit_for_topic(k))
                .unwrap_or(FALLBACK_SUBREDDIT)
                .to_string(),
        }
    }
}

pub fn parse_token(url: &str, body: &[u8]) -> Result<String, FetchError> {
    let token: TokenResponse = serde_json::from_slice(body).map_err(|e| FetchError::malformed(url, e))?;
    match token.access_token {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(FetchError::Api {
            code: token.error.unwrap_or_else(|| "no_access_token".to_string()),
            message: "token endpoint returned no access token".to_string(),
            retryable: false,
        }),
    }
}

/// One raw record per `data.children[].data`, in listing order.
pub fn parse_listing(url: &str, body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let doc: JsonValue = serde_json::from_slice(body).map_err(|e| FetchError::malformed(url, e))?;
    let children = doc
        .pointer("/data/children")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::malformed(url, "missing `data.children`"))?;

    Ok(children
        .iter()
        .filter_map(|child| child.get("data"))
        .cloned()
        .map(|payload| RawRecord::new(SourceKind::Reddit, payload))
        .collect())
}

#[async_trait]
impl SourceAdapter for RedditAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Reddit
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError> {
        let lookup = |name: &str| {
            self.credentials
                .get_credential(name)
                .map_err(|e| AdapterError::fatal(SOURCE_ID, e))
        };
        let client_id = lookup(&self.config.client_id_var)?;
        let client_secret = lookup(&self.config.client_secret_var)?;
        let user_agent = lookup(&self.config.user_agent_var)?;

        let token_spec = RequestSpec::post(self.config.auth_url.clone())
            .basic_auth(client_id, client_secret)
            .form_field("grant_type", "client_credentials")
            .header("User-Agent", &user_agent);
        let token = http
            .fetch_parsed(&self.retry, SOURCE_ID, &token_spec, |resp| {
                parse_token(&resp.final_url, &resp.body)
            })
            .await;
        let token = match settle(SOURCE_ID, token)? {
            Ok(token) => token,
            Err(empty) => return Ok(empty),
        };
        debug!(source_id = SOURCE_ID, "oauth token acquired");

        let subreddit = self.subreddit(query);
        let listing_spec = RequestSpec::get(format!(
            "{}/r/{}/hot",
            self.config.api_base.trim_end_matches('/'),
            subreddit
        ))
        .query("limit", self.config.limit.max(1))
        .query("raw_json", 1)
        .bearer(token)
        .header("User-Agent", &user_agent);

        let result = http
            .fetch_parsed(&self.retry, SOURCE_ID, &listing_spec, |resp| {
                parse_listing(&resp.final_url, &resp.body)
            })
            .await;
        let records = match settle(SOURCE_ID, result)? {
            Ok(records) => records,
            Err(empty) => return Ok(empty),
        };

        info!(source_id = SOURCE_ID, subreddit = %subreddit, fetched = records.len(), "reddit posts fetched");
        Ok(SourceFetch::complete(records))
    }
}
