//! Rate-limited HTTP client shared by every source adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

use crate::retry::{RetryDisposition, RetryError, RetryPolicy, Retryable};

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("api error {code}: {message}")]
    Api {
        code: String,
        message: String,
        retryable: bool,
    },
    #[error("missing credential `{0}`")]
    MissingCredential(String),
}

/// The reqwest error's URL carries the query string, and with it any API key.
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.without_url())
    }
}

impl FetchError {
    pub fn malformed(url: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::Malformed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Transport(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Api { retryable: true, .. } => RetryDisposition::Retryable,
            FetchError::Api { .. } | FetchError::Malformed { .. } | FetchError::MissingCredential(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Keyed by source id; sources without an entry are not throttled.
    pub token_buckets: HashMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            token_buckets: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound request, rebuilt on every retry attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub bearer: Option<String>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            form: Vec::new(),
            basic_auth: None,
            bearer: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn form_field(mut self, key: &str, value: impl ToString) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::malformed(&self.final_url, e))
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_buckets: HashMap<String, Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_buckets = config
            .token_buckets
            .iter()
            .map(|(source_id, c)| {
                (
                    source_id.clone(),
                    Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)),
                )
            })
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_buckets,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// A single attempt: one request, no retries. Non-2xx becomes
    /// [`FetchError::HttpStatus`].
    pub async fn send_once(&self, source_id: &str, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = self.token_buckets.get(source_id) {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url = %spec.url);
        async {
            let resp = self.build(spec).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: strip_query(&final_url),
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url: strip_query(&final_url),
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Request plus parse under one retry budget, so a malformed body is
    /// classified the same way a failed request is.
    pub async fn fetch_parsed<T, P>(
        &self,
        policy: &RetryPolicy,
        source_id: &str,
        spec: &RequestSpec,
        parse: P,
    ) -> Result<T, RetryError<FetchError>>
    where
        P: Fn(&FetchedResponse) -> Result<T, FetchError>,
    {
        let parse = &parse;
        policy
            .execute(source_id, move |_| async move {
                let resp = self.send_once(source_id, spec).await?;
                parse(&resp)
            })
            .await
    }

    fn build(&self, spec: &RequestSpec) -> reqwest::RequestBuilder {
        let mut req = match spec.method {
            Method::Get => self.client.get(&spec.url),
            Method::Post => self.client.post(&spec.url),
        };
        if !spec.query.is_empty() {
            req = req.query(&spec.query);
        }
        for (key, value) in &spec.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some((user, password)) = &spec.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(token) = &spec.bearer {
            req = req.bearer_auth(token);
        }
        if !spec.form.is_empty() {
            req = req.form(&spec.form);
        }
        req
    }
}

/// Query strings can carry API keys; keep them out of errors and logs.
fn strip_query(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_rules() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn fetch_errors_classify_by_kind() {
        let status = |s: u16| FetchError::HttpStatus {
            status: s,
            url: "https://x".into(),
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!FetchError::malformed("https://x", "eof").is_retryable());
        assert!(!FetchError::MissingCredential("NEWS_API_KEY".into()).is_retryable());
        let api = |retryable| FetchError::Api {
            code: "rateLimited".into(),
            message: "slow down".into(),
            retryable,
        };
        assert!(api(true).is_retryable());
        assert!(!api(false).is_retryable());
    }

    #[test]
    fn request_spec_builder_accumulates_parts() {
        let spec = RequestSpec::get("https://example.com/search")
            .query("q", "rust")
            .query("page-size", 10)
            .header("X-Api-Key", "k")
            .bearer("t");
        assert_eq!(spec.method, Method::Get);
        assert_eq!(spec.query[1], ("page-size".to_string(), "10".to_string()));
        assert_eq!(spec.bearer.as_deref(), Some("t"));
    }

    #[test]
    fn query_is_stripped_from_reported_urls() {
        assert_eq!(
            strip_query("https://content.guardianapis.com/search?api-key=secret"),
            "https://content.guardianapis.com/search"
        );
    }

    #[tokio::test]
    async fn transport_errors_do_not_carry_the_query_string() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let spec = RequestSpec::get("http://127.0.0.1:9/search").query("api-key", "SUPERSECRET");

        let err = fetcher.send_once("guardian", &spec).await.unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("SUPERSECRET"));
    }

    #[tokio::test]
    async fn token_bucket_allows_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(60));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
