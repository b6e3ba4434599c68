//! Trending keywords from the trends service.
//!
//! Without keywords the adapter reads the daily trending-search list in one
//! call. With keywords it asks for interest over time, one request pair per
//! keyword batch, and backs off per batch: a batch that keeps failing is
//! abandoned and the next batch still runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pulse_core::{KeywordBatcher, RawRecord, SourceKind, TrendingKeyword};
use pulse_storage::{BackoffPolicy, FetchError, HttpFetcher, RequestSpec, RetryPolicy, Retryable};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{settle, AdapterError, FetchQuery, SourceAdapter, SourceFetch};

const SOURCE_ID: &str = "trends";

/// The service rejects interest requests naming more keywords than this.
pub const MAX_KEYWORDS_PER_REQUEST: usize = 5;

const XSSI_PREFIX: &str = ")]}'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendsConfig {
    pub base_url: String,
    pub hl: String,
    /// Timezone offset in minutes, as the service expects it.
    pub tz: i32,
    pub geo: String,
    pub timeframe: String,
    pub batch_size: usize,
    pub batch_backoff: BackoffPolicy,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://trends.google.com".to_string(),
            hl: "en-US".to_string(),
            tz: 360,
            geo: "US".to_string(),
            timeframe: "now 7-d".to_string(),
            batch_size: MAX_KEYWORDS_PER_REQUEST,
            batch_backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(240),
            },
        }
    }
}

pub struct TrendsAdapter {
    config: TrendsConfig,
    retry: RetryPolicy,
}

impl TrendsAdapter {
    pub fn new(config: TrendsConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/trends/api/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn daily_trending(&self, http: &HttpFetcher) -> Result<SourceFetch, AdapterError> {
        let spec = RequestSpec::get(self.api_url("dailytrends"))
            .query("hl", &self.config.hl)
            .query("tz", self.config.tz)
            .query("geo", &self.config.geo)
            .query("ns", 15);
        let result = http
            .fetch_parsed(&self.retry, SOURCE_ID, &spec, |resp| {
                parse_daily(&resp.final_url, &resp.body)
            })
            .await;
        let records = match settle(SOURCE_ID, result)? {
            Ok(records) => records,
            Err(empty) => return Ok(empty),
        };
        info!(source_id = SOURCE_ID, fetched = records.len(), "daily trending searches fetched");
        Ok(SourceFetch::complete(records))
    }

    /// One attempt for one batch: explore for the widget token, then the
    /// interest-over-time series.
    async fn interest_for_batch(&self, http: &HttpFetcher, batch: &[String]) -> Result<Vec<RawRecord>, FetchError> {
        let comparison: Vec<JsonValue> = batch
            .iter()
            .map(|k| json!({ "keyword": k, "geo": self.config.geo, "time": self.config.timeframe }))
            .collect();
        let explore_req = json!({ "comparisonItem": comparison, "category": 0, "property": "" });
        let explore = RequestSpec::get(self.api_url("explore"))
            .query("hl", &self.config.hl)
            .query("tz", self.config.tz)
            .query("req", explore_req);
        let resp = http.send_once(SOURCE_ID, &explore).await?;
        let (widget_request, token) = parse_explore_token(&resp.final_url, &resp.body)?;

        let multiline = RequestSpec::get(self.api_url("widgetdata/multiline"))
            .query("hl", &self.config.hl)
            .query("tz", self.config.tz)
            .query("req", widget_request)
            .query("token", token);
        let resp = http.send_once(SOURCE_ID, &multiline).await?;
        parse_multiline(&resp.final_url, &resp.body, batch)
    }

    async fn interest_over_time(&self, http: &HttpFetcher, keywords: &[String]) -> SourceFetch {
        let batcher = KeywordBatcher::new(keywords, self.config.batch_size.min(MAX_KEYWORDS_PER_REQUEST));
        let backoff = self.config.batch_backoff;
        let mut records = Vec::new();
        let mut failed_batches = 0usize;
        let mut total_attempts = 0usize;
        let mut last_error = None;

        for (index, batch) in batcher.batches().enumerate() {
            let mut attempt = 0usize;
            loop {
                total_attempts += 1;
                match self.interest_for_batch(http, batch).await {
                    Ok(batch_records) => {
                        debug!(source_id = SOURCE_ID, batch = index, points = batch_records.len(), "batch fetched");
                        records.extend(batch_records);
                        break;
                    }
                    Err(error) if batch_should_retry(&error) && attempt < backoff.max_retries => {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(
                            source_id = SOURCE_ID,
                            batch = index,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "batch throttled; backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(error) => {
                        warn!(source_id = SOURCE_ID, batch = index, keywords = ?batch, %error, "skipping batch");
                        failed_batches += 1;
                        last_error = Some(error.to_string());
                        break;
                    }
                }
            }
        }

        let batch_count = batcher.batch_count();
        info!(
            source_id = SOURCE_ID,
            batches = batch_count,
            failed_batches,
            points = records.len(),
            "interest over time fetched"
        );
        match last_error {
            Some(error) if failed_batches == batch_count => {
                let mut fetch = SourceFetch::exhausted(total_attempts, error);
                fetch.failed_batches = failed_batches;
                fetch
            }
            _ => {
                let mut fetch = SourceFetch::complete(records);
                fetch.failed_batches = failed_batches;
                fetch
            }
        }
    }
}

/// Throttling shows up either as a retryable status or as an HTML page
/// where JSON was expected.
fn batch_should_retry(error: &FetchError) -> bool {
    error.is_retryable() || matches!(error, FetchError::Malformed { .. })
}

pub fn strip_xssi_prefix(body: &[u8]) -> &[u8] {
    let trimmed = body.trim_ascii_start();
    match trimmed.strip_prefix(XSSI_PREFIX.as_bytes()) {
        Some(rest) => rest.strip_prefix(b",").unwrap_or(rest),
        None => trimmed,
    }
}

fn parse_json(url: &str, body: &[u8]) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(strip_xssi_prefix(body)).map_err(|e| FetchError::malformed(url, e))
}

/// `{query, traffic}` records from the daily trending-search list.
pub fn parse_daily(url: &str, body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let doc = parse_json(url, body)?;
    let days = doc
        .pointer("/default/trendingSearchesDays")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::malformed(url, "missing `default.trendingSearchesDays`"))?;

    Ok(days
        .iter()
        .filter_map(|day| day.get("trendingSearches").and_then(JsonValue::as_array))
        .flatten()
        .filter_map(|search| {
            let query = search.pointer("/title/query")?.as_str()?;
            let traffic = search.get("formattedTraffic").cloned().unwrap_or(JsonValue::Null);
            Some(RawRecord::new(
                SourceKind::Trends,
                json!({ "query": query, "traffic": traffic }),
            ))
        })
        .collect())
}

/// The TIMESERIES widget's request object and token from an explore response.
pub fn parse_explore_token(url: &str, body: &[u8]) -> Result<(JsonValue, String), FetchError> {
    let doc = parse_json(url, body)?;
    let widget = doc
        .get("widgets")
        .and_then(JsonValue::as_array)
        .and_then(|widgets| {
            widgets
                .iter()
                .find(|w| w.get("id").and_then(JsonValue::as_str) == Some("TIMESERIES"))
        })
        .ok_or_else(|| FetchError::malformed(url, "no TIMESERIES widget"))?;
    let token = widget
        .get("token")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FetchError::malformed(url, "TIMESERIES widget has no token"))?;
    let request = widget
        .get("request")
        .cloned()
        .ok_or_else(|| FetchError::malformed(url, "TIMESERIES widget has no request"))?;
    Ok((request, token.to_string()))
}

/// `{keyword, time, value, isPartial}` records, one per keyword per time point.
/// Column `i` of each point belongs to `batch[i]`.
pub fn parse_multiline(url: &str, body: &[u8], batch: &[String]) -> Result<Vec<RawRecord>, FetchError> {
    let doc = parse_json(url, body)?;
    let timeline = doc
        .pointer("/default/timelineData")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::malformed(url, "missing `default.timelineData`"))?;

    let mut records = Vec::with_capacity(timeline.len() * batch.len());
    for point in timeline {
        let time = point.get("time").cloned().unwrap_or(JsonValue::Null);
        let partial = point.get("isPartial").and_then(JsonValue::as_bool).unwrap_or(false);
        let values = point.get("value").and_then(JsonValue::as_array);
        for (i, keyword) in batch.iter().enumerate() {
            let value = values
                .and_then(|v| v.get(i))
                .and_then(JsonValue::as_i64)
                .unwrap_or(0);
            records.push(RawRecord::new(
                SourceKind::Trends,
                json!({ "keyword": keyword, "time": time, "value": value, "isPartial": partial }),
            ));
        }
    }
    Ok(records)
}

/// Trending keywords out of trends records, best first, at most `limit`.
///
/// Daily records keep their listed order. Interest records are ranked by mean
/// interest; keywords whose interest never rises above zero are left out.
pub fn keywords_from_records(records: &[RawRecord], limit: usize) -> Vec<TrendingKeyword> {
    let mut ranked: Vec<(TrendingKeyword, f64)> = Vec::new();
    let mut interest: HashMap<TrendingKeyword, (usize, i64, usize)> = HashMap::new();

    for record in records.iter().filter(|r| r.kind == SourceKind::Trends) {
        if let Some(query) = record.payload.get("query").and_then(JsonValue::as_str) {
            if let Some(keyword) = TrendingKeyword::parse(query) {
                if !ranked.iter().any(|(k, _)| *k == keyword) {
                    ranked.push((keyword, f64::INFINITY));
                }
            }
            continue;
        }
        let Some(keyword) = record
            .payload
            .get("keyword")
            .and_then(JsonValue::as_str)
            .and_then(TrendingKeyword::parse)
        else {
            continue;
        };
        let value = record.payload.get("value").and_then(JsonValue::as_i64).unwrap_or(0);
        let order = interest.len();
        let entry = interest.entry(keyword).or_insert((order, 0, 0));
        entry.1 += value;
        entry.2 += 1;
    }

    let mut by_interest: Vec<(usize, TrendingKeyword, f64)> = interest
        .into_iter()
        .filter(|(_, (_, sum, _))| *sum > 0)
        .map(|(keyword, (order, sum, n))| (order, keyword, sum as f64 / n as f64))
        .collect();
    by_interest.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
    for (_, keyword, mean) in by_interest {
        if !ranked.iter().any(|(k, _)| *k == keyword) {
            ranked.push((keyword, mean));
        }
    }

    ranked.into_iter().take(limit).map(|(k, _)| k).collect()
}

#[async_trait]
impl SourceAdapter for TrendsAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Trends
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError> {
        if query.keywords.is_empty() {
            self.daily_trending(http).await
        } else {
            Ok(self.interest_over_time(http, &query.keywords).await)
        }
    }
}
