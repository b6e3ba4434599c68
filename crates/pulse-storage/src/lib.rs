//! HTTP fetch, retry/backoff and idempotent article persistence for Pulse.

pub mod http;
pub mod repository;
pub mod retry;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, Method, RequestSpec, SimpleTokenBucket, TokenBucketConfig,
};
pub use repository::{
    connect_with_retry, ensure_schema, open_pool, ArticleRepository, Db, DbPool, DbSession,
    PersistError, PersistOutcome,
};
pub use retry::{BackoffPolicy, RetryDisposition, RetryError, RetryPolicy, Retryable};

pub const CRATE_NAME: &str = "pulse-storage";
