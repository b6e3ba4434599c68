// Runs against an on-disk SQLite database; the postgres build needs a live server.
#![cfg(not(feature = "postgres"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulse_adapters::{AdapterError, FetchQuery, SourceAdapter, SourceFetch};
use pulse_core::{ArticleTable, RawRecord, SourceKind};
use pulse_storage::{
    connect_with_retry, ensure_schema, ArticleRepository, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher,
    RetryPolicy,
};
use pulse_sync::{
    report_recent_markdown, IngestConfig, IngestPipeline, RunOptions, RunStage, SourceStatus, DEFAULT_KEYWORDS,
};
use serde_json::json;
use tempfile::TempDir;

#[derive(Clone)]
enum Outcome {
    Records(Vec<RawRecord>),
    Exhausted,
    Fatal,
}

struct StubAdapter {
    kind: SourceKind,
    outcome: Outcome,
    calls: Arc<AtomicUsize>,
    seen_keywords: Arc<Mutex<Vec<String>>>,
}

impl StubAdapter {
    fn new(kind: SourceKind, outcome: Outcome) -> Self {
        Self {
            kind,
            outcome,
            calls: Arc::new(AtomicUsize::new(0)),
            seen_keywords: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn source_id(&self) -> &'static str {
        self.kind.as_str()
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, _http: &HttpFetcher, query: &FetchQuery) -> Result<SourceFetch, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_keywords.lock().unwrap() = query.keywords.clone();
        match &self.outcome {
            Outcome::Records(records) => Ok(SourceFetch::complete(records.clone())),
            Outcome::Exhausted => Ok(SourceFetch::exhausted(4, "http status 503")),
            Outcome::Fatal => Err(AdapterError::fatal(
                self.source_id(),
                FetchError::HttpStatus {
                    status: 401,
                    url: "https://example.test".to_string(),
                },
            )),
        }
    }
}

fn guardian_record(url: &str) -> RawRecord {
    RawRecord::new(
        SourceKind::Guardian,
        json!({
            "webTitle": "Chipmakers race to meet AI demand",
            "webUrl": url,
            "webPublicationDate": "2024-03-20T12:00:00Z",
            "fields": { "byline": "Alex Hern", "trailText": "Supply is short" }
        }),
    )
}

fn reddit_records() -> Vec<RawRecord> {
    vec![
        RawRecord::new(
            SourceKind::Reddit,
            json!({
                "subreddit": "technology",
                "title": "Nvidia announces Blackwell",
                "url": "https://www.nvidia.com/blackwell",
                "score": 15234,
                "created_utc": 1710936000.0
            }),
        ),
        RawRecord::new(
            SourceKind::Reddit,
            json!({ "subreddit": "technology", "url": "https://x/untitled", "created_utc": 1710936000.0 }),
        ),
    ]
}

async fn setup() -> (TempDir, IngestConfig, ArticleRepository) {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!("sqlite://{}", dir.path().join("pulse.db").display());
    let policy = RetryPolicy::new(BackoffPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(10),
    });
    let pool = connect_with_retry(&database_url, &policy).await.expect("connect");
    ensure_schema(&pool).await.expect("schema");
    let config = IngestConfig {
        database_url,
        workspace_root: dir.path().to_path_buf(),
        ..IngestConfig::default()
    };
    (dir, config, ArticleRepository::new(pool))
}

fn pipeline(config: &IngestConfig, repo: &ArticleRepository, adapters: Vec<Box<dyn SourceAdapter>>) -> IngestPipeline {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    IngestPipeline::new(config.clone(), http, repo.clone(), adapters)
}

#[tokio::test]
async fn exhausted_news_does_not_block_guardian_and_reddit() {
    let (dir, config, repo) = setup().await;
    let news = StubAdapter::new(SourceKind::News, Outcome::Exhausted);
    let news_keywords = Arc::clone(&news.seen_keywords);
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::new(SourceKind::Trends, Outcome::Exhausted)),
        Box::new(news),
        Box::new(StubAdapter::new(
            SourceKind::Guardian,
            Outcome::Records(vec![
                guardian_record("https://www.theguardian.com/a"),
                guardian_record("https://www.theguardian.com/b"),
            ]),
        )),
        Box::new(StubAdapter::new(SourceKind::Reddit, Outcome::Records(reddit_records()))),
    ];

    let report = pipeline(&config, &repo, adapters)
        .run_once(&RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stage, RunStage::Done);
    assert!(report.used_default_keywords);
    assert_eq!(*news_keywords.lock().unwrap(), DEFAULT_KEYWORDS.to_vec());

    let news = report.source(SourceKind::News).unwrap();
    assert!(matches!(news.status, SourceStatus::Exhausted { .. }));
    assert_eq!(news.inserted, 0);

    let guardian = report.source(SourceKind::Guardian).unwrap();
    assert_eq!(guardian.inserted, 2);

    let reddit = report.source(SourceKind::Reddit).unwrap();
    assert_eq!(reddit.fetched, 2);
    assert_eq!(reddit.dropped, 1);
    assert_eq!(reddit.drop_reasons.get("missing_title"), Some(&1));
    assert_eq!(reddit.inserted, 1);

    assert_eq!(repo.count(ArticleTable::GuardianArticles).await.unwrap(), 2);
    assert_eq!(repo.count(ArticleTable::RedditPosts).await.unwrap(), 1);
    assert_eq!(repo.count(ArticleTable::NewsArticles).await.unwrap(), 0);

    let run_dir = dir.path().join("reports").join(report.run_id.to_string());
    assert!(run_dir.join("run_summary.json").is_file());
    assert!(run_dir.join("ingest_brief.md").is_file());
}

#[tokio::test]
async fn rerunning_inserts_nothing_new() {
    let (_dir, config, repo) = setup().await;
    let build = || -> Vec<Box<dyn SourceAdapter>> {
        vec![Box::new(StubAdapter::new(
            SourceKind::Guardian,
            Outcome::Records(vec![guardian_record("https://www.theguardian.com/a")]),
        ))]
    };

    let first = pipeline(&config, &repo, build()).run_once(&RunOptions::default()).await.unwrap();
    let second = pipeline(&config, &repo, build()).run_once(&RunOptions::default()).await.unwrap();

    assert_eq!(first.source(SourceKind::Guardian).unwrap().inserted, 1);
    let again = second.source(SourceKind::Guardian).unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.duplicates, 1);
    assert_eq!(repo.count(ArticleTable::GuardianArticles).await.unwrap(), 1);
}

#[tokio::test]
async fn runner_keywords_skip_trends_and_reach_sources() {
    let (_dir, config, repo) = setup().await;
    let trends = StubAdapter::new(SourceKind::Trends, Outcome::Fatal);
    let trends_calls = Arc::clone(&trends.calls);
    let news = StubAdapter::new(SourceKind::News, Outcome::Records(Vec::new()));
    let news_keywords = Arc::clone(&news.seen_keywords);

    let options = RunOptions {
        sources: Vec::new(),
        keywords: vec!["rust".to_string()],
    };
    let report = pipeline(&config, &repo, vec![Box::new(trends), Box::new(news)])
        .run_once(&options)
        .await
        .unwrap();

    assert_eq!(report.stage, RunStage::Done);
    assert_eq!(trends_calls.load(Ordering::SeqCst), 0);
    assert_eq!(*news_keywords.lock().unwrap(), vec!["rust".to_string()]);
    assert!(report.source(SourceKind::News).unwrap().succeeded());
}

#[tokio::test]
async fn runner_keywords_are_sanitized_before_fetching() {
    let (_dir, config, repo) = setup().await;
    let news = StubAdapter::new(SourceKind::News, Outcome::Records(Vec::new()));
    let news_keywords = Arc::clone(&news.seen_keywords);

    let options = RunOptions {
        sources: Vec::new(),
        keywords: vec!["  say \"hi\" ".to_string(), "\"\"".to_string()],
    };
    let report = pipeline(&config, &repo, vec![Box::new(news)]).run_once(&options).await.unwrap();

    assert_eq!(*news_keywords.lock().unwrap(), vec!["say hi".to_string()]);
    assert_eq!(report.keywords, vec!["say hi".to_string()]);
    assert!(!report.used_default_keywords);
}

#[tokio::test]
async fn source_selection_limits_the_run() {
    let (_dir, config, repo) = setup().await;
    let reddit = StubAdapter::new(SourceKind::Reddit, Outcome::Records(reddit_records()));
    let reddit_calls = Arc::clone(&reddit.calls);
    let options = RunOptions {
        sources: vec![SourceKind::Guardian],
        keywords: Vec::new(),
    };
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::new(
            SourceKind::Guardian,
            Outcome::Records(vec![guardian_record("https://www.theguardian.com/a")]),
        )),
        Box::new(reddit),
    ];

    let report = pipeline(&config, &repo, adapters).run_once(&options).await.unwrap();
    assert_eq!(reddit_calls.load(Ordering::SeqCst), 0);
    assert!(report.source(SourceKind::Reddit).is_none());
    assert_eq!(report.source(SourceKind::Guardian).unwrap().inserted, 1);
}

#[tokio::test]
async fn fatal_source_is_recorded_while_siblings_persist() {
    let (_dir, config, repo) = setup().await;
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::new(SourceKind::News, Outcome::Fatal)),
        Box::new(StubAdapter::new(SourceKind::Reddit, Outcome::Records(reddit_records()))),
    ];
    let report = pipeline(&config, &repo, adapters).run_once(&RunOptions::default()).await.unwrap();

    assert_eq!(report.stage, RunStage::Done);
    assert!(matches!(
        report.source(SourceKind::News).unwrap().status,
        SourceStatus::Failed { .. }
    ));
    assert_eq!(report.source(SourceKind::Reddit).unwrap().inserted, 1);
}

#[tokio::test]
async fn every_source_fatal_fails_the_run() {
    let (_dir, config, repo) = setup().await;
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::new(SourceKind::News, Outcome::Fatal)),
        Box::new(StubAdapter::new(SourceKind::Guardian, Outcome::Fatal)),
    ];
    let report = pipeline(&config, &repo, adapters).run_once(&RunOptions::default()).await.unwrap();

    assert_eq!(report.stage, RunStage::Failed);
    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.total_inserted(), 0);
}

#[tokio::test]
async fn aborted_run_ends_failed_with_a_report() {
    let (dir, config, repo) = setup().await;
    let guardian = StubAdapter::new(
        SourceKind::Guardian,
        Outcome::Records(vec![guardian_record("https://www.theguardian.com/a")]),
    );
    let guardian_calls = Arc::clone(&guardian.calls);
    let pipeline = pipeline(&config, &repo, vec![Box::new(guardian)]);
    pipeline.abort_handle().abort();

    let report = pipeline.run_once(&RunOptions::default()).await.unwrap();

    assert_eq!(report.stage, RunStage::Failed);
    assert!(report.failure.as_deref().unwrap_or_default().contains("aborted"));
    assert_eq!(guardian_calls.load(Ordering::SeqCst), 0);
    assert_eq!(repo.count(ArticleTable::GuardianArticles).await.unwrap(), 0);

    let markdown = report_recent_markdown(5, &dir.path().join("reports")).unwrap();
    assert!(markdown.contains(&report.run_id.to_string()));
    assert!(markdown.contains("failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_is_only_built_when_enabled() {
    let (_dir, config, repo) = setup().await;
    let disabled = Arc::new(pipeline(&config, &repo, Vec::new()));
    assert!(disabled.maybe_build_scheduler().await.unwrap().is_none());

    let enabled_config = IngestConfig {
        scheduler_enabled: true,
        sync_cron: "0 0 6 * * *".to_string(),
        ..config
    };
    let enabled = Arc::new(pipeline(&enabled_config, &repo, Vec::new()));
    assert!(enabled.maybe_build_scheduler().await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_cron_expression_is_an_error() {
    let (_dir, config, repo) = setup().await;
    let config = IngestConfig {
        scheduler_enabled: true,
        sync_cron: "every morning".to_string(),
        ..config
    };
    let pipeline = Arc::new(pipeline(&config, &repo, Vec::new()));
    assert!(pipeline.maybe_build_scheduler().await.is_err());
}
