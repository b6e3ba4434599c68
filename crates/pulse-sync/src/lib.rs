//! Ingest run orchestration: trending keywords, source fetches, normalization
//! and persistence, plus run reports and the cron scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use pulse_adapters::{
    adapter_for_source, keywords_from_records, AdapterError, CredentialProvider, EnvCredentials, FetchQuery,
    FetchStatus, SourceAdapter, SourceFetch,
};
use pulse_core::{sanitize_keyword, validate, Article, SourceKind};
use pulse_storage::{connect_with_retry, ensure_schema, ArticleRepository, HttpFetcher};
use serde::Serialize;
use tokio_cron_scheduler::Job;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod logging;
pub mod report;

pub use config::{IngestConfig, SourceEntry, SourceRegistry};
pub use report::{ingest_brief, report_recent_markdown, write_run_reports};
pub use tokio_cron_scheduler::JobScheduler;

pub const CRATE_NAME: &str = "pulse-sync";

/// Used when the trends stage produces nothing.
pub const DEFAULT_KEYWORDS: [&str; 2] = ["technology", "business"];

/// Cap on trending keywords handed to the article sources.
pub const MAX_TRENDING_KEYWORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    FetchingTrends,
    FetchingSources,
    Normalizing,
    Persisting,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::FetchingTrends => "fetching_trends",
            RunStage::FetchingSources => "fetching_sources",
            RunStage::Normalizing => "normalizing",
            RunStage::Persisting => "persisting",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    /// Retries ran out; the source contributed nothing.
    Exhausted { attempts: usize, last_error: String },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub status: SourceStatus,
    pub fetched: usize,
    pub excluded: usize,
    pub failed_batches: usize,
    pub dropped: usize,
    pub drop_reasons: BTreeMap<String, usize>,
    pub inserted: usize,
    pub duplicates: usize,
    pub persist_error: Option<String>,
}

impl SourceReport {
    fn new(source: SourceKind) -> Self {
        Self {
            source,
            status: SourceStatus::Skipped,
            fetched: 0,
            excluded: 0,
            failed_batches: 0,
            dropped: 0,
            drop_reasons: BTreeMap::new(),
            inserted: 0,
            duplicates: 0,
            persist_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SourceStatus::Succeeded && self.persist_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: RunStage,
    pub keywords: Vec<String>,
    pub used_default_keywords: bool,
    pub sources: Vec<SourceReport>,
    pub failure: Option<String>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            stage: RunStage::FetchingTrends,
            keywords: Vec::new(),
            used_default_keywords: false,
            sources: Vec::new(),
            failure: None,
        }
    }

    pub fn source(&self, kind: SourceKind) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == kind)
    }

    pub fn total_inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    fn advance(&mut self, next: RunStage) {
        debug!(run_id = %self.run_id, from = %self.stage, to = %next, "stage transition");
        self.stage = next;
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(run_id = %self.run_id, stage = %self.stage, %reason, "run failed");
        self.failure = Some(reason);
        self.stage = RunStage::Failed;
    }
}

/// Per-run overrides chosen by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Restrict the run to these sources; empty means every configured source.
    pub sources: Vec<SourceKind>,
    /// Explicit keywords; when set the trends stage is skipped.
    pub keywords: Vec<String>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    repository: ArticleRepository,
    trends: Option<Box<dyn SourceAdapter>>,
    sources: Vec<Box<dyn SourceAdapter>>,
    seed_keywords: Vec<String>,
    abort: AbortHandle,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        http: HttpFetcher,
        repository: ArticleRepository,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> Self {
        let (trends, sources): (Vec<_>, Vec<_>) = adapters
            .into_iter()
            .partition(|a| a.kind() == SourceKind::Trends);
        Self {
            config,
            http,
            repository,
            trends: trends.into_iter().next(),
            sources,
            seed_keywords: Vec::new(),
            abort: AbortHandle::default(),
        }
    }

    pub fn with_seed_keywords(mut self, keywords: Vec<String>) -> Self {
        self.seed_keywords = keywords;
        self
    }

    /// Wire adapters for every enabled registry entry.
    pub fn from_registry(
        config: IngestConfig,
        registry: &SourceRegistry,
        repository: ArticleRepository,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config(registry))?;
        let settings = registry.adapter_settings(config.retry_policy());
        let adapters = registry
            .enabled_kinds()
            .into_iter()
            .map(|kind| adapter_for_source(kind, &settings, Arc::clone(&credentials)))
            .collect();
        Ok(Self::new(config, http, repository, adapters).with_seed_keywords(registry.seed_keywords()))
    }

    /// Connect (with retry), make sure the schema exists and wire adapters.
    pub async fn connect(config: IngestConfig, registry: &SourceRegistry) -> Result<Self> {
        let pool = connect_with_retry(&config.database_url, &config.connect_retry_policy())
            .await
            .context("connecting to database")?;
        ensure_schema(&pool).await.context("creating tables")?;
        Self::from_registry(config, registry, ArticleRepository::new(pool), Arc::new(EnvCredentials))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn repository(&self) -> &ArticleRepository {
        &self.repository
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// One full run. Source-level failures land in the report; only report
    /// writing itself can make this return an error.
    pub async fn run_once(&self, options: &RunOptions) -> Result<RunReport> {
        let mut report = RunReport::new();
        let span = info_span!("ingest_run", run_id = %report.run_id);
        self.drive(&mut report, options).instrument(span).await;

        report.finished_at = Some(Utc::now());
        let dir = write_run_reports(&self.config.reports_root(), &report).await?;
        info!(
            run_id = %report.run_id,
            stage = %report.stage,
            inserted = report.total_inserted(),
            reports = %dir.display(),
            "ingest run finished"
        );
        Ok(report)
    }

    async fn drive(&self, report: &mut RunReport, options: &RunOptions) {
        let selected = |kind: SourceKind| options.sources.is_empty() || options.sources.contains(&kind);

        if self.aborted(report) {
            return;
        }
        let (keywords, used_default) = self.trending_keywords(report, options, selected(SourceKind::Trends)).await;
        report.keywords = keywords;
        report.used_default_keywords = used_default;

        if self.aborted(report) {
            return;
        }
        report.advance(RunStage::FetchingSources);
        let query = FetchQuery::with_keywords(report.keywords.clone());
        let active: Vec<&dyn SourceAdapter> = self
            .sources
            .iter()
            .map(|a| a.as_ref())
            .filter(|a| selected(a.kind()))
            .collect();
        let fetched = self.fetch_sources(&active, &query).await;

        let mut pending = Vec::with_capacity(fetched.len());
        for (adapter, outcome) in active.iter().zip(fetched) {
            let mut source_report = SourceReport::new(adapter.kind());
            let records = match outcome {
                Ok(fetch) => record_fetch(&mut source_report, fetch),
                Err(err) => {
                    error!(source_id = adapter.source_id(), error = %err, "source failed");
                    source_report.status = SourceStatus::Failed { error: err.to_string() };
                    Vec::new()
                }
            };
            pending.push((source_report, records));
        }

        if !pending.is_empty() && pending.iter().all(|(r, _)| matches!(r.status, SourceStatus::Failed { .. })) {
            report.sources.extend(pending.into_iter().map(|(r, _)| r));
            report.fail("every article source failed");
            return;
        }

        if self.aborted(report) {
            report.sources.extend(pending.into_iter().map(|(r, _)| r));
            return;
        }
        report.advance(RunStage::Normalizing);
        let mut normalized = Vec::with_capacity(pending.len());
        for (mut source_report, records) in pending {
            let articles = normalize_records(&mut source_report, &records);
            normalized.push((source_report, articles));
        }

        if self.aborted(report) {
            report.sources.extend(normalized.into_iter().map(|(r, _)| r));
            return;
        }
        report.advance(RunStage::Persisting);
        for (mut source_report, articles) in normalized {
            self.persist_source(&mut source_report, &articles).await;
            report.sources.push(source_report);
        }

        report.advance(RunStage::Done);
    }

    fn aborted(&self, report: &mut RunReport) -> bool {
        if self.abort.is_aborted() {
            report.fail(format!("aborted during {}", report.stage));
            true
        } else {
            false
        }
    }

    async fn trending_keywords(&self, report: &mut RunReport, options: &RunOptions, trends_selected: bool) -> (Vec<String>, bool) {
        let supplied: Vec<String> = options.keywords.iter().filter_map(|k| sanitize_keyword(k)).collect();
        if !supplied.is_empty() {
            info!(keywords = ?supplied, "using keywords supplied by the runner");
            return (supplied, false);
        }

        let mut found = Vec::new();
        match self.trends.as_ref().filter(|_| trends_selected) {
            Some(trends) => {
                let mut source_report = SourceReport::new(SourceKind::Trends);
                let query = FetchQuery::with_keywords(self.seed_keywords.clone());
                match trends.fetch(&self.http, &query).await {
                    Ok(fetch) => {
                        found = keywords_from_records(&fetch.records, MAX_TRENDING_KEYWORDS)
                            .into_iter()
                            .map(|k| k.into_inner())
                            .collect();
                        record_fetch(&mut source_report, fetch);
                    }
                    Err(err) => {
                        warn!(error = %err, "trends fetch failed");
                        source_report.status = SourceStatus::Failed { error: err.to_string() };
                    }
                }
                report.sources.push(source_report);
            }
            None => debug!("trends source not active"),
        }

        if found.is_empty() {
            info!(defaults = ?DEFAULT_KEYWORDS, "no trending keywords; falling back to defaults");
            (DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(), true)
        } else {
            info!(keywords = ?found, "trending keywords");
            (found, false)
        }
    }

    async fn fetch_sources(
        &self,
        active: &[&dyn SourceAdapter],
        query: &FetchQuery,
    ) -> Vec<Result<SourceFetch, AdapterError>> {
        if self.config.parallel_sources {
            join_all(active.iter().map(|adapter| self.fetch_one(*adapter, query))).await
        } else {
            let mut out = Vec::with_capacity(active.len());
            for adapter in active {
                out.push(self.fetch_one(*adapter, query).await);
            }
            out
        }
    }

    fn fetch_one<'a>(
        &'a self,
        adapter: &'a dyn SourceAdapter,
        query: &'a FetchQuery,
    ) -> impl Future<Output = Result<SourceFetch, AdapterError>> + Send + 'a {
        let span = info_span!("source_fetch", source_id = adapter.source_id());
        adapter.fetch(&self.http, query).instrument(span)
    }

    async fn persist_source(&self, source_report: &mut SourceReport, articles: &[Article]) {
        let Some(table) = source_report.source.table() else {
            return;
        };
        if articles.is_empty() {
            return;
        }
        match self.repository.persist(table, articles).await {
            Ok(outcome) => {
                source_report.inserted = outcome.inserted;
                source_report.duplicates = outcome.duplicates;
            }
            Err(err) => {
                error!(source = %source_report.source, error = %err, "batch rolled back");
                source_report.persist_error = Some(err.to_string());
            }
        }
    }

    /// The cron job re-runs the pipeline with default options.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&RunOptions::default()).await {
                    Ok(report) => info!(run_id = %report.run_id, stage = %report.stage, "scheduled run complete"),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    /// `None` unless `PULSE_SCHEDULER_ENABLED` is set.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }
}

fn record_fetch(source_report: &mut SourceReport, fetch: SourceFetch) -> Vec<pulse_core::RawRecord> {
    source_report.fetched = fetch.records.len();
    source_report.excluded = fetch.excluded;
    source_report.failed_batches = fetch.failed_batches;
    source_report.status = match fetch.status {
        FetchStatus::Complete => SourceStatus::Succeeded,
        FetchStatus::Exhausted { attempts, last_error } => SourceStatus::Exhausted { attempts, last_error },
    };
    fetch.records
}

/// Normalize in fetch order, counting drops per reason.
fn normalize_records(source_report: &mut SourceReport, records: &[pulse_core::RawRecord]) -> Vec<Article> {
    let mut articles = Vec::with_capacity(records.len());
    for record in records {
        match validate(record) {
            Ok(article) => articles.push(article),
            Err(reason) => {
                debug!(source = %source_report.source, reason = reason.as_str(), "record dropped");
                source_report.dropped += 1;
                *source_report.drop_reasons.entry(reason.as_str().to_string()).or_default() += 1;
            }
        }
    }
    if source_report.dropped > 0 {
        info!(
            source = %source_report.source,
            kept = articles.len(),
            dropped = source_report.dropped,
            "normalized"
        );
    }
    articles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_handle_is_shared_between_clones() {
        let handle = AbortHandle::default();
        let other = handle.clone();
        other.abort();
        assert!(handle.is_aborted());
        handle.reset();
        assert!(!other.is_aborted());
    }

    #[test]
    fn exhausted_fetch_counts_as_not_succeeded() {
        let mut report = SourceReport::new(SourceKind::News);
        let records = record_fetch(&mut report, SourceFetch::exhausted(4, "http status 503"));
        assert!(records.is_empty());
        assert!(!report.succeeded());
        assert!(matches!(report.status, SourceStatus::Exhausted { attempts: 4, .. }));
    }

    #[test]
    fn stage_names_match_serialized_form() {
        for stage in [RunStage::FetchingTrends, RunStage::Persisting, RunStage::Failed] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json.as_str(), Some(stage.as_str()));
        }
        assert!(RunStage::Done.is_terminal());
        assert!(!RunStage::Normalizing.is_terminal());
    }
}
