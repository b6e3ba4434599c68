//! Run summaries on disk: `reports/<run_id>/run_summary.json` and `ingest_brief.md`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tokio::fs;

use crate::{RunReport, SourceStatus};

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "ingest_brief.md";

pub async fn write_run_reports(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(dir.join(SUMMARY_FILE), summary)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(dir.join(BRIEF_FILE), ingest_brief(report))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(dir)
}

pub fn ingest_brief(report: &RunReport) -> String {
    let mut lines = vec![
        "# Ingest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!(
            "- Finished: {}",
            report
                .finished_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("- Final stage: {}", report.stage),
    ];
    if let Some(failure) = &report.failure {
        lines.push(format!("- Failure: {failure}"));
    }
    let origin = if report.used_default_keywords { " (defaults)" } else { "" };
    lines.push(format!("- Keywords{origin}: {}", report.keywords.join(", ")));
    lines.push(String::new());
    lines.push("## Sources".to_string());
    lines.push(String::new());
    lines.push("| source | status | fetched | excluded | dropped | inserted | duplicates |".to_string());
    lines.push("|---|---|---|---|---|---|---|".to_string());
    for source in &report.sources {
        let status = match &source.status {
            SourceStatus::Succeeded => "succeeded".to_string(),
            SourceStatus::Exhausted { attempts, .. } => format!("failed (retries exhausted after {attempts})"),
            SourceStatus::Failed { error } => format!("failed ({error})"),
            SourceStatus::Skipped => "skipped".to_string(),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            source.source, status, source.fetched, source.excluded, source.dropped, source.inserted, source.duplicates
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown summary of the `runs` most recent runs under `reports_root`, newest first.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries: Vec<(String, JsonValue)> = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(reports_root).with_context(|| format!("reading {}", reports_root.display()))? {
            let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
            let path = entry.path().join(SUMMARY_FILE);
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let value: JsonValue =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            let started = value
                .get("started_at")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            summaries.push((started, value));
        }
    }
    summaries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec!["# Recent Ingest Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("_no runs recorded_".to_string());
    }
    for (started, summary) in summaries.into_iter().take(runs.max(1)) {
        let run_id = summary.get("run_id").and_then(JsonValue::as_str).unwrap_or("unknown");
        let stage = summary.get("stage").and_then(JsonValue::as_str).unwrap_or("unknown");
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- started: {started}"));
        lines.push(format!("- stage: {stage}"));
        let sources = summary
            .get("sources")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for source in sources {
            let name = source.get("source").and_then(JsonValue::as_str).unwrap_or("?");
            let state = source
                .pointer("/status/state")
                .and_then(JsonValue::as_str)
                .unwrap_or("?");
            let inserted = source.get("inserted").and_then(JsonValue::as_u64).unwrap_or(0);
            let dropped = source.get("dropped").and_then(JsonValue::as_u64).unwrap_or(0);
            lines.push(format!("- {name}: {state}, inserted {inserted}, dropped {dropped}"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
