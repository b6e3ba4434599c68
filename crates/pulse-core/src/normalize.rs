//! Pure mapping from source-shaped payloads to canonical [`Article`]s.
//!
//! Missing mandatory data is never an error here: the record is dropped with a
//! [`DropReason`] and the caller decides how to log or count it.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{Article, RawRecord, SourceKind};

/// Title NewsAPI substitutes for articles that were taken down.
const NEWSAPI_REMOVED_TITLE: &str = "[Removed]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    #[error("missing title")]
    MissingTitle,
    #[error("missing url")]
    MissingUrl,
    #[error("missing source")]
    MissingSource,
    #[error("missing publication timestamp")]
    MissingPublishedAt,
    #[error("unparsable publication timestamp")]
    UnparsableTimestamp,
    #[error("removed-content placeholder")]
    RemovedPlaceholder,
    #[error("source does not produce articles")]
    NotAnArticleSource,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingTitle => "missing_title",
            DropReason::MissingUrl => "missing_url",
            DropReason::MissingSource => "missing_source",
            DropReason::MissingPublishedAt => "missing_published_at",
            DropReason::UnparsableTimestamp => "unparsable_timestamp",
            DropReason::RemovedPlaceholder => "removed_placeholder",
            DropReason::NotAnArticleSource => "not_an_article_source",
        }
    }
}

/// `Some(article)` when every mandatory field is present, `None` otherwise.
pub fn normalize(record: &RawRecord) -> Option<Article> {
    validate(record).ok()
}

/// Like [`normalize`] but reports why a record was dropped.
pub fn validate(record: &RawRecord) -> Result<Article, DropReason> {
    let extracted = match record.kind {
        SourceKind::News => extract_newsapi(&record.payload),
        SourceKind::Guardian => extract_guardian(&record.payload),
        SourceKind::Reddit => extract_reddit(&record.payload),
        SourceKind::Trends => return Err(DropReason::NotAnArticleSource),
    };
    extracted.into_article()
}

#[derive(Debug, Default)]
struct Extracted {
    source: Option<String>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Timestamp,
    score: Option<i64>,
}

#[derive(Debug, Default)]
enum Timestamp {
    #[default]
    Missing,
    Text(String),
    Epoch(f64),
}

impl Extracted {
    fn into_article(self) -> Result<Article, DropReason> {
        let title = self.title.ok_or(DropReason::MissingTitle)?;
        let url = self.url.ok_or(DropReason::MissingUrl)?;
        if title == NEWSAPI_REMOVED_TITLE {
            return Err(DropReason::RemovedPlaceholder);
        }
        let source = self.source.ok_or(DropReason::MissingSource)?;
        let published_at = match self.published_at {
            Timestamp::Missing => return Err(DropReason::MissingPublishedAt),
            Timestamp::Text(text) => parse_timestamp(&text).ok_or(DropReason::UnparsableTimestamp)?,
            Timestamp::Epoch(secs) => from_epoch(secs).ok_or(DropReason::UnparsableTimestamp)?,
        };
        Ok(Article {
            source,
            author: self.author,
            title,
            description: self.description,
            url,
            published_at,
            score: self.score,
        })
    }
}

fn extract_newsapi(payload: &JsonValue) -> Extracted {
    Extracted {
        source: text_at(payload, "/source/name").or_else(|| Some("newsapi".to_string())),
        author: text_at(payload, "/author"),
        title: text_at(payload, "/title"),
        description: text_at(payload, "/description"),
        url: text_at(payload, "/url"),
        published_at: timestamp_at(payload, "/publishedAt"),
        score: None,
    }
}

fn extract_guardian(payload: &JsonValue) -> Extracted {
    Extracted {
        source: Some("guardian".to_string()),
        author: text_at(payload, "/fields/byline"),
        title: text_at(payload, "/webTitle").or_else(|| text_at(payload, "/fields/headline")),
        description: text_at(payload, "/fields/trailText"),
        url: text_at(payload, "/webUrl"),
        published_at: timestamp_at(payload, "/webPublicationDate"),
        score: None,
    }
}

fn extract_reddit(payload: &JsonValue) -> Extracted {
    let source = match text_at(payload, "/subreddit") {
        Some(sub) => format!("reddit/r/{sub}"),
        None => "reddit".to_string(),
    };
    let url = text_at(payload, "/url").or_else(|| {
        text_at(payload, "/permalink").map(|p| format!("https://www.reddit.com{p}"))
    });
    Extracted {
        source: Some(source),
        author: text_at(payload, "/author"),
        title: text_at(payload, "/title"),
        description: text_at(payload, "/selftext"),
        url,
        published_at: timestamp_at(payload, "/created_utc"),
        score: payload.pointer("/score").and_then(JsonValue::as_i64),
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn text_at(payload: &JsonValue, pointer: &str) -> Option<String> {
    payload
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .and_then(text_or_none)
}

fn timestamp_at(payload: &JsonValue, pointer: &str) -> Timestamp {
    match payload.pointer(pointer) {
        Some(JsonValue::String(s)) => match text_or_none(s) {
            Some(text) => Timestamp::Text(text),
            None => Timestamp::Missing,
        },
        Some(JsonValue::Number(n)) => n.as_f64().map(Timestamp::Epoch).unwrap_or_default(),
        _ => Timestamp::Missing,
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// (taken as UTC) and Unix seconds written as text.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    text.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}
