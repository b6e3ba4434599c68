//! Canonical article model shared by every Pulse crate.
//!
//! Source adapters hand [`RawRecord`]s to the [`normalize`] stage, which turns
//! them into source-agnostic [`Article`]s keyed by `url`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod keywords;
pub mod normalize;

pub use keywords::{batch, sanitize_keyword, KeywordBatcher};
pub use normalize::{normalize, validate, DropReason};

pub const CRATE_NAME: &str = "pulse-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    News,
    Guardian,
    Reddit,
    Trends,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Trends,
        SourceKind::News,
        SourceKind::Guardian,
        SourceKind::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::News => "news",
            SourceKind::Guardian => "guardian",
            SourceKind::Reddit => "reddit",
            SourceKind::Trends => "trends",
        }
    }

    /// Table the source's articles land in. Trends only yields keywords.
    pub fn table(&self) -> Option<ArticleTable> {
        match self {
            SourceKind::News => Some(ArticleTable::NewsArticles),
            SourceKind::Guardian => Some(ArticleTable::GuardianArticles),
            SourceKind::Reddit => Some(ArticleTable::RedditPosts),
            SourceKind::Trends => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source kind `{0}` (expected news, guardian, reddit or trends)")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "news" | "newsapi" => Ok(SourceKind::News),
            "guardian" => Ok(SourceKind::Guardian),
            "reddit" => Ok(SourceKind::Reddit),
            "trends" => Ok(SourceKind::Trends),
            other => Err(UnknownSourceKind(other.to_string())),
        }
    }
}

/// One logical table per article category, each unique on `url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArticleTable {
    NewsArticles,
    GuardianArticles,
    RedditPosts,
}

impl ArticleTable {
    pub const ALL: [ArticleTable; 3] = [
        ArticleTable::NewsArticles,
        ArticleTable::GuardianArticles,
        ArticleTable::RedditPosts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ArticleTable::NewsArticles => "news_articles",
            ArticleTable::GuardianArticles => "guardian_articles",
            ArticleTable::RedditPosts => "reddit_posts",
        }
    }
}

/// Canonical, source-agnostic record persisted to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub source: String,
    pub author: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub score: Option<i64>,
}

/// Source-shaped payload exactly as an adapter received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: SourceKind,
    pub payload: JsonValue,
}

impl RawRecord {
    pub fn new(kind: SourceKind, payload: JsonValue) -> Self {
        Self { kind, payload }
    }
}

/// Sanitized keyword produced by one trends fetch and consumed by the news query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrendingKeyword(String);

impl TrendingKeyword {
    pub fn parse(raw: &str) -> Option<Self> {
        sanitize_keyword(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TrendingKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trips_through_str() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert_eq!("NewsAPI".parse::<SourceKind>().unwrap(), SourceKind::News);
        assert!("twitter".parse::<SourceKind>().is_err());
    }

    #[test]
    fn only_article_sources_map_to_tables() {
        assert_eq!(SourceKind::News.table(), Some(ArticleTable::NewsArticles));
        assert_eq!(SourceKind::Reddit.table().map(|t| t.name()), Some("reddit_posts"));
        assert_eq!(SourceKind::Trends.table(), None);
    }

    #[test]
    fn trending_keyword_is_sanitized() {
        let kw = TrendingKeyword::parse("  C++ & Rust!  ").unwrap();
        assert_eq!(kw.as_str(), "C Rust");
        assert!(TrendingKeyword::parse("?!").is_none());
    }
}
