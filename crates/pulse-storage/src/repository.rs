//! Idempotent article persistence.
//!
//! Every table is unique on `url`. Inserts are insert-or-skip: a second row
//! with a known `url` is counted as a duplicate, never an error and never
//! an update. Each [`ArticleRepository::persist`] call is one transaction.

use chrono::{DateTime, Utc};
use pulse_core::{Article, ArticleTable};
use serde::Serialize;
use sqlx::Transaction;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::{RetryDisposition, RetryError, RetryPolicy, Retryable};

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("pulse-storage needs the `sqlite` or `postgres` feature");

#[cfg(feature = "postgres")]
pub type Db = sqlx::Postgres;
#[cfg(not(feature = "postgres"))]
pub type Db = sqlx::Sqlite;

pub type DbPool = sqlx::Pool<Db>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database connection failed: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("schema setup for {table} failed: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("transaction on {table} rolled back: {source}")]
    Transaction {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("query on {table} failed: {source}")]
    Query {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl Retryable for PersistError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            PersistError::Connection(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
                _ => RetryDisposition::NonRetryable,
            },
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub attempted: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

/// Open a pool without retrying.
#[cfg(not(feature = "postgres"))]
pub async fn open_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    use std::str::FromStr;

    let options = sqlx::sqlite::SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
}

/// Open a pool without retrying.
#[cfg(feature = "postgres")]
pub async fn open_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
}

/// Connection factory: transient connection failures are retried here, at
/// the connection layer, with the shared backoff.
pub async fn connect_with_retry(
    database_url: &str,
    policy: &RetryPolicy,
) -> Result<DbPool, RetryError<PersistError>> {
    policy
        .execute("database-connect", move |_| async move {
            open_pool(database_url).await.map_err(PersistError::Connection)
        })
        .await
}

#[cfg(not(feature = "postgres"))]
fn create_table_sql(table: ArticleTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            author TEXT,
            title TEXT NOT NULL,
            description TEXT,
            url TEXT NOT NULL UNIQUE,
            published_at TEXT NOT NULL,
            score INTEGER,
            inserted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        table.name()
    )
}

#[cfg(feature = "postgres")]
fn create_table_sql(table: ArticleTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            source TEXT NOT NULL,
            author TEXT,
            title TEXT NOT NULL,
            description TEXT,
            url TEXT NOT NULL UNIQUE,
            published_at TIMESTAMPTZ NOT NULL,
            score BIGINT,
            inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        table.name()
    )
}

/// Create every article table if it does not exist yet.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), PersistError> {
    for table in ArticleTable::ALL {
        sqlx::query(&create_table_sql(table))
            .execute(pool)
            .await
            .map_err(|source| PersistError::Schema {
                table: table.name(),
                source,
            })?;
        debug!(table = table.name(), "table ready");
    }
    Ok(())
}

/// Scoped transaction handle. [`DbSession::finish`] commits on `Ok` and rolls
/// back on `Err`; a session dropped without `finish` is rolled back by sqlx.
pub struct DbSession {
    tx: Transaction<'static, Db>,
}

impl DbSession {
    pub async fn begin(pool: &DbPool) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tx: pool.begin().await?,
        })
    }

    /// `Ok(true)` if a row was written, `Ok(false)` if `url` already existed.
    pub async fn insert_or_skip(&mut self, table: ArticleTable, article: &Article) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (source, author, title, description, url, published_at, score)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (url) DO NOTHING",
            table.name()
        );
        let result = sqlx::query(&sql)
            .bind(&article.source)
            .bind(article.author.as_deref())
            .bind(&article.title)
            .bind(article.description.as_deref())
            .bind(&article.url)
            .bind(article.published_at)
            .bind(article.score)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish<T>(self, result: Result<T, sqlx::Error>) -> Result<T, sqlx::Error> {
        match result {
            Ok(value) => {
                self.tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ArticleRow {
    source: String,
    author: Option<String>,
    title: String,
    description: Option<String>,
    url: String,
    published_at: DateTime<Utc>,
    score: Option<i64>,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article {
            source: row.source,
            author: row.author,
            title: row.title,
            description: row.description,
            url: row.url,
            published_at: row.published_at,
            score: row.score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArticleRepository {
    pool: DbPool,
}

impl ArticleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert every article inside one transaction. Duplicates by `url` are
    /// skipped; any other failure rolls the whole batch back.
    pub async fn persist(&self, table: ArticleTable, articles: &[Article]) -> Result<PersistOutcome, PersistError> {
        let mut session = DbSession::begin(&self.pool)
            .await
            .map_err(PersistError::Connection)?;

        let mut outcome = PersistOutcome::default();
        let result = async {
            for article in articles {
                outcome.attempted += 1;
                if session.insert_or_skip(table, article).await? {
                    outcome.inserted += 1;
                } else {
                    outcome.duplicates += 1;
                    debug!(table = table.name(), url = %article.url, "already present; skipped");
                }
            }
            Ok::<_, sqlx::Error>(())
        }
        .await;

        session
            .finish(result)
            .await
            .map_err(|source| PersistError::Transaction {
                table: table.name(),
                source,
            })?;

        info!(
            table = table.name(),
            attempted = outcome.attempted,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "batch committed"
        );
        Ok(outcome)
    }

    pub async fn count(&self, table: ArticleTable) -> Result<i64, PersistError> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.pool)
            .await
            .map_err(|source| PersistError::Query {
                table: table.name(),
                source,
            })
    }

    pub async fn find_by_url(&self, table: ArticleTable, url: &str) -> Result<Option<Article>, PersistError> {
        let sql = format!(
            "SELECT source, author, title, description, url, published_at, score FROM {} WHERE url = $1",
            table.name()
        );
        let row = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| PersistError::Query {
                table: table.name(),
                source,
            })?;
        Ok(row.map(Article::from))
    }

    pub async fn contains(&self, table: ArticleTable, url: &str) -> Result<bool, PersistError> {
        Ok(self.find_by_url(table, url).await?.is_some())
    }
}
