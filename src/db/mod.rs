//! SQLite-backed job store: connection pool, migrations, and health check.
//!
//! The store is the only state shared between the producer and the worker.
//! Every state transition is a single write statement (or one explicit
//! transaction), so any number of workers can share one database file.

pub mod jobs;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Retry and recovery parameters.
///
/// `reclaim_delay` and `stuck_timeout` are independent: the first throttles
/// re-dequeue of a job that just failed, the second reclaims work from a
/// worker presumed dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// A job is marked `failed` once its retry count exceeds this.
    pub max_retries: u32,
    /// How long a failed job waits before it can be claimed again.
    pub reclaim_delay: Duration,
    /// Default age after which a `processing` job is considered abandoned.
    pub stuck_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reclaim_delay: Duration::from_secs(2 * 60),
            stuck_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Job store handle. Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl JobStore {
    /// Open (creating if missing) the database file at `path` and run all
    /// pending migrations.
    pub async fn open(
        path: impl AsRef<Path>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            clock,
            config,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Open with default retry parameters and the system clock.
    pub async fn open_default(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, StoreConfig::default(), Arc::new(SystemClock)).await
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection. Further calls on any clone fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current time in epoch milliseconds, from the injected clock.
    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

/// Milliseconds in a `Duration`, saturating at `i64::MAX`.
pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
