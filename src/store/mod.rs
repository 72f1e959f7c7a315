//! SQLite binding for the transactional store.
//!
//! [`Db`] hands out two transaction scopes:
//! - [`Db::view`]: a read transaction. Any number may run concurrently.
//! - [`Db::update`]: a write transaction. At most one is in flight per node;
//!   callers queue on an async mutex before the transaction begins.
//!
//! Entity persistence goes through the typed [`Repository`] trait, and the
//! policy link index lives in [`links`].

pub mod fields;
pub mod links;
pub mod repo;

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::StoreError;

pub use fields::FieldSet;
pub use repo::Repository;

/// Schema applied on open.
const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// A read transaction.
pub type ReadTxn = Transaction<'static, Sqlite>;

/// Handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

/// A write transaction holding the node-wide writer slot.
///
/// Dropping it without [`WriteTxn::commit`] rolls back and frees the slot.
pub struct WriteTxn {
    tx: Transaction<'static, Sqlite>,
    _slot: OwnedMutexGuard<()>,
}

impl WriteTxn {
    /// Commit and release the writer slot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if SQLite refuses the commit.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTxn {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for WriteTxn {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

impl Db {
    /// Open (or create) a database file and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: &Path, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "opened database");
        Self::from_pool(pool).await
    }

    /// Open a private in-memory database on a single connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Begin a read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    pub async fn view(&self) -> Result<ReadTxn, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Wait for the writer slot, then begin a write transaction.
    ///
    /// Never call this while holding a [`ReadTxn`] from the same `Db`: with
    /// a single-connection pool the write would wait on the read forever.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction cannot begin.
    pub async fn update(&self) -> Result<WriteTxn, StoreError> {
        let slot = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn { tx, _slot: slot })
    }

    /// Underlying pool, for ad hoc queries in tests and diagnostics.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

/// Encode a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub(crate) fn decode_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

/// Encode a string list as a JSON array.
pub(crate) fn encode_list(values: &[String]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(values)?)
}

/// Decode a JSON array column.
pub(crate) fn decode_list(raw: &str) -> Result<Vec<String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

/// Map a unique-index violation to [`StoreError::Conflict`].
pub(crate) fn map_unique(
    err: sqlx::Error,
    entity: &'static str,
    field: &'static str,
    value: &str,
) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
            entity,
            field,
            value: value.to_owned(),
        },
        _ => StoreError::Database(err),
    }
}
