//! Deferred cascades driven by persisted eventual events.
//!
//! Deleting an api session enqueues an event in the same write transaction;
//! the processor later deletes the dependent sessions and the event. Events
//! survive restarts, so a crash between the two steps only delays cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::CascadeConfig;
use crate::error::StoreError;
use crate::store::{encode_time, Db};
use crate::types::new_id;

/// Event type for api session deletion.
pub const API_SESSION_DELETE_EVENT: &str = "apiSession.delete";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSessionDeleted {
    api_session_id: String,
}

/// Enqueue session cleanup for a deleted api session in the caller's
/// transaction.
///
/// # Errors
///
/// Returns [`StoreError`] on database or encoding failure.
pub async fn enqueue_api_session_delete(
    conn: &mut SqliteConnection,
    api_session_id: &str,
) -> Result<(), StoreError> {
    let data = serde_json::to_string(&ApiSessionDeleted {
        api_session_id: api_session_id.to_owned(),
    })?;
    sqlx::query("INSERT INTO eventual_events (id, event_type, data, created_at) VALUES (?, ?, ?, ?)")
        .bind(new_id())
        .bind(API_SESSION_DELETE_EVENT)
        .bind(data)
        .bind(encode_time(Utc::now()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Number of events not yet processed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn pending_events(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM eventual_events")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// What one pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Events consumed.
    pub events: usize,
    /// Sessions deleted.
    pub sessions_deleted: u64,
}

/// Consumes eventual events.
#[derive(Debug)]
pub struct CascadeProcessor {
    db: Db,
    signal: Arc<Notify>,
    batch_size: u32,
    interval: Duration,
}

impl CascadeProcessor {
    /// New processor woken by `signal` or every `config.interval_secs`.
    pub fn new(db: Db, signal: Arc<Notify>, config: &CascadeConfig) -> Self {
        Self {
            db,
            signal,
            batch_size: config.batch_size.max(1),
            interval: config.interval(),
        }
    }

    /// Process up to one batch of events, oldest first.
    ///
    /// Events of unknown type or with unreadable data are logged and
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write transaction fails; nothing is
    /// consumed in that case.
    pub async fn process_pending(&self) -> Result<CascadeOutcome, StoreError> {
        let mut txn = self.db.update().await?;
        let rows = sqlx::query(
            "SELECT id, event_type, data FROM eventual_events ORDER BY id LIMIT ?",
        )
        .bind(i64::from(self.batch_size))
        .fetch_all(&mut *txn)
        .await?;

        let mut outcome = CascadeOutcome::default();
        for row in &rows {
            let id: String = row.try_get("id")?;
            let event_type: String = row.try_get("event_type")?;
            let data: String = row.try_get("data")?;

            if event_type == API_SESSION_DELETE_EVENT {
                match serde_json::from_str::<ApiSessionDeleted>(&data) {
                    Ok(event) => {
                        let deleted = sqlx::query("DELETE FROM sessions WHERE api_session_id = ?")
                            .bind(&event.api_session_id)
                            .execute(&mut *txn)
                            .await?
                            .rows_affected();
                        outcome.sessions_deleted = outcome.sessions_deleted.saturating_add(deleted);
                        debug!(api_session_id = %event.api_session_id, deleted, "api session sessions removed");
                    }
                    Err(e) => warn!(event_id = %id, error = %e, "dropping unreadable eventual event"),
                }
            } else {
                warn!(event_id = %id, event_type, "dropping eventual event of unknown type");
            }

            sqlx::query("DELETE FROM eventual_events WHERE id = ?")
                .bind(&id)
                .execute(&mut *txn)
                .await?;
            outcome.events = outcome.events.saturating_add(1);
        }

        txn.commit().await?;
        Ok(outcome)
    }

    /// Drain every pending event.
    async fn drain(&self) {
        loop {
            match self.process_pending().await {
                Ok(outcome) if outcome.events > 0 => {
                    debug!(events = outcome.events, sessions = outcome.sessions_deleted, "cascade pass");
                    if outcome.events < usize::try_from(self.batch_size).unwrap_or(usize::MAX) {
                        break;
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "cascade pass failed");
                    break;
                }
            }
        }
    }

    /// Process events when signalled or on interval, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "cascade processor started"
        );
        let mut interval = tokio::time::interval(self.interval);

        // Events left over from a previous run are handled on the first tick.
        loop {
            tokio::select! {
                _ = interval.tick() => self.drain().await,
                () = self.signal.notified() => self.drain().await,
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("cascade processor stopped");
    }
}
