//! Api session heartbeat accumulator.
//!
//! Marks are coalesced in memory (last write wins per api session) and
//! written in one grouped write transaction, either when the batch size is
//! reached, on the flush interval, or on shutdown. Marking never touches
//! storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::ActivityConfig;
use crate::error::StoreError;
use crate::store::{encode_time, Db};

/// Collects api session activity and flushes it in batches.
#[derive(Debug)]
pub struct HeartbeatCollector {
    db: Db,
    pending: Mutex<HashMap<String, DateTime<Utc>>>,
    batch_size: usize,
    interval: std::time::Duration,
    full: Notify,
}

impl HeartbeatCollector {
    /// New collector.
    pub fn new(db: Db, config: &ActivityConfig) -> Self {
        Self {
            db,
            pending: Mutex::new(HashMap::new()),
            batch_size: config.batch_size.max(1),
            interval: config.interval(),
            full: Notify::new(),
        }
    }

    /// Record activity for an api session now.
    pub fn mark(&self, api_session_id: &str) {
        self.mark_at(api_session_id, Utc::now());
    }

    /// Record activity at a given time.
    pub fn mark_at(&self, api_session_id: &str, at: DateTime<Utc>) {
        let len = match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(api_session_id.to_owned(), at);
                pending.len()
            }
            Err(_) => return,
        };
        if len >= self.batch_size {
            self.full.notify_one();
        }
    }

    /// Number of api sessions awaiting a flush.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Write every pending mark. Returns the number of rows updated.
    ///
    /// Rows that fail to update are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write transaction cannot be opened or
    /// committed; the drained marks are lost in that case.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let batch: Vec<(String, DateTime<Utc>)> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return Ok(0),
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut txn = self.db.update().await?;
        let mut updated = 0usize;
        for (api_session_id, at) in &batch {
            let result = sqlx::query("UPDATE api_sessions SET last_activity_at = ? WHERE id = ?")
                .bind(encode_time(*at))
                .bind(api_session_id)
                .execute(&mut *txn)
                .await;
            match result {
                Ok(r) if r.rows_affected() > 0 => updated = updated.saturating_add(1),
                Ok(_) => debug!(api_session_id, "activity for unknown api session dropped"),
                Err(e) => warn!(api_session_id, error = %e, "failed to record api session activity"),
            }
        }
        txn.commit().await?;

        debug!(batch = batch.len(), updated, "api session activity flushed");
        Ok(updated)
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "api session activity flush failed");
        }
    }

    /// Flush on interval or when a batch fills, until shutdown. Pending marks
    /// are flushed once more before returning.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            interval_secs = self.interval.as_secs(),
            "activity flusher started"
        );
        let mut interval = tokio::time::interval(self.interval);

        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_logged().await,
                () = self.full.notified() => self.flush_logged().await,
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_logged().await;
        info!("activity flusher stopped");
    }
}
