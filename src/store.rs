//! Storage adapter: every primitive against the per-queue table.
//!
//! The table name is a runtime value (one table per queue), so statements
//! are composed with the validated identifier and executed through runtime
//! queries with bound parameters. Caller data never reaches the SQL text.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, FromRow, PgPool, Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{is_unique_violation, QueueError, Result};
use crate::types::{FindOptions, Message, MessageStatus, QueueStats};

/// Column list shared by every statement that returns full rows.
const COLUMNS: &str = "id, type, payload, status, priority, retry_count, max_retries, \
                       last_error, next_retry_at, created_at, updated_at";

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    message_type: String,
    payload: serde_json::Value,
    status: String,
    priority: i32,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            message_type: self.message_type,
            payload: self.payload,
            status: self.status.parse::<MessageStatus>()?,
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn row_to_message(row: PgRow) -> Result<Message> {
    MessageRow::from_row(&row)
        .map_err(QueueError::Storage)?
        .into_message()
}

#[derive(Clone)]
pub(crate) struct MessageStore {
    pool: PgPool,
    table: String,
}

impl MessageStore {
    pub(crate) fn new(pool: PgPool, table: String) -> Self {
        Self { pool, table }
    }

    /// Insert a new PENDING message and return the stored row.
    ///
    /// Runs on any executor so enqueues can join a caller transaction; the
    /// insert trigger's notification becomes visible only at commit.
    pub(crate) async fn insert<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        message_type: &str,
        payload: &serde_json::Value,
        priority: i32,
        max_retries: i32,
    ) -> Result<Message>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "INSERT INTO {table} (id, type, payload, status, priority, max_retries) \
             VALUES ($1, $2, $3, 'PENDING', $4, $5) RETURNING {COLUMNS}",
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(message_type)
            .bind(payload)
            .bind(priority)
            .bind(max_retries)
            .fetch_one(executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    QueueError::DuplicateId(id)
                } else {
                    QueueError::Storage(err)
                }
            })?;

        tracing::debug!(%id, message_type, priority, "enqueued message");
        row_to_message(row)
    }

    /// Atomically claim the next PENDING message, if any.
    ///
    /// Candidates are ordered by ascending priority then insertion time;
    /// `FOR UPDATE SKIP LOCKED` lets concurrent claimers take distinct
    /// rows without blocking on each other's locks.
    pub(crate) async fn claim_next(&self) -> Result<Option<Message>> {
        let sql = format!(
            "UPDATE {table} SET status = 'PROCESSING', updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM {table} \
                 WHERE status = 'PENDING' \
                 ORDER BY priority ASC, created_at ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) RETURNING {COLUMNS}",
            table = self.table,
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let message = row_to_message(row)?;
                tracing::debug!(id = %message.id, message_type = %message.message_type, "claimed message");
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Transition a PROCESSING row to COMPLETED.
    ///
    /// Returns false when no row matched: the stale-reset sweeper may have
    /// reclaimed the row already, which is a benign race under
    /// at-least-once delivery.
    pub(crate) async fn ack(&self, id: Uuid) -> Result<bool> {
        let sql = format!(
            "UPDATE {table} SET status = 'COMPLETED', updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING'",
            table = self.table,
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        let matched = result.rows_affected() > 0;
        if matched {
            tracing::debug!(%id, "acked message");
        } else {
            tracing::debug!(%id, "ack matched no row; message was reclaimed");
        }
        Ok(matched)
    }

    /// Record a failed attempt.
    ///
    /// One atomic UPDATE increments `retry_count` and either dead-letters
    /// the message (budget exhausted) or schedules the retry at
    /// `now + min(2^(k-1), 60)` seconds, where `k` is the new count. The
    /// CASE expressions read the pre-update `retry_count`, so the cutover
    /// and the backoff are decided on the same snapshot.
    pub(crate) async fn nack(&self, id: Uuid, error: &str) -> Result<Message> {
        let sql = format!(
            "UPDATE {table} SET \
                 retry_count = retry_count + 1, \
                 status = CASE WHEN retry_count + 1 > max_retries \
                     THEN 'DEAD_LETTER' ELSE 'FAILED' END, \
                 last_error = $2, \
                 next_retry_at = CASE WHEN retry_count + 1 > max_retries \
                     THEN NULL \
                     ELSE NOW() + make_interval(secs => LEAST(2 ^ retry_count, 60)) END, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING' RETURNING {COLUMNS}",
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::RaceLost { id })?;

        let message = row_to_message(row)?;
        match message.status {
            MessageStatus::DeadLetter => {
                tracing::warn!(%id, retry_count = message.retry_count, error, "message dead-lettered")
            }
            _ => tracing::info!(
                %id,
                retry_count = message.retry_count,
                next_retry_at = ?message.next_retry_at,
                error,
                "message scheduled for retry"
            ),
        }
        Ok(message)
    }

    pub(crate) async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1",
            table = self.table
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(row_to_message).transpose()
    }

    /// List messages in one status. Sort column and direction come from
    /// closed enums, never from caller strings.
    pub(crate) async fn find_by_status(
        &self,
        status: MessageStatus,
        options: &FindOptions,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE status = $1 \
             ORDER BY {order_by} {order} LIMIT $2",
            table = self.table,
            order_by = options.order_by.as_sql(),
            order = options.order.as_sql(),
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(options.limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_message).collect()
    }

    /// Per-status counts and the age of the oldest row, in one query.
    pub(crate) async fn stats(&self) -> Result<QueueStats> {
        let sql = format!(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'PENDING') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing, \
                 COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'FAILED') AS failed, \
                 COUNT(*) FILTER (WHERE status = 'DEAD_LETTER') AS dead_letter, \
                 (EXTRACT(EPOCH FROM (NOW() - MIN(created_at))) * 1000)::BIGINT AS oldest_age_ms \
             FROM {table}",
            table = self.table,
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending: row.try_get("pending").map_err(QueueError::Storage)?,
            processing: row.try_get("processing").map_err(QueueError::Storage)?,
            completed: row.try_get("completed").map_err(QueueError::Storage)?,
            failed: row.try_get("failed").map_err(QueueError::Storage)?,
            dead_letter: row.try_get("dead_letter").map_err(QueueError::Storage)?,
            oldest_age_ms: row.try_get("oldest_age_ms").map_err(QueueError::Storage)?,
        })
    }

    /// Crash recovery: hand PROCESSING rows older than the visibility
    /// timeout back to PENDING. Returns how many rows moved.
    pub(crate) async fn reset_stale(&self, visibility_timeout: Duration) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET status = 'PENDING', updated_at = NOW() \
             WHERE status = 'PROCESSING' AND updated_at < NOW() - make_interval(secs => $1)",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(visibility_timeout.as_secs_f64())
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, "reset stale messages to PENDING");
        }
        Ok(count)
    }

    /// Promote FAILED rows whose retry-after has elapsed back to PENDING.
    pub(crate) async fn promote_retries(&self) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET status = 'PENDING', next_retry_at = NULL, updated_at = NOW() \
             WHERE status = 'FAILED' AND next_retry_at <= NOW()",
            table = self.table,
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, "promoted retry-eligible messages to PENDING");
        }
        Ok(count)
    }

    /// Manual requeue: from any status back to PENDING with a fresh retry
    /// budget.
    pub(crate) async fn retry(&self, id: Uuid) -> Result<Message> {
        let sql = format!(
            "UPDATE {table} SET status = 'PENDING', retry_count = 0, \
                 last_error = NULL, next_retry_at = NULL, updated_at = NOW() \
             WHERE id = $1 RETURNING {COLUMNS}",
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        tracing::info!(%id, "manually requeued message");
        row_to_message(row)
    }

    pub(crate) async fn cleanup_completed(&self, older_than_days: i32) -> Result<u64> {
        self.cleanup(MessageStatus::Completed, older_than_days).await
    }

    pub(crate) async fn cleanup_dead_letters(&self, older_than_days: i32) -> Result<u64> {
        self.cleanup(MessageStatus::DeadLetter, older_than_days).await
    }

    async fn cleanup(&self, status: MessageStatus, older_than_days: i32) -> Result<u64> {
        if older_than_days < 0 {
            return Err(QueueError::Validation(
                "older_than_days must be non-negative".into(),
            ));
        }
        let sql = format!(
            "DELETE FROM {table} \
             WHERE status = $1 AND updated_at < NOW() - make_interval(days => $2)",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(older_than_days)
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, status = %status, "cleaned up terminal messages");
        }
        Ok(count)
    }
}
