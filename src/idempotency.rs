//! At-most-once effect per key, across processes and redeliveries.
//!
//! The protocol claims a key by inserting a null-result row; the insert's
//! primary-key constraint decides who runs the operation. The winner
//! caches its result in the same row; everyone else reads the cache or
//! observes the in-flight claim.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use tracing::debug;

use crate::error::{is_unique_violation, BoxError, QueueError, Result};

const TABLE: &str = "systeric_pgqueue_idempotency";

/// Longest accepted idempotency key, in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// DDL for the shared idempotency table.
pub(crate) fn creation_statements() -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {TABLE} (
    idempotency_key VARCHAR(255) PRIMARY KEY,
    result JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL
)"#
        ),
        format!("CREATE INDEX IF NOT EXISTS {TABLE}_expires_idx ON {TABLE} (expires_at)"),
    ]
}

/// Outcome of an idempotent execution.
///
/// `first` is true for the caller whose operation actually ran; everyone
/// else receives the cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution<T> {
    pub first: bool,
    pub result: T,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: PgPool,
}

impl IdempotencyStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) async fn ensure_table(&self) -> Result<()> {
        for statement in creation_statements() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Run `op` at most once for `key` within `ttl`.
    ///
    /// Exactly one concurrent caller claims the key and runs `op`; it sees
    /// `first = true`. Later callers receive the cached result with
    /// `first = false`, or [`QueueError::InProcess`] while `op` is still
    /// running.
    ///
    /// If `op` fails, the claim stays in place until the TTL expires (the
    /// external side effect may have happened); use [`invalidate`] to
    /// release it explicitly. A result that serializes to JSON `null` is
    /// indistinguishable from an in-flight claim, so operations should
    /// return non-null values.
    ///
    /// [`invalidate`]: IdempotencyStore::invalidate
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        validate_key(key)?;
        validate_ttl(ttl)?;

        match claim(&self.pool, key, ttl).await {
            Ok(()) => {
                debug!(key, "claimed idempotency key");
                let result = op()
                    .await
                    .map_err(|source| QueueError::handler_failure(key, source))?;
                let cached = to_json(key, &result)?;
                write_result(&self.pool, key, &cached).await?;
                Ok(Execution {
                    first: true,
                    result,
                })
            }
            Err(err) if is_unique_violation(&err) => resolve_conflict(&self.pool, key).await,
            Err(source) => Err(QueueError::ClaimFailure {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Like [`execute`], but the claim and the result write run on the
    /// caller's connection, so a rolled-back transaction also releases
    /// the claim.
    ///
    /// [`execute`]: IdempotencyStore::execute
    pub async fn execute_on<T, F, Fut>(
        &self,
        conn: &mut PgConnection,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        validate_key(key)?;
        validate_ttl(ttl)?;

        match claim(&mut *conn, key, ttl).await {
            Ok(()) => {
                debug!(key, "claimed idempotency key in caller session");
                let result = op()
                    .await
                    .map_err(|source| QueueError::handler_failure(key, source))?;
                let cached = to_json(key, &result)?;
                write_result(&mut *conn, key, &cached).await?;
                Ok(Execution {
                    first: true,
                    result,
                })
            }
            Err(err) if is_unique_violation(&err) => resolve_conflict(&mut *conn, key).await,
            Err(source) => Err(QueueError::ClaimFailure {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Delete expired rows; their keys become claimable again.
    pub async fn cleanup(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {TABLE} WHERE expires_at <= NOW()"))
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            debug!(count, "cleaned up expired idempotency keys");
        }
        Ok(count)
    }

    /// Remove a key unconditionally, releasing any claim or cached result.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE idempotency_key = $1"
        ))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn claim<'e, E>(executor: E, key: &str, ttl: Duration) -> std::result::Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(&format!(
        "INSERT INTO {TABLE} (idempotency_key, result, expires_at) \
         VALUES ($1, NULL, NOW() + make_interval(secs => $2))"
    ))
    .bind(key)
    .bind(ttl.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

async fn write_result<'e, E>(executor: E, key: &str, cached: &serde_json::Value) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(&format!(
        "UPDATE {TABLE} SET result = $2 WHERE idempotency_key = $1"
    ))
    .bind(key)
    .bind(cached)
    .execute(executor)
    .await?;
    Ok(())
}

/// Someone else holds the key: hand back their cached result, report the
/// claim as in-flight, or — if the row expired and was cleaned between our
/// insert and this read — tell the caller it is safe to retry.
async fn resolve_conflict<'e, E, T>(executor: E, key: &str) -> Result<Execution<T>>
where
    E: Executor<'e, Database = Postgres>,
    T: DeserializeOwned,
{
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(&format!(
        "SELECT result FROM {TABLE} WHERE idempotency_key = $1"
    ))
    .bind(key)
    .fetch_optional(executor)
    .await?;

    match row {
        Some((Some(cached),)) => Ok(Execution {
            first: false,
            result: from_json(key, cached)?,
        }),
        Some((None,)) => Err(QueueError::InProcess {
            key: key.to_string(),
        }),
        None => Err(QueueError::UniqueConstraint {
            key: key.to_string(),
        }),
    }
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|err| {
        QueueError::Validation(format!("result for key {key:?} is not serializable: {err}"))
    })
}

fn from_json<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| {
        QueueError::Validation(format!(
            "cached result for key {key:?} does not match the requested type: {err}"
        ))
    })
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(QueueError::Validation("idempotency key is empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(QueueError::Validation(format!(
            "idempotency key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(QueueError::Validation(
            "idempotency ttl must be greater than zero".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_bounded() {
        assert!(validate_key("k").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn ttl_must_be_positive() {
        assert!(validate_ttl(Duration::from_secs(60)).is_ok());
        assert!(validate_ttl(Duration::ZERO).is_err());
    }

    #[test]
    fn table_ddl_has_the_primary_key_and_expiry_index() {
        let ddl = creation_statements().join(";\n");
        assert!(ddl.contains("idempotency_key VARCHAR(255) PRIMARY KEY"));
        assert!(ddl.contains("result JSONB"));
        assert!(ddl.contains("(expires_at)"));
    }
}
