//! Idempotent creation of the per-queue table, its indexes, and the
//! notification trigger.
//!
//! `ensure_schema` runs on first use; `migration_script` returns the same
//! DDL as text for callers that run migrations out-of-band.

use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::idempotency;
use crate::types::QueueConfig;

/// DDL statements that set up one queue, in execution order.
fn creation_statements(config: &QueueConfig) -> Vec<String> {
    let table = config.table_name();
    let channel = config.channel_name();

    vec![
        "CREATE EXTENSION IF NOT EXISTS pgcrypto".to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    type VARCHAR(255) NOT NULL,
    payload JSONB NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'PENDING'
        CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'DEAD_LETTER')),
    priority INTEGER NOT NULL DEFAULT 5,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    last_error TEXT,
    next_retry_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#
        ),
        // Claim order. now() is not allowed in an index predicate, so the
        // predicate covers every row that could become claimable.
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (priority ASC, created_at ASC) \
             WHERE status IN ('PENDING', 'FAILED')"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table} (status)"),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_retry_idx ON {table} (status, next_retry_at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_stale_idx ON {table} (status, updated_at)"
        ),
        format!(
            r#"CREATE OR REPLACE FUNCTION {table}_notify() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('{channel}', NEW.id::text);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
        ),
        format!("DROP TRIGGER IF EXISTS {table}_notify_trigger ON {table}"),
        format!(
            "CREATE TRIGGER {table}_notify_trigger AFTER INSERT ON {table} \
             FOR EACH ROW WHEN (NEW.status = 'PENDING') EXECUTE FUNCTION {table}_notify()"
        ),
    ]
}

/// Returns the complete schema creation script for this queue, including
/// the shared idempotency table, as runnable SQL text.
pub fn migration_script(config: &QueueConfig) -> String {
    let mut statements = creation_statements(config);
    statements.extend(idempotency::creation_statements());
    let mut script = statements.join(";\n\n");
    script.push_str(";\n");
    script
}

/// Creates the queue table, indexes, and trigger if the table is not yet
/// visible on the current search path. Safe to call repeatedly.
pub async fn ensure_schema(pool: &PgPool, config: &QueueConfig) -> Result<()> {
    let table = config.table_name();

    let existing: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .bind(&table)
        .fetch_one(pool)
        .await?;
    if existing.is_some() {
        debug!(table = %table, "queue schema already present");
        return Ok(());
    }

    let mut tx = pool.begin().await.map_err(|source| QueueError::Transaction {
        action: "begin",
        source,
    })?;

    for statement in creation_statements(config) {
        if let Err(source) = sqlx::query(&statement).execute(&mut *tx).await {
            let original = QueueError::Storage(source);
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after failed schema creation also failed");
            }
            return Err(original);
        }
    }

    tx.commit().await.map_err(|source| QueueError::Transaction {
        action: "commit",
        source,
    })?;

    info!(table = %table, channel = %config.channel_name(), "created queue schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig::new("orders")
    }

    #[test]
    fn script_targets_the_derived_table_and_channel() {
        let script = migration_script(&config());
        assert!(script.contains("CREATE TABLE IF NOT EXISTS systeric_pgqueue_orders"));
        assert!(script.contains("pg_notify('systeric_pgqueue_orders_channel', NEW.id::text)"));
    }

    #[test]
    fn script_creates_the_extension_first() {
        let script = migration_script(&config());
        let ext = script.find("CREATE EXTENSION IF NOT EXISTS pgcrypto").unwrap();
        let table = script.find("CREATE TABLE").unwrap();
        assert!(ext < table);
    }

    #[test]
    fn script_constrains_status_to_the_enumeration() {
        let script = migration_script(&config());
        assert!(script.contains(
            "CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'DEAD_LETTER'))"
        ));
    }

    #[test]
    fn script_builds_all_supporting_indexes() {
        let script = migration_script(&config());
        assert!(script.contains("(priority ASC, created_at ASC)"));
        assert!(script.contains("WHERE status IN ('PENDING', 'FAILED')"));
        assert!(script.contains("systeric_pgqueue_orders_status_idx"));
        assert!(script.contains("(status, next_retry_at)"));
        assert!(script.contains("(status, updated_at)"));
    }

    #[test]
    fn trigger_fires_only_for_pending_inserts() {
        let script = migration_script(&config());
        assert!(script.contains("AFTER INSERT ON systeric_pgqueue_orders"));
        assert!(script.contains("WHEN (NEW.status = 'PENDING')"));
    }

    #[test]
    fn script_includes_the_idempotency_table() {
        let script = migration_script(&config());
        assert!(script.contains("systeric_pgqueue_idempotency"));
        assert!(script.contains("idempotency_key VARCHAR(255) PRIMARY KEY"));
    }
}
