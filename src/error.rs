use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Boxed error type returned by message handlers and idempotent operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("storage operation failed")]
    Storage(#[source] sqlx::Error),

    #[error("transaction {action} failed")]
    Transaction {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("lost race for message {id}: row is no longer in the expected state")]
    RaceLost { id: Uuid },

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("duplicate message id {0}")]
    DuplicateId(Uuid),

    #[error("operation for idempotency key {key:?} is already in progress")]
    InProcess { key: String },

    #[error("failed to claim idempotency key {key:?}")]
    ClaimFailure {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("idempotency key {key:?} conflicted with a row that no longer exists; retry")]
    UniqueConstraint { key: String },

    #[error("no handler registered for message type {0:?}")]
    HandlerMissing(String),

    #[error("handler for {context:?} failed")]
    HandlerFailure {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{sweeper} sweep failed")]
    SweepFailure {
        sweeper: &'static str,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    /// Stable machine-readable code for this error kind.
    pub const fn code(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "VALIDATION",
            QueueError::Storage(_) => "STORAGE_FAULT",
            QueueError::Transaction { .. } => "TRANSACTION",
            QueueError::RaceLost { .. } => "RACE_LOST",
            QueueError::NotFound(_) => "NOT_FOUND",
            QueueError::DuplicateId(_) => "DUPLICATE_ID",
            QueueError::InProcess { .. } => "IN_PROCESS",
            QueueError::ClaimFailure { .. } => "CLAIM_FAILURE",
            QueueError::UniqueConstraint { .. } => "UNIQUE_CONSTRAINT",
            QueueError::HandlerMissing(_) => "HANDLER_MISSING",
            QueueError::HandlerFailure { .. } => "HANDLER_FAILURE",
            QueueError::SweepFailure { .. } => "SWEEP_FAILURE",
        }
    }

    pub(crate) fn handler_failure(context: impl Into<String>, source: BoxError) -> Self {
        QueueError::HandlerFailure {
            context: context.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(source: sqlx::Error) -> Self {
        QueueError::Storage(source)
    }
}

/// True when the database reported a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let id = Uuid::nil();
        let cases: Vec<(QueueError, &str)> = vec![
            (QueueError::Validation("x".into()), "VALIDATION"),
            (QueueError::Storage(sqlx::Error::PoolClosed), "STORAGE_FAULT"),
            (
                QueueError::Transaction {
                    action: "commit",
                    source: sqlx::Error::PoolClosed,
                },
                "TRANSACTION",
            ),
            (QueueError::RaceLost { id }, "RACE_LOST"),
            (QueueError::NotFound(id), "NOT_FOUND"),
            (QueueError::DuplicateId(id), "DUPLICATE_ID"),
            (QueueError::InProcess { key: "k".into() }, "IN_PROCESS"),
            (
                QueueError::ClaimFailure {
                    key: "k".into(),
                    source: sqlx::Error::PoolClosed,
                },
                "CLAIM_FAILURE",
            ),
            (
                QueueError::UniqueConstraint { key: "k".into() },
                "UNIQUE_CONSTRAINT",
            ),
            (QueueError::HandlerMissing("t".into()), "HANDLER_MISSING"),
            (
                QueueError::handler_failure("t", "boom".into()),
                "HANDLER_FAILURE",
            ),
            (
                QueueError::SweepFailure {
                    sweeper: "stale-reset",
                    source: Box::new(QueueError::Storage(sqlx::Error::PoolClosed)),
                },
                "SWEEP_FAILURE",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn cause_chain_is_preserved() {
        use std::error::Error as _;
        let err = QueueError::SweepFailure {
            sweeper: "retry-promotion",
            source: Box::new(QueueError::Storage(sqlx::Error::PoolClosed)),
        };
        let source = err.source().expect("sweep failure keeps its cause");
        let inner = source.downcast_ref::<QueueError>().unwrap();
        assert_eq!(inner.code(), "STORAGE_FAULT");
    }
}
