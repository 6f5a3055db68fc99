use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

pub type MessageId = Uuid;

/// Longest accepted message type, in bytes.
pub const MAX_TYPE_LEN: usize = 255;

/// Priority range; 1 is most urgent.
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;

/// A queued work item.
///
/// `id`, `message_type`, `priority`, `max_retries` and `created_at` are
/// write-once; everything else is mutated only by the storage adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Completed,
        MessageStatus::Failed,
        MessageStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Completed => "COMPLETED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "PROCESSING" => Ok(MessageStatus::Processing),
            "COMPLETED" => Ok(MessageStatus::Completed),
            "FAILED" => Ok(MessageStatus::Failed),
            "DEAD_LETTER" => Ok(MessageStatus::DeadLetter),
            other => Err(QueueError::Validation(format!(
                "{other:?} is not a valid message status"
            ))),
        }
    }
}

/// Per-queue configuration, immutable once the queue is created.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name; becomes part of the table identifier, so it must match
    /// `[A-Za-z_][A-Za-z0-9_]*`.
    pub queue_name: String,

    /// How long a message may sit in PROCESSING before the stale-reset
    /// sweeper hands it back to PENDING.
    pub visibility_timeout: Duration,

    /// Interval between background sweeps.
    pub sweep_interval: Duration,

    /// Retry budget applied to messages enqueued without an explicit one.
    pub default_max_retries: i32,
}

impl QueueConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            visibility_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            default_max_retries: 3,
        }
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Table backing this queue.
    pub fn table_name(&self) -> String {
        format!("systeric_pgqueue_{}", self.queue_name)
    }

    /// Notification channel for this queue.
    pub fn channel_name(&self) -> String {
        format!("{}_channel", self.table_name())
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("queue name", &self.queue_name)?;
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::Validation(
                "visibility timeout must be greater than zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(QueueError::Validation(
                "sweep interval must be greater than zero".into(),
            ));
        }
        if self.default_max_retries < 1 {
            return Err(QueueError::Validation(
                "default max retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Checks that `value` is a safe SQL identifier fragment: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_first || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(QueueError::Validation(format!(
            "{what} {value:?} must match [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    Ok(())
}

/// Per-message overrides for [`crate::PgQueue::enqueue_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Priority in `[1, 10]`; 1 is most urgent.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Per-status counts plus the age of the oldest row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
    /// Milliseconds since the oldest row was created; `None` on an empty queue.
    pub oldest_age_ms: Option<i64>,
}

/// Sort column accepted by [`crate::PgQueue::find_by_status`].
///
/// Dynamic sort input is constrained to this closed set; caller strings
/// never reach the composed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    Priority,
}

impl SortField {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Options for [`crate::PgQueue::find_by_status`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub limit: i64,
    pub order_by: SortField,
    pub order: SortOrder,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            order_by: SortField::CreatedAt,
            order: SortOrder::Asc,
        }
    }
}

/// Options for [`crate::PgQueue::start`].
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Maximum number of handlers running at once; must be at least 1.
    pub concurrency: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl ConsumeOptions {
    pub fn concurrency(concurrency: usize) -> Self {
        Self { concurrency }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(QueueError::Validation(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in MessageStatus::ALL {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("pending".parse::<MessageStatus>().is_err());
        assert!("".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn config_derives_table_and_channel_names() {
        let config = QueueConfig::new("emails");
        assert_eq!(config.table_name(), "systeric_pgqueue_emails");
        assert_eq!(config.channel_name(), "systeric_pgqueue_emails_channel");
    }

    #[test]
    fn config_defaults() {
        let config = QueueConfig::new("jobs");
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.default_max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_identifiers() {
        for name in ["", "1jobs", "my-queue", "a b", "x;drop table y", "ünïcode"] {
            assert!(
                QueueConfig::new(name).validate().is_err(),
                "{name:?} should be rejected"
            );
        }
        for name in ["jobs", "_private", "Queue2", "a_b_c"] {
            assert!(
                QueueConfig::new(name).validate().is_ok(),
                "{name:?} should be accepted"
            );
        }
    }

    #[test]
    fn config_rejects_zero_intervals() {
        assert!(QueueConfig::new("q")
            .visibility_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::new("q")
            .sweep_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::new("q")
            .default_max_retries(0)
            .validate()
            .is_err());
    }

    #[test]
    fn sort_inputs_compose_from_the_allow_list_only() {
        assert_eq!(SortField::CreatedAt.as_sql(), "created_at");
        assert_eq!(SortField::Priority.as_sql(), "priority");
        assert_eq!(SortOrder::Asc.as_sql(), "ASC");
        assert_eq!(SortOrder::Desc.as_sql(), "DESC");
    }

    #[test]
    fn find_options_defaults() {
        let opts = FindOptions::default();
        assert_eq!(opts.limit, 100);
        assert_eq!(opts.order_by, SortField::CreatedAt);
        assert_eq!(opts.order, SortOrder::Asc);
    }

    #[test]
    fn consume_options_require_a_worker() {
        assert!(ConsumeOptions::default().validate().is_ok());
        assert!(ConsumeOptions::concurrency(0).validate().is_err());
    }

    #[test]
    fn enqueue_options_builder() {
        let opts = EnqueueOptions::new().priority(1).max_retries(5);
        assert_eq!(opts.priority, Some(1));
        assert_eq!(opts.max_retries, Some(5));
    }
}
