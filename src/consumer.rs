//! Consumption loop: pairs registered handlers with claimed messages
//! under a concurrency bound, driven by notifications and two background
//! sweepers, with graceful drain on stop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BoxError, QueueError, Result};
use crate::events::QueueEvent;
use crate::listener::NotificationListener;
use crate::types::{ConsumeOptions, Message, MAX_TYPE_LEN};
use crate::{PgQueue, QueueInner};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered message handler: consumes one message, fails with any
/// boxed error. Failures are nacked and retried per the message's budget.
pub type Handler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

/// Wake-up hints buffered between the listener session and the loop.
/// Overflow is dropped: busy workers re-invoke try-consume on completion.
const WAKEUP_BUFFER: usize = 128;

impl PgQueue {
    /// Register `handler` for messages of `message_type`.
    ///
    /// Registering the same type again replaces the prior handler.
    pub fn register_handler<F, Fut>(&self, message_type: &str, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        if message_type.is_empty() {
            return Err(QueueError::Validation(
                "message type must be a non-empty string".into(),
            ));
        }
        if message_type.len() > MAX_TYPE_LEN {
            return Err(QueueError::Validation(format!(
                "message type exceeds {MAX_TYPE_LEN} bytes"
            )));
        }

        let handler: Handler = Arc::new(move |message| {
            Box::pin(handler(message))
                as BoxFuture<'static, std::result::Result<(), BoxError>>
        });
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap()
            .insert(message_type.to_string(), handler);
        if replaced.is_some() {
            debug!(message_type, "replaced existing handler");
        }
        Ok(())
    }

    /// Start consuming. Idempotent: a second call while running is a no-op.
    ///
    /// Opens the notification listener, arms the stale-reset and
    /// retry-promotion sweepers, and kicks `concurrency` initial
    /// try-consume attempts.
    pub async fn start(&self, options: ConsumeOptions) -> Result<()> {
        options.validate()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("consumption loop already running");
            return Ok(());
        }
        self.inner
            .concurrency
            .store(options.concurrency, Ordering::SeqCst);

        let (wakeup_tx, mut wakeup_rx) = mpsc::channel::<String>(WAKEUP_BUFFER);
        let listener = match NotificationListener::start(
            &self.inner.pool,
            self.inner.config.channel_name(),
            wakeup_tx,
        )
        .await
        {
            Ok(listener) => listener,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        *self.inner.listener.lock().await = Some(listener);

        let inner = Arc::clone(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(payload) = wakeup_rx.recv().await {
                inner.emit(QueueEvent::Notification { payload });
                spawn_try_consume(Arc::clone(&inner));
            }
        });

        let mut background = self.inner.background.lock().await;
        background.push(pump);
        background.push(spawn_sweeper(Arc::clone(&self.inner), Sweep::StaleReset));
        background.push(spawn_sweeper(Arc::clone(&self.inner), Sweep::RetryPromotion));
        drop(background);

        self.inner.emit(QueueEvent::Started {
            concurrency: options.concurrency,
        });
        info!(
            queue = %self.inner.config.queue_name,
            concurrency = options.concurrency,
            "consumption loop started"
        );

        for _ in 0..options.concurrency {
            spawn_try_consume(Arc::clone(&self.inner));
        }
        Ok(())
    }

    /// Stop consuming. Idempotent.
    ///
    /// Cancels the sweep timers, waits for every in-flight handler to
    /// finish, releases the listener session, and closes the pool only
    /// when this engine owns it.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut background = self.inner.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
        drop(background);

        loop {
            let notified = self.inner.drained.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        if let Some(listener) = self.inner.listener.lock().await.take() {
            listener.stop().await;
        }

        if self.inner.owns_pool {
            self.inner.pool.close().await;
        }

        self.inner.emit(QueueEvent::Stopped);
        info!(queue = %self.inner.config.queue_name, "consumption loop stopped");
        Ok(())
    }
}

pub(crate) fn spawn_try_consume(inner: Arc<QueueInner>) {
    tokio::spawn(try_consume(inner));
}

/// One consumption step: claim at most one message and run its handler.
///
/// A worker slot is reserved before the dequeue so concurrent wake-ups
/// cannot exceed the cap; wake-ups arriving while saturated simply return.
/// On handler completion the slot is released and the step re-invokes
/// itself, which is what drains arbitrarily large backlogs.
async fn try_consume(inner: Arc<QueueInner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    let cap = inner.concurrency.load(Ordering::SeqCst);
    if inner
        .active
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < cap).then_some(n + 1)
        })
        .is_err()
    {
        return;
    }

    let message = match inner.store.claim_next().await {
        Ok(Some(message)) => message,
        Ok(None) => {
            release_slot(&inner);
            return;
        }
        Err(err) => {
            error!(error = %err, "dequeue failed");
            inner.emit(QueueEvent::Error {
                code: err.code(),
                message: err.to_string(),
            });
            release_slot(&inner);
            return;
        }
    };

    inner.emit(QueueEvent::Dequeued {
        id: message.id,
        message_type: message.message_type.clone(),
    });

    dispatch(&inner, message).await;

    release_slot(&inner);
    if inner.running.load(Ordering::SeqCst) {
        spawn_try_consume(inner);
    }
}

fn release_slot(inner: &QueueInner) {
    if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.drained.notify_waiters();
    }
}

/// Run the handler for one claimed message and settle it.
///
/// Handler failures never propagate: success acks, errors and panics
/// nack, and the nack applies the retry/dead-letter policy.
async fn dispatch(inner: &Arc<QueueInner>, message: Message) {
    let id = message.id;
    let message_type = message.message_type.clone();

    let handler = inner.handlers.read().unwrap().get(&message_type).cloned();
    let Some(handler) = handler else {
        let err = QueueError::HandlerMissing(message_type.clone());
        warn!(%id, %message_type, "no handler registered for message type");
        inner.emit(QueueEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
        nack_contained(inner, id, &err.to_string()).await;
        return;
    };

    // The handler runs in its own task so a panic surfaces as a join
    // error instead of unwinding through the slot accounting.
    match tokio::spawn(handler(message)).await {
        Ok(Ok(())) => match inner.store.ack(id).await {
            Ok(true) => inner.emit(QueueEvent::Ack { id }),
            Ok(false) => {
                // A sweeper reclaimed the row first; the message will be
                // redelivered, which at-least-once allows.
            }
            Err(err) => {
                error!(%id, error = %err, "ack failed");
                inner.emit(QueueEvent::Error {
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        },
        Ok(Err(source)) => {
            let detail = format!("handler for {message_type:?} failed: {source}");
            error!(%id, %message_type, error = %source, "handler failed");
            nack_contained(inner, id, &detail).await;
        }
        Err(join_err) => {
            let detail = format!("handler for {message_type:?} panicked: {join_err}");
            error!(%id, %message_type, "handler panicked");
            nack_contained(inner, id, &detail).await;
        }
    }
}

async fn nack_contained(inner: &Arc<QueueInner>, id: Uuid, detail: &str) {
    match inner.store.nack(id, detail).await {
        Ok(_) => inner.emit(QueueEvent::Nack {
            id,
            error: detail.to_string(),
        }),
        Err(QueueError::RaceLost { .. }) => {
            // The row left PROCESSING under us (stale reset); the sweepers
            // already reconciled it.
            debug!(%id, "nack lost the race; message was reclaimed");
        }
        Err(err) => {
            error!(%id, error = %err, "nack failed");
            inner.emit(QueueEvent::Error {
                code: err.code(),
                message: err.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    StaleReset,
    RetryPromotion,
}

impl Sweep {
    const fn name(self) -> &'static str {
        match self {
            Sweep::StaleReset => "stale-reset",
            Sweep::RetryPromotion => "retry-promotion",
        }
    }
}

/// One sweeper: a sequential sleep-then-sweep loop, so ticks can never
/// overlap, with its own failure backoff state.
fn spawn_sweeper(inner: Arc<QueueInner>, sweep: Sweep) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Duration::ZERO;
        loop {
            tokio::time::sleep(inner.config.sweep_interval + backoff).await;
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            let outcome = match sweep {
                Sweep::StaleReset => {
                    inner.store.reset_stale(inner.config.visibility_timeout).await
                }
                Sweep::RetryPromotion => inner.store.promote_retries().await,
            };

            match outcome {
                Ok(count) => {
                    backoff = Duration::ZERO;
                    if count > 0 {
                        inner.emit(match sweep {
                            Sweep::StaleReset => QueueEvent::StaleReset { count },
                            Sweep::RetryPromotion => QueueEvent::RetryReset { count },
                        });
                    }
                    // Promoted and reset rows fire no insert trigger, and a
                    // notification may have been missed; kick the loop up
                    // to the cap so they are picked up within one interval.
                    for _ in 0..inner.concurrency.load(Ordering::SeqCst) {
                        spawn_try_consume(Arc::clone(&inner));
                    }
                }
                Err(source) => {
                    let err = QueueError::SweepFailure {
                        sweeper: sweep.name(),
                        source: Box::new(source),
                    };
                    warn!(sweeper = sweep.name(), error = %err, "sweep failed");
                    inner.emit(QueueEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    });
                    backoff = next_backoff(backoff);
                }
            }
        }
    })
}

/// Failure backoff: `min(max(1 s, 2x), 60 s)`.
fn next_backoff(current: Duration) -> Duration {
    (current * 2)
        .max(Duration::from_millis(1000))
        .min(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second_and_caps_at_sixty() {
        let mut backoff = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..10 {
            backoff = next_backoff(backoff);
            observed.push(backoff.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
    }
}
