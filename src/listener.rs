//! Notification listener: one dedicated LISTEN session per queue.
//!
//! Notifications are best-effort wake-ups, not durable messages. The
//! listener pumps payloads into a bounded channel with `try_send`; a
//! dropped wake-up is covered by the consumption loop's re-invocation on
//! handler completion and by the background sweeps.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

pub(crate) struct NotificationListener {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl NotificationListener {
    /// Acquire a session, subscribe to `channel`, and start the read loop.
    ///
    /// The session is held outside normal pool checkout for the lifetime
    /// of the listener and is released on every exit path of the loop.
    pub(crate) async fn start(
        pool: &PgPool,
        channel: String,
        wakeups: mpsc::Sender<String>,
    ) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(&channel).await?;
        info!(channel = %channel, "listening for queue notifications");

        let shutdown = Arc::new(Notify::new());
        let shutdown_signal = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_signal.notified() => {
                        // Unsubscribe failures are non-fatal; dropping the
                        // listener below releases the session regardless.
                        if let Err(err) = listener.unlisten(&channel).await {
                            debug!(error = %err, "unlisten failed during shutdown");
                        }
                        break;
                    }
                    notification = listener.recv() => match notification {
                        Ok(notification) => {
                            if notification.channel() != channel {
                                continue;
                            }
                            debug!(payload = %notification.payload(), "queue notification");
                            if wakeups.try_send(notification.payload().to_string()).is_err() {
                                // Buffer full or loop stopped; wake-ups are
                                // only hints, so dropping one is safe.
                                debug!("dropped wake-up");
                            }
                        }
                        Err(err) => {
                            // PgListener re-establishes the session on the
                            // next recv; back off briefly to avoid spinning
                            // while the database is unreachable.
                            warn!(error = %err, "notification stream error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            debug!("notification listener stopped");
        });

        Ok(Self { shutdown, handle })
    }

    /// Unsubscribe and release the session.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
