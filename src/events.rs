//! Engine events, delivered to registered observers.
//!
//! Events are advisory: they report what the engine did, in the order it
//! did it within one task, and carry no delivery guarantee of their own.

use uuid::Uuid;

/// Everything the engine reports to observers.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A message row was inserted.
    Enqueued { id: Uuid, message_type: String },
    /// A message was claimed for processing.
    Dequeued { id: Uuid, message_type: String },
    /// A message reached COMPLETED.
    Ack { id: Uuid },
    /// A message was handed back for retry or dead-lettered.
    Nack { id: Uuid, error: String },
    /// A LISTEN wake-up arrived; the payload is the new row id as text.
    Notification { payload: String },
    /// The stale-reset sweeper returned rows to PENDING.
    StaleReset { count: u64 },
    /// The retry-promotion sweeper returned rows to PENDING.
    RetryReset { count: u64 },
    /// The consumption loop started.
    Started { concurrency: usize },
    /// The consumption loop stopped and drained.
    Stopped,
    /// A contained failure (sweep error, rollback failure, handler
    /// dispatch problem) that did not propagate to a caller.
    Error {
        code: &'static str,
        message: String,
    },
}

/// Observer capability for engine events.
///
/// Observers are invoked synchronously from the task that produced the
/// event and must not block.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

/// Collects events into a vector; meant for tests.
#[derive(Default)]
pub struct EventCollector {
    events: std::sync::Mutex<Vec<QueueEvent>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventObserver for EventCollector {
    fn on_event(&self, event: &QueueEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_records_in_order() {
        let collector = EventCollector::new();
        collector.on_event(&QueueEvent::Started { concurrency: 2 });
        collector.on_event(&QueueEvent::Notification {
            payload: "abc".into(),
        });
        collector.on_event(&QueueEvent::Stopped);

        let events = collector.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], QueueEvent::Started { concurrency: 2 }));
        assert!(matches!(events[2], QueueEvent::Stopped));
    }
}
