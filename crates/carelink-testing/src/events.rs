//! Event handler that records everything it sees.

use std::time::Duration;

use carelink_core::{EventHandler, SyncEvent};
use tokio::sync::{Mutex, Notify};

/// Default bound for [`RecordingEventHandler::wait_for`].
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Stores every sync event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<SyncEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub async fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().await.clone()
    }

    /// Dotted names of recorded events.
    pub async fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(SyncEvent::event_type).collect()
    }

    /// Waits until at least `count` events arrived.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`] so a broken test cannot hang.
    pub async fn wait_for(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.events.lock().await.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(result.is_ok(), "expected {count} sync events within {DEFAULT_EVENT_TIMEOUT:?}");
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: SyncEvent) {
        self.events.lock().await.push(event);
        self.notify.notify_waiters();
    }
}
