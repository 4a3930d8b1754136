//! Domain events emitted around sync execution.
//!
//! The orchestrator publishes a [`SyncEvent`] at the start and end of every
//! sync. Consumers (the webhook subscriber, audit sinks) implement
//! [`EventHandler`] and are fanned out through [`MulticastEventHandler`].
//!
//! ```text
//! ┌──────────────────┐  integration.sync.*  ┌────────────────────┐
//! │ SyncOrchestrator │ ───────────────────▶ │ MulticastHandler   │
//! └──────────────────┘                      └────────────────────┘
//!                                                     │
//!                                                     ▼
//!                                          ┌─────────────────────┐
//!                                          │ SyncEventSubscriber │
//!                                          │ (queues webhooks)   │
//!                                          └─────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{IntegrationConfigId, SyncLogId, SyncType};

/// Event type name for a sync that has begun.
pub const SYNC_STARTED: &str = "integration.sync.started";
/// Event type name for a sync that finished successfully.
pub const SYNC_COMPLETED: &str = "integration.sync.completed";
/// Event type name for a sync that failed.
pub const SYNC_FAILED: &str = "integration.sync.failed";

/// Events emitted by the sync orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A sync passed its preconditions and the adapter is about to run.
    Started(SyncStartedEvent),
    /// The adapter returned a result.
    Completed(SyncCompletedEvent),
    /// The adapter or breaker failed.
    Failed(SyncFailedEvent),
}

/// Payload of `integration.sync.started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStartedEvent {
    /// Config being synced.
    pub config_id: IntegrationConfigId,
    /// Trigger of the sync.
    pub sync_type: SyncType,
    /// Log opened for this sync.
    pub sync_log_id: SyncLogId,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// Summary of an adapter result carried on completion events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Adapter-reported success flag.
    pub success: bool,
    /// Adapter message.
    pub message: String,
    /// Records touched.
    pub records_processed: u64,
    /// Records handled successfully.
    pub records_succeeded: u64,
    /// Records that failed.
    pub records_failed: u64,
}

/// Payload of `integration.sync.completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompletedEvent {
    /// Config that was synced.
    pub config_id: IntegrationConfigId,
    /// Adapter result summary.
    pub result: SyncOutcome,
    /// Finalized log.
    pub sync_log_id: SyncLogId,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Payload of `integration.sync.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailedEvent {
    /// Config whose sync failed.
    pub config_id: IntegrationConfigId,
    /// Failure message.
    pub error: String,
    /// Finalized log.
    pub sync_log_id: SyncLogId,
    /// Failure time.
    pub failed_at: DateTime<Utc>,
}

impl SyncEvent {
    /// Dotted event name used as the webhook event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started(_) => SYNC_STARTED,
            Self::Completed(_) => SYNC_COMPLETED,
            Self::Failed(_) => SYNC_FAILED,
        }
    }

    /// Config the event concerns.
    pub fn config_id(&self) -> IntegrationConfigId {
        match self {
            Self::Started(e) => e.config_id,
            Self::Completed(e) => e.config_id,
            Self::Failed(e) => e.config_id,
        }
    }

    /// JSON body for external consumers.
    pub fn payload(&self) -> Value {
        let value = match self {
            Self::Started(e) => serde_json::to_value(e),
            Self::Completed(e) => serde_json::to_value(e),
            Self::Failed(e) => serde_json::to_value(e),
        };
        // Plain structs of strings, ids and numbers always serialize.
        value.unwrap_or(Value::Null)
    }
}

/// Trait for reacting to sync events.
///
/// Implementations must not fail the sync that produced the event: errors are
/// logged inside the handler and never propagated.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a sync event.
    async fn handle_event(&self, event: SyncEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: SyncEvent) {}
}

/// Forwards each event to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: SyncEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}
