//! Core domain models, events and storage for the integration subsystem.
//!
//! Provides strongly-typed identifiers, integration configs, sync logs,
//! webhook events, the sync event bus and the persistence abstraction. The
//! sync engine and the webhook dispatcher both build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, MulticastEventHandler, NoOpEventHandler, SyncCompletedEvent, SyncEvent,
    SyncFailedEvent, SyncOutcome, SyncStartedEvent,
};
pub use models::{
    BackoffStrategy, Credentials, ErrorSnapshot, IntegrationConfig, IntegrationConfigId,
    IntegrationType, RetryConfig, SyncLog, SyncLogId, SyncLogStatus, SyncStatus, SyncType,
    WebhookEvent, WebhookEventId, WebhookEventStatus,
};
pub use storage::{IntegrationStore, MemoryStore, PostgresStore, SyncCompletion};
pub use time::{Clock, RealClock, TestClock};
