//! Storage abstraction for integration configs, sync logs and webhook events.
//!
//! The orchestrator and dispatcher only talk to [`IntegrationStore`]. Two
//! implementations ship: [`memory::MemoryStore`] for tests and single-process
//! deployments, and [`postgres::PostgresStore`] for production.
//!
//! Writers are split by field ownership. Administrative updates go through
//! [`IntegrationStore::update_config`], which never touches sync-state fields;
//! the orchestrator moves sync state with compare-and-set transitions and
//! [`IntegrationStore::finish_sync`]. This is what keeps "one sync per config"
//! true without an in-process lock.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{
        ErrorSnapshot, IntegrationConfig, IntegrationConfigId, SyncLog, SyncStatus, WebhookEvent,
        WebhookEventId,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How a sync ended, as recorded on the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCompletion {
    /// Sets `idle`, stamps `last_sync_at` and clears `last_error`.
    Succeeded {
        /// Completion time.
        at: DateTime<Utc>,
    },
    /// Sets `error` and records the failure snapshot.
    Failed {
        /// Failure description and time.
        error: ErrorSnapshot,
    },
}

/// Persistence operations required by the integration subsystem.
pub trait IntegrationStore: Send + Sync + std::fmt::Debug + 'static {
    /// Inserts a new config.
    ///
    /// Fails with `ConstraintViolation` if the id already exists.
    fn insert_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()>;

    /// Loads a config by id.
    fn find_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, Option<IntegrationConfig>>;

    /// Lists all configs ordered by name.
    fn list_configs(&self) -> StoreFuture<'_, Vec<IntegrationConfig>>;

    /// Writes administrative fields of an existing config.
    ///
    /// Sync-state fields (`sync_status`, `last_sync_at`, `last_error`) are
    /// left untouched. Fails with `NotFound` if the config is missing.
    fn update_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()>;

    /// Deletes a config with its sync logs and webhook events.
    ///
    /// Returns `false` if nothing was deleted.
    fn delete_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, bool>;

    /// Atomically moves `sync_status` to `to` if it is currently one of
    /// `from`.
    ///
    /// Returns `false` when the config exists but is in another state, and
    /// `NotFound` when it does not exist.
    fn transition_sync_status(
        &self,
        id: IntegrationConfigId,
        from: &'static [SyncStatus],
        to: SyncStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Records the end of a sync on the config.
    fn finish_sync(
        &self,
        id: IntegrationConfigId,
        completion: SyncCompletion,
    ) -> StoreFuture<'_, ()>;

    /// Moves every `syncing` config to `error` with `error` as its last
    /// failure, and fails their unfinished sync logs.
    ///
    /// Meant for startup, before any sync can be running. Returns the ids of
    /// the recovered configs.
    fn recover_interrupted_syncs(
        &self,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, Vec<IntegrationConfigId>>;

    /// Inserts a freshly started sync log.
    fn insert_sync_log(&self, log: SyncLog) -> StoreFuture<'_, ()>;

    /// Writes the final state of a sync log.
    ///
    /// Only logs that are not yet finalized are updated; returns `false` if
    /// the stored log was already complete or missing.
    fn finalize_sync_log(&self, log: SyncLog) -> StoreFuture<'_, bool>;

    /// Lists a config's sync logs, newest first.
    fn list_sync_logs(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SyncLog>>;

    /// Lists the most recent sync logs across all configs, newest first.
    fn recent_sync_logs(&self, limit: usize) -> StoreFuture<'_, Vec<SyncLog>>;

    /// Inserts a new webhook event.
    fn insert_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()>;

    /// Loads a webhook event by id.
    fn find_webhook_event(&self, id: WebhookEventId) -> StoreFuture<'_, Option<WebhookEvent>>;

    /// Claims a pending event for delivery.
    ///
    /// Atomically moves a `pending` event with attempts remaining to
    /// `processing` and increments `attempts`. Returns the claimed event, or
    /// `None` if the event is in any other state.
    fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WebhookEvent>>;

    /// Writes the full state of a webhook event.
    fn update_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()>;

    /// Lists a config's webhook events, newest first.
    fn list_webhook_events(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WebhookEvent>>;

    /// Returns `processing` events last touched at or before `stale_before`
    /// to `pending`, due at `error.timestamp`, with `error` recorded.
    ///
    /// Returns the number of events reclaimed.
    fn reclaim_stale_webhook_events(
        &self,
        stale_before: DateTime<Utc>,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, u64>;

    /// Lists pending events whose `next_retry_at` is at or before `now`.
    fn due_webhook_events(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WebhookEvent>>;
}
