//! Store wrapper that fails selected operations on demand.

use std::sync::atomic::{AtomicBool, Ordering};

use carelink_core::{
    storage::StoreFuture, CoreError, ErrorSnapshot, IntegrationConfig, IntegrationConfigId,
    IntegrationStore, MemoryStore, SyncCompletion, SyncLog, SyncStatus, WebhookEvent,
    WebhookEventId,
};
use chrono::{DateTime, Utc};

/// Operations [`FaultyStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// `finish_sync` with [`SyncCompletion::Succeeded`].
    FinishSyncSucceeded,
    /// `finish_sync` with [`SyncCompletion::Failed`].
    FinishSyncFailed,
    /// `update_webhook_event`.
    UpdateWebhookEvent,
}

/// Delegates to a [`MemoryStore`] but returns `Database` errors for armed
/// faults.
///
/// Wrapping a clone of a test environment's store shares its state, so
/// assertions can keep going through the environment.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    finish_succeeded: AtomicBool,
    finish_failed: AtomicBool,
    update_webhook: AtomicBool,
}

impl FaultyStore {
    /// Wraps `inner` with every fault disarmed.
    pub fn new(inner: MemoryStore) -> Self {
        Self { inner, ..Self::default() }
    }

    /// Makes `fault` fail until disarmed.
    pub fn arm(&self, fault: StoreFault) {
        self.flag(fault).store(true, Ordering::SeqCst);
    }

    /// Lets `fault` through again.
    pub fn disarm(&self, fault: StoreFault) {
        self.flag(fault).store(false, Ordering::SeqCst);
    }

    fn flag(&self, fault: StoreFault) -> &AtomicBool {
        match fault {
            StoreFault::FinishSyncSucceeded => &self.finish_succeeded,
            StoreFault::FinishSyncFailed => &self.finish_failed,
            StoreFault::UpdateWebhookEvent => &self.update_webhook,
        }
    }

    fn check(&self, fault: StoreFault) -> carelink_core::Result<()> {
        if self.flag(fault).load(Ordering::SeqCst) {
            return Err(CoreError::Database("connection reset".to_string()));
        }
        Ok(())
    }
}

impl IntegrationStore for FaultyStore {
    fn insert_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        self.inner.insert_config(config)
    }

    fn find_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, Option<IntegrationConfig>> {
        self.inner.find_config(id)
    }

    fn list_configs(&self) -> StoreFuture<'_, Vec<IntegrationConfig>> {
        self.inner.list_configs()
    }

    fn update_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        self.inner.update_config(config)
    }

    fn delete_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, bool> {
        self.inner.delete_config(id)
    }

    fn transition_sync_status(
        &self,
        id: IntegrationConfigId,
        from: &'static [SyncStatus],
        to: SyncStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        self.inner.transition_sync_status(id, from, to, at)
    }

    fn finish_sync(
        &self,
        id: IntegrationConfigId,
        completion: SyncCompletion,
    ) -> StoreFuture<'_, ()> {
        let fault = match completion {
            SyncCompletion::Succeeded { .. } => StoreFault::FinishSyncSucceeded,
            SyncCompletion::Failed { .. } => StoreFault::FinishSyncFailed,
        };
        Box::pin(async move {
            self.check(fault)?;
            self.inner.finish_sync(id, completion).await
        })
    }

    fn recover_interrupted_syncs(
        &self,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, Vec<IntegrationConfigId>> {
        self.inner.recover_interrupted_syncs(error)
    }

    fn insert_sync_log(&self, log: SyncLog) -> StoreFuture<'_, ()> {
        self.inner.insert_sync_log(log)
    }

    fn finalize_sync_log(&self, log: SyncLog) -> StoreFuture<'_, bool> {
        self.inner.finalize_sync_log(log)
    }

    fn list_sync_logs(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SyncLog>> {
        self.inner.list_sync_logs(config_id, limit)
    }

    fn recent_sync_logs(&self, limit: usize) -> StoreFuture<'_, Vec<SyncLog>> {
        self.inner.recent_sync_logs(limit)
    }

    fn insert_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        self.inner.insert_webhook_event(event)
    }

    fn find_webhook_event(&self, id: WebhookEventId) -> StoreFuture<'_, Option<WebhookEvent>> {
        self.inner.find_webhook_event(id)
    }

    fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WebhookEvent>> {
        self.inner.claim_webhook_event(id, at)
    }

    fn update_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check(StoreFault::UpdateWebhookEvent)?;
            self.inner.update_webhook_event(event).await
        })
    }

    fn list_webhook_events(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WebhookEvent>> {
        self.inner.list_webhook_events(config_id, limit)
    }

    fn reclaim_stale_webhook_events(
        &self,
        stale_before: DateTime<Utc>,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, u64> {
        self.inner.reclaim_stale_webhook_events(stale_before, error)
    }

    fn due_webhook_events(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WebhookEvent>> {
        self.inner.due_webhook_events(now)
    }
}
