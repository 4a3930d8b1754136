//! In-memory implementation of [`IntegrationStore`].
//!
//! All state sits behind one `RwLock`, so compare-and-set transitions and
//! cascading deletes are atomic with respect to each other. Logs and events
//! are kept in insertion order, which breaks ties between equal timestamps.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{IntegrationStore, StoreFuture, SyncCompletion};
use crate::{
    error::CoreError,
    models::{
        ErrorSnapshot, IntegrationConfig, IntegrationConfigId, SyncLog, SyncStatus, WebhookEvent,
        WebhookEventId, WebhookEventStatus,
    },
};

#[derive(Debug, Default)]
struct State {
    configs: HashMap<IntegrationConfigId, IntegrationConfig>,
    sync_logs: Vec<SyncLog>,
    webhook_events: Vec<WebhookEvent>,
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sync logs across all configs.
    pub async fn sync_log_count(&self) -> usize {
        self.state.read().await.sync_logs.len()
    }

    /// Number of webhook events across all configs.
    pub async fn webhook_event_count(&self) -> usize {
        self.state.read().await.webhook_events.len()
    }
}

fn newest_first<T: Clone>(
    items: &[T],
    keep: impl Fn(&T) -> bool,
    key: impl Fn(&T) -> DateTime<Utc>,
    limit: usize,
) -> Vec<T> {
    let mut selected: Vec<T> = items.iter().rev().filter(|item| keep(item)).cloned().collect();
    // Stable sort keeps reverse insertion order among equal timestamps.
    selected.sort_by(|a, b| key(b).cmp(&key(a)));
    selected.truncate(limit);
    selected
}

impl IntegrationStore for MemoryStore {
    fn insert_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.configs.contains_key(&config.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "integration config {} already exists",
                    config.id
                )));
            }
            state.configs.insert(config.id, config);
            Ok(())
        })
    }

    fn find_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, Option<IntegrationConfig>> {
        Box::pin(async move { Ok(self.state.read().await.configs.get(&id).cloned()) })
    }

    fn list_configs(&self) -> StoreFuture<'_, Vec<IntegrationConfig>> {
        Box::pin(async move {
            let mut configs: Vec<IntegrationConfig> =
                self.state.read().await.configs.values().cloned().collect();
            configs.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
            Ok(configs)
        })
    }

    fn update_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .configs
                .get_mut(&config.id)
                .ok_or_else(|| CoreError::not_found("IntegrationConfig", config.id))?;

            let IntegrationConfig {
                name,
                integration_type,
                endpoint,
                credentials,
                metadata,
                is_active,
                sync_frequency,
                webhook_url,
                retry_config,
                updated_at,
                ..
            } = config;

            stored.name = name;
            stored.integration_type = integration_type;
            stored.endpoint = endpoint;
            stored.credentials = credentials;
            stored.metadata = metadata;
            stored.is_active = is_active;
            stored.sync_frequency = sync_frequency;
            stored.webhook_url = webhook_url;
            stored.retry_config = retry_config;
            stored.updated_at = updated_at;
            Ok(())
        })
    }

    fn delete_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.configs.remove(&id).is_none() {
                return Ok(false);
            }
            state.sync_logs.retain(|log| log.integration_config_id != id);
            state.webhook_events.retain(|event| event.integration_config_id != id);
            Ok(true)
        })
    }

    fn transition_sync_status(
        &self,
        id: IntegrationConfigId,
        from: &'static [SyncStatus],
        to: SyncStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let config = state
                .configs
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found("IntegrationConfig", id))?;

            if !from.contains(&config.sync_status) {
                return Ok(false);
            }
            config.sync_status = to;
            config.updated_at = at;
            Ok(true)
        })
    }

    fn finish_sync(
        &self,
        id: IntegrationConfigId,
        completion: SyncCompletion,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let config = state
                .configs
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found("IntegrationConfig", id))?;

            match completion {
                SyncCompletion::Succeeded { at } => {
                    config.sync_status = SyncStatus::Idle;
                    config.last_sync_at = Some(at);
                    config.last_error = None;
                    config.updated_at = at;
                },
                SyncCompletion::Failed { error } => {
                    config.sync_status = SyncStatus::Error;
                    config.updated_at = error.timestamp;
                    config.last_error = Some(error);
                },
            }
            Ok(())
        })
    }

    fn recover_interrupted_syncs(
        &self,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, Vec<IntegrationConfigId>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut recovered = Vec::new();
            for config in state.configs.values_mut() {
                if config.sync_status == SyncStatus::Syncing {
                    config.sync_status = SyncStatus::Error;
                    config.last_error = Some(error.clone());
                    config.updated_at = error.timestamp;
                    recovered.push(config.id);
                }
            }
            for log in &mut state.sync_logs {
                if !log.is_finalized() && recovered.contains(&log.integration_config_id) {
                    log.fail(error.message.clone(), error.timestamp);
                }
            }
            Ok(recovered)
        })
    }

    fn insert_sync_log(&self, log: SyncLog) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if !state.configs.contains_key(&log.integration_config_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "sync log references missing config {}",
                    log.integration_config_id
                )));
            }
            state.sync_logs.push(log);
            Ok(())
        })
    }

    fn finalize_sync_log(&self, log: SyncLog) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.sync_logs.iter_mut().find(|stored| stored.id == log.id) {
                Some(stored) if !stored.is_finalized() => {
                    *stored = log;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn list_sync_logs(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SyncLog>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(newest_first(
                &state.sync_logs,
                |log| log.integration_config_id == config_id,
                |log| log.started_at,
                limit,
            ))
        })
    }

    fn recent_sync_logs(&self, limit: usize) -> StoreFuture<'_, Vec<SyncLog>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(newest_first(&state.sync_logs, |_| true, |log| log.started_at, limit))
        })
    }

    fn insert_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if !state.configs.contains_key(&event.integration_config_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "webhook event references missing config {}",
                    event.integration_config_id
                )));
            }
            state.webhook_events.push(event);
            Ok(())
        })
    }

    fn find_webhook_event(&self, id: WebhookEventId) -> StoreFuture<'_, Option<WebhookEvent>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.webhook_events.iter().find(|event| event.id == id).cloned())
        })
    }

    fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WebhookEvent>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(event) = state.webhook_events.iter_mut().find(|event| event.id == id) else {
                return Ok(None);
            };
            if event.status != WebhookEventStatus::Pending || !event.has_attempts_remaining() {
                return Ok(None);
            }
            event.status = WebhookEventStatus::Processing;
            event.attempts += 1;
            event.updated_at = at;
            Ok(Some(event.clone()))
        })
    }

    fn update_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .webhook_events
                .iter_mut()
                .find(|stored| stored.id == event.id)
                .ok_or_else(|| CoreError::not_found("WebhookEvent", event.id))?;
            *stored = event;
            Ok(())
        })
    }

    fn list_webhook_events(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(newest_first(
                &state.webhook_events,
                |event| event.integration_config_id == config_id,
                |event| event.created_at,
                limit,
            ))
        })
    }

    fn reclaim_stale_webhook_events(
        &self,
        stale_before: DateTime<Utc>,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut reclaimed = 0;
            for event in &mut state.webhook_events {
                if event.status == WebhookEventStatus::Processing && event.updated_at <= stale_before {
                    event.status = WebhookEventStatus::Pending;
                    event.next_retry_at = Some(error.timestamp);
                    event.updated_at = error.timestamp;
                    event.error = Some(error.clone());
                    reclaimed += 1;
                }
            }
            Ok(reclaimed)
        })
    }

    fn due_webhook_events(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut due: Vec<WebhookEvent> = state
                .webhook_events
                .iter()
                .filter(|event| {
                    event.status == WebhookEventStatus::Pending
                        && event.next_retry_at.is_some_and(|at| at <= now)
                })
                .cloned()
                .collect();
            due.sort_by_key(|event| event.next_retry_at);
            Ok(due)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::models::{IntegrationType, SyncType};

    fn config(name: &str) -> IntegrationConfig {
        IntegrationConfig::new(name, IntegrationType::Fhir, "https://fhir.example", Utc::now())
    }

    #[tokio::test]
    async fn lists_configs_by_name() {
        let store = MemoryStore::new();
        store.insert_config(config("zeta")).await.unwrap();
        store.insert_config(config("alpha")).await.unwrap();

        let names: Vec<String> =
            store.list_configs().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn sync_status_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();

        let from = &[SyncStatus::Idle, SyncStatus::Error];
        assert!(store.transition_sync_status(id, from, SyncStatus::Syncing, Utc::now()).await.unwrap());
        assert!(!store.transition_sync_status(id, from, SyncStatus::Syncing, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn update_config_preserves_sync_state() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg.clone()).await.unwrap();
        store
            .transition_sync_status(id, &[SyncStatus::Idle], SyncStatus::Syncing, Utc::now())
            .await
            .unwrap();

        let mut edited = cfg;
        edited.name = "renamed".into();
        store.update_config(edited).await.unwrap();

        let stored = store.find_config(id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.sync_status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn finalized_logs_are_not_rewritten() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();

        let mut log = SyncLog::start(id, SyncType::Full, Utc::now());
        store.insert_sync_log(log.clone()).await.unwrap();
        log.complete(3, 3, 0, Utc::now());
        assert!(store.finalize_sync_log(log.clone()).await.unwrap());

        log.fail("late overwrite", Utc::now());
        assert!(!store.finalize_sync_log(log).await.unwrap());
        let stored = store.list_sync_logs(id, 10).await.unwrap();
        assert!(stored[0].error.is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_logs_and_events() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();
        store.insert_sync_log(SyncLog::start(id, SyncType::Full, Utc::now())).await.unwrap();
        store
            .insert_webhook_event(WebhookEvent::new(id, "t", json!({}), 3, Utc::now()))
            .await
            .unwrap();

        assert!(store.delete_config(id).await.unwrap());
        assert_eq!(store.sync_log_count().await, 0);
        assert_eq!(store.webhook_event_count().await, 0);
        assert!(!store.delete_config(id).await.unwrap());
    }

    #[tokio::test]
    async fn claim_only_takes_pending_events_with_budget() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();
        let event = WebhookEvent::new(id, "t", json!({}), 1, Utc::now());
        let event_id = event.id;
        store.insert_webhook_event(event).await.unwrap();

        let claimed = store.claim_webhook_event(event_id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, WebhookEventStatus::Processing);
        assert!(store.claim_webhook_event(event_id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_events_require_elapsed_retry_time() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();
        let now = Utc::now();

        let mut past = WebhookEvent::new(id, "t", json!({}), 3, now);
        past.next_retry_at = Some(now - Duration::seconds(1));
        let mut future = WebhookEvent::new(id, "t", json!({}), 3, now);
        future.next_retry_at = Some(now + Duration::seconds(60));
        let fresh = WebhookEvent::new(id, "t", json!({}), 3, now);
        let past_id = past.id;

        for event in [past, future, fresh] {
            store.insert_webhook_event(event).await.unwrap();
        }

        let due = store.due_webhook_events(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past_id);
    }

    #[tokio::test]
    async fn interrupted_syncs_recover_to_error() {
        let store = MemoryStore::new();
        let (busy, idle) = (config("busy"), config("idle"));
        let (busy_id, idle_id) = (busy.id, idle.id);
        store.insert_config(busy).await.unwrap();
        store.insert_config(idle).await.unwrap();
        store
            .transition_sync_status(busy_id, &[SyncStatus::Idle], SyncStatus::Syncing, Utc::now())
            .await
            .unwrap();
        store.insert_sync_log(SyncLog::start(busy_id, SyncType::Full, Utc::now())).await.unwrap();

        let snapshot = ErrorSnapshot::new("sync interrupted by restart", Utc::now());
        let recovered = store.recover_interrupted_syncs(snapshot).await.unwrap();
        assert_eq!(recovered, vec![busy_id]);

        let busy = store.find_config(busy_id).await.unwrap().unwrap();
        assert_eq!(busy.sync_status, SyncStatus::Error);
        assert_eq!(busy.last_error.unwrap().message, "sync interrupted by restart");
        assert_eq!(store.find_config(idle_id).await.unwrap().unwrap().sync_status, SyncStatus::Idle);

        let logs = store.list_sync_logs(busy_id, 10).await.unwrap();
        assert!(logs[0].is_finalized());
        assert_eq!(logs[0].status, crate::models::SyncLogStatus::Failed);
    }

    #[tokio::test]
    async fn only_stale_processing_events_are_reclaimed() {
        let store = MemoryStore::new();
        let cfg = config("a");
        let id = cfg.id;
        store.insert_config(cfg).await.unwrap();
        let now = Utc::now();

        let stale = WebhookEvent::new(id, "t", json!({}), 3, now - Duration::hours(1));
        let fresh = WebhookEvent::new(id, "t", json!({}), 3, now);
        let (stale_id, fresh_id) = (stale.id, fresh.id);
        store.insert_webhook_event(stale).await.unwrap();
        store.insert_webhook_event(fresh).await.unwrap();
        store.claim_webhook_event(stale_id, now - Duration::hours(1)).await.unwrap().unwrap();
        store.claim_webhook_event(fresh_id, now).await.unwrap().unwrap();

        let snapshot = ErrorSnapshot::new("delivery interrupted", now);
        let reclaimed = store
            .reclaim_stale_webhook_events(now - Duration::minutes(10), snapshot)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let stale = store.find_webhook_event(stale_id).await.unwrap().unwrap();
        assert_eq!(stale.status, WebhookEventStatus::Pending);
        assert_eq!(stale.attempts, 1);
        assert_eq!(stale.next_retry_at, Some(now));
        let fresh = store.find_webhook_event(fresh_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, WebhookEventStatus::Processing);
    }
}
