//! Sync orchestration: config lifecycle and adapter execution.
//!
//! The orchestrator is the only writer of sync-state fields. A sync runs
//! through these steps:
//!
//! ```text
//! load config ─▶ active / not paused / not syncing?
//!      │
//!      ▼
//! claim (idle|error ─▶ syncing, compare-and-set in the store)
//!      │
//!      ▼
//! open SyncLog ─▶ emit started ─▶ retry( breaker( timeout( adapter.sync ) ) )
//!      │
//!      ├── Ok  ─▶ idle + lastSyncAt, finalize log, emit completed
//!      └── Err ─▶ finalize log, error + lastError, emit failed, SyncFailed
//! ```
//!
//! Every config gets its own adapter instance and breaker. They are created
//! on first use and rebuilt when the config's type, endpoint or credentials
//! change, so tokens and breaker state never leak between configs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use carelink_core::{
    events::{SyncCompletedEvent, SyncFailedEvent, SyncOutcome, SyncStartedEvent},
    models::metadata_keys,
    Clock, Credentials, ErrorSnapshot, EventHandler, IntegrationConfig, IntegrationConfigId,
    IntegrationStore, IntegrationType, RetryConfig, SyncCompletion, SyncEvent, SyncLog,
    SyncLogStatus, SyncStatus, SyncType,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

use crate::{
    adapters::{AdapterRegistry, IntegrationAdapter, SyncResult},
    circuit::{CircuitBreaker, CircuitConfig, CircuitState},
    error::{IntegrationError, Result},
    retry::RetryPolicy,
    schedule::SyncFrequency,
};

/// Default number of sync logs returned by [`SyncOrchestrator::sync_logs`].
pub const DEFAULT_SYNC_LOG_LIMIT: usize = 50;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Breaker settings for every per-config breaker.
    pub circuit: CircuitConfig,
    /// Hard bound on each adapter call.
    pub adapter_timeout: Duration,
    /// Number of recent sync logs rolled up by health metrics.
    pub health_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig::default(),
            adapter_timeout: Duration::from_secs(30),
            health_window: 100,
        }
    }
}

/// Fields accepted when creating a config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntegrationConfig {
    /// Operator-facing name.
    pub name: String,
    /// External system family.
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    /// Base URL or MLLP address.
    pub endpoint: String,
    /// Credential bag.
    #[serde(default)]
    pub credentials: Credentials,
    /// Per-type options.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Defaults to active.
    #[serde(default)]
    pub is_active: Option<bool>,
    /// Schedule string.
    #[serde(default)]
    pub sync_frequency: Option<String>,
    /// Notification destination.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Outbound retry settings.
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
}

/// Partial update of administrative fields. Metadata is merged key-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIntegrationConfig {
    /// New name.
    pub name: Option<String>,
    /// New type.
    #[serde(rename = "type")]
    pub integration_type: Option<IntegrationType>,
    /// New endpoint.
    pub endpoint: Option<String>,
    /// Replacement credential bag.
    pub credentials: Option<Credentials>,
    /// Keys to merge into metadata.
    pub metadata: Option<Map<String, Value>>,
    /// Activate or deactivate.
    pub is_active: Option<bool>,
    /// New schedule string.
    pub sync_frequency: Option<String>,
    /// New webhook destination.
    pub webhook_url: Option<String>,
    /// New retry settings.
    pub retry_config: Option<RetryConfig>,
}

/// Outcome of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    /// Whether the probe succeeded.
    pub success: bool,
    /// Operator-facing message.
    pub message: String,
}

/// Read-only view of a config's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
    /// Config id.
    pub config_id: IntegrationConfigId,
    /// Lifecycle state.
    pub sync_status: SyncStatus,
    /// Last successful sync.
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Last failure.
    pub last_error: Option<ErrorSnapshot>,
    /// Active flag.
    pub is_active: bool,
    /// State of the config's breaker.
    pub circuit_state: CircuitState,
}

/// Rollup of config states and recent sync outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// All configs.
    pub total_integrations: usize,
    /// Active configs.
    pub active_integrations: usize,
    /// Configs currently syncing.
    pub syncing_integrations: usize,
    /// Configs whose last sync failed.
    pub error_integrations: usize,
    /// Sync logs in the window.
    pub recent_syncs: usize,
    /// Fraction of windowed syncs that succeeded (including partial).
    pub success_rate: f64,
    /// Fraction of windowed syncs that failed.
    pub failure_rate: f64,
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    /// Active idle configs looked at.
    pub considered: usize,
    /// Configs that were due and synced.
    pub triggered: usize,
    /// Triggered syncs that succeeded.
    pub succeeded: usize,
    /// Triggered syncs that failed.
    pub failed: usize,
}

struct AdapterSlot {
    integration_type: IntegrationType,
    endpoint: String,
    credentials: Credentials,
    adapter: Arc<dyn IntegrationAdapter>,
    breaker: Arc<CircuitBreaker>,
}

impl AdapterSlot {
    fn matches(&self, config: &IntegrationConfig) -> bool {
        self.integration_type == config.integration_type
            && self.endpoint == config.endpoint
            && self.credentials == config.credentials
    }
}

/// Owns config lifecycle and runs syncs.
pub struct SyncOrchestrator {
    store: Arc<dyn IntegrationStore>,
    registry: AdapterRegistry,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    slots: RwLock<HashMap<IntegrationConfigId, AdapterSlot>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        registry: AdapterRegistry,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, registry, events, clock, config, slots: RwLock::new(HashMap::new()) }
    }

    /// Store shared with the orchestrator.
    pub fn store(&self) -> &Arc<dyn IntegrationStore> {
        &self.store
    }

    /// Creates a config in the idle state.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a blank name, an unsupported type or an
    /// unparseable webhook URL.
    pub async fn create(&self, request: CreateIntegrationConfig) -> Result<IntegrationConfig> {
        if request.name.trim().is_empty() {
            return Err(IntegrationError::configuration("integration name must not be empty"));
        }
        if !self.registry.supports(request.integration_type) {
            return Err(IntegrationError::configuration(format!(
                "unsupported integration type {}",
                request.integration_type
            )));
        }
        if let Some(url) = &request.webhook_url {
            parse_webhook_url(url)?;
        }
        warn_unschedulable(request.sync_frequency.as_deref());

        let mut config = IntegrationConfig::new(
            request.name,
            request.integration_type,
            request.endpoint,
            self.clock.now_utc(),
        );
        config.credentials = request.credentials;
        config.metadata = request.metadata;
        config.is_active = request.is_active.unwrap_or(true);
        config.sync_frequency = request.sync_frequency;
        config.webhook_url = request.webhook_url;
        config.retry_config = request.retry_config;

        self.store.insert_config(config.clone()).await?;
        info!(config_id = %config.id, integration_type = %config.integration_type, "integration created");
        Ok(config)
    }

    /// Lists configs ordered by name.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on persistence failure.
    pub async fn list(&self) -> Result<Vec<IntegrationConfig>> {
        Ok(self.store.list_configs().await?)
    }

    /// Loads one config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the config does not exist.
    pub async fn get(&self, id: IntegrationConfigId) -> Result<IntegrationConfig> {
        self.store
            .find_config(id)
            .await?
            .ok_or_else(|| IntegrationError::not_found("IntegrationConfig", id))
    }

    /// Applies a partial update to administrative fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config and `Configuration` for
    /// invalid values.
    pub async fn update(
        &self,
        id: IntegrationConfigId,
        changes: UpdateIntegrationConfig,
    ) -> Result<IntegrationConfig> {
        let mut config = self.get(id).await?;

        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(IntegrationError::configuration("integration name must not be empty"));
            }
            config.name = name;
        }
        if let Some(integration_type) = changes.integration_type {
            if !self.registry.supports(integration_type) {
                return Err(IntegrationError::configuration(format!(
                    "unsupported integration type {integration_type}"
                )));
            }
            config.integration_type = integration_type;
        }
        if let Some(endpoint) = changes.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(credentials) = changes.credentials {
            config.credentials = credentials;
        }
        if let Some(metadata) = changes.metadata {
            config.metadata.extend(metadata);
        }
        if let Some(is_active) = changes.is_active {
            config.is_active = is_active;
        }
        if let Some(frequency) = changes.sync_frequency {
            warn_unschedulable(Some(&frequency));
            config.sync_frequency = Some(frequency);
        }
        if let Some(url) = changes.webhook_url {
            parse_webhook_url(&url)?;
            config.webhook_url = Some(url);
        }
        if let Some(retry_config) = changes.retry_config {
            config.retry_config = Some(retry_config);
        }
        config.updated_at = self.clock.now_utc();

        self.store.update_config(config.clone()).await?;
        debug!(config_id = %id, "integration updated");
        Ok(config)
    }

    /// Deletes a config with its logs and events, and drops its adapter and
    /// breaker.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing was deleted.
    pub async fn delete(&self, id: IntegrationConfigId) -> Result<()> {
        if !self.store.delete_config(id).await? {
            return Err(IntegrationError::not_found("IntegrationConfig", id));
        }
        self.slots.write().await.remove(&id);
        info!(config_id = %id, "integration deleted");
        Ok(())
    }

    /// Moves an idle or failed config to `paused`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while syncing or already paused, `NotFound`
    /// for an unknown config.
    pub async fn pause(&self, id: IntegrationConfigId) -> Result<()> {
        let moved = self
            .store
            .transition_sync_status(
                id,
                &[SyncStatus::Idle, SyncStatus::Error],
                SyncStatus::Paused,
                self.clock.now_utc(),
            )
            .await?;
        if !moved {
            let config = self.get(id).await?;
            return Err(IntegrationError::invalid_state(format!(
                "cannot pause integration {id} while {}",
                config.sync_status
            )));
        }
        info!(config_id = %id, "integration paused");
        Ok(())
    }

    /// Moves a paused config back to `idle`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless paused, `NotFound` for an unknown
    /// config.
    pub async fn resume(&self, id: IntegrationConfigId) -> Result<()> {
        let moved = self
            .store
            .transition_sync_status(id, &[SyncStatus::Paused], SyncStatus::Idle, self.clock.now_utc())
            .await?;
        if !moved {
            let config = self.get(id).await?;
            return Err(IntegrationError::invalid_state(format!(
                "cannot resume integration {id} while {}",
                config.sync_status
            )));
        }
        info!(config_id = %id, "integration resumed");
        Ok(())
    }

    /// Sets the webhook URL and, when given, the signing secret.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the URL does not parse, `NotFound` for
    /// an unknown config.
    pub async fn configure_webhook(
        &self,
        id: IntegrationConfigId,
        url: &str,
        secret: Option<String>,
    ) -> Result<IntegrationConfig> {
        parse_webhook_url(url)?;
        let mut config = self.get(id).await?;
        config.webhook_url = Some(url.to_string());
        if let Some(secret) = secret {
            config.metadata.insert(metadata_keys::WEBHOOK_SECRET.to_string(), Value::String(secret));
        }
        config.updated_at = self.clock.now_utc();
        self.store.update_config(config.clone()).await?;
        info!(config_id = %id, "webhook configured");
        Ok(config)
    }

    /// Validates the config and runs the adapter's probe within the adapter
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config; adapter problems become an
    /// unsuccessful result.
    pub async fn test_connection(&self, id: IntegrationConfigId) -> Result<ConnectionTestResult> {
        let config = self.get(id).await?;
        let success = match self.slot_for(&config).await {
            Ok((adapter, _)) => match adapter.validate_config(&config) {
                Ok(()) => tokio::time::timeout(
                    self.config.adapter_timeout,
                    adapter.test_connection(&config),
                )
                .await
                .unwrap_or(false),
                Err(e) => {
                    warn!(config_id = %id, error = %e, "connection test rejected config");
                    false
                },
            },
            Err(e) => {
                warn!(config_id = %id, error = %e, "no adapter for connection test");
                false
            },
        };

        let message =
            if success { "Connection test successful" } else { "Connection test failed" };
        info!(config_id = %id, success, "connection test finished");
        Ok(ConnectionTestResult { success, message: message.to_string() })
    }

    /// Current state of the config's breaker; `closed` before first use.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn circuit_state(&self, id: IntegrationConfigId) -> Result<CircuitState> {
        self.get(id).await?;
        Ok(self.breaker_state(id).await)
    }

    /// Forces the config's breaker closed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn reset_circuit(&self, id: IntegrationConfigId) -> Result<()> {
        self.get(id).await?;
        let breaker = self.slots.read().await.get(&id).map(|slot| slot.breaker.clone());
        if let Some(breaker) = breaker {
            breaker.reset().await;
        }
        Ok(())
    }

    /// Sync-state projection of one config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn sync_status(&self, id: IntegrationConfigId) -> Result<SyncStatusView> {
        let config = self.get(id).await?;
        Ok(SyncStatusView {
            config_id: config.id,
            sync_status: config.sync_status,
            last_sync_at: config.last_sync_at,
            last_error: config.last_error,
            is_active: config.is_active,
            circuit_state: self.breaker_state(id).await,
        })
    }

    /// Newest-first sync logs of one config, [`DEFAULT_SYNC_LOG_LIMIT`] by
    /// default.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn sync_logs(
        &self,
        id: IntegrationConfigId,
        limit: Option<usize>,
    ) -> Result<Vec<SyncLog>> {
        self.get(id).await?;
        Ok(self.store.list_sync_logs(id, limit.unwrap_or(DEFAULT_SYNC_LOG_LIMIT)).await?)
    }

    /// Rolls up config states and the outcome of recent syncs.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on persistence failure.
    pub async fn health_metrics(&self) -> Result<HealthMetrics> {
        let configs = self.store.list_configs().await?;
        let logs = self.store.recent_sync_logs(self.config.health_window).await?;

        let count = |status: SyncStatus| configs.iter().filter(|c| c.sync_status == status).count();
        let failed = logs.iter().filter(|l| l.status == SyncLogStatus::Failed).count();
        let succeeded = logs.len() - failed;
        let rate = |n: usize| if logs.is_empty() { 0.0 } else { n as f64 / logs.len() as f64 };

        Ok(HealthMetrics {
            total_integrations: configs.len(),
            active_integrations: configs.iter().filter(|c| c.is_active).count(),
            syncing_integrations: count(SyncStatus::Syncing),
            error_integrations: count(SyncStatus::Error),
            recent_syncs: logs.len(),
            success_rate: rate(succeeded),
            failure_rate: rate(failed),
        })
    }

    /// Re-runs a failed config as a manual sync.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the config is in `error`, otherwise
    /// whatever [`SyncOrchestrator::sync`] returns.
    pub async fn retry_failed_sync(&self, id: IntegrationConfigId) -> Result<SyncResult> {
        let config = self.get(id).await?;
        if config.sync_status != SyncStatus::Error {
            return Err(IntegrationError::invalid_state(format!(
                "integration {id} is {}, only failed integrations can be retried",
                config.sync_status
            )));
        }
        self.sync(id, SyncType::Manual).await
    }

    /// Moves configs left `syncing` by a previous process to `error`.
    ///
    /// Run once at startup, before the scheduler. Recovered configs can be
    /// synced again or retried with [`SyncOrchestrator::retry_failed_sync`].
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store cannot be updated.
    pub async fn recover_interrupted_syncs(&self) -> Result<Vec<IntegrationConfigId>> {
        let error = ErrorSnapshot::new("sync interrupted before completion", self.clock.now_utc());
        let recovered = self.store.recover_interrupted_syncs(error).await?;
        for id in &recovered {
            warn!(config_id = %id, "recovered interrupted sync");
        }
        Ok(recovered)
    }

    /// Syncs every active idle config whose schedule is due.
    ///
    /// Due configs run concurrently. Failures are logged and counted, never
    /// returned.
    pub async fn scheduled_sync(&self) -> ScheduleSummary {
        let configs = match self.store.list_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "failed to list integrations for scheduling");
                return ScheduleSummary::default();
            },
        };

        let now = self.clock.now_utc();
        let mut summary = ScheduleSummary::default();
        let mut due = Vec::new();
        for config in configs.iter().filter(|c| c.is_active && c.sync_status == SyncStatus::Idle) {
            summary.considered += 1;
            let Some(raw) = config.sync_frequency.as_deref() else {
                continue;
            };
            match SyncFrequency::parse(raw) {
                Some(frequency) if frequency.is_due(config.last_sync_at, now) => due.push(config.id),
                Some(_) => {},
                None => debug!(config_id = %config.id, frequency = raw, "unschedulable sync frequency"),
            }
        }

        summary.triggered = due.len();
        let results = join_all(due.iter().map(|id| self.sync(*id, SyncType::Full))).await;
        for (id, result) in due.iter().zip(results) {
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(config_id = %id, error = %e, "scheduled sync failed");
                },
            }
        }

        if summary.triggered > 0 {
            info!(
                considered = summary.considered,
                triggered = summary.triggered,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "scheduled sync pass finished"
            );
        }
        summary
    }

    /// Runs one sync of the config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Inactive`, `Paused` or `AlreadySyncing` before
    /// anything is recorded; once the sync has started, any failure is
    /// recorded on the config and log and returned as `SyncFailed`.
    pub async fn sync(&self, id: IntegrationConfigId, sync_type: SyncType) -> Result<SyncResult> {
        let config = self.get(id).await?;
        check_syncable(&config)?;

        let started_at = self.clock.now_utc();
        let claimed = self
            .store
            .transition_sync_status(
                id,
                &[SyncStatus::Idle, SyncStatus::Error],
                SyncStatus::Syncing,
                started_at,
            )
            .await?;
        if !claimed {
            // Lost a race with another writer; report what it left behind.
            let current = self.get(id).await?;
            check_syncable(&current)?;
            return Err(IntegrationError::AlreadySyncing { config_id: id });
        }

        let span = info_span!(
            "integration_sync",
            config_id = %id,
            sync_type = %sync_type,
            integration_type = %config.integration_type
        );
        self.run_claimed(config, sync_type, started_at).instrument(span).await
    }

    async fn run_claimed(
        &self,
        config: IntegrationConfig,
        sync_type: SyncType,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SyncResult> {
        let id = config.id;
        let mut log = SyncLog::start(id, sync_type, started_at);
        if let Err(e) = self.store.insert_sync_log(log.clone()).await {
            let cause = IntegrationError::from(e);
            error!(error = %cause, "failed to open sync log");
            self.record_failure(id, &cause).await;
            return Err(cause);
        }

        info!("sync started");
        self.events
            .handle_event(SyncEvent::Started(SyncStartedEvent {
                config_id: id,
                sync_type,
                sync_log_id: log.id,
                started_at,
            }))
            .await;

        match self.execute_adapter(&config).await {
            Ok(result) => {
                let at = self.clock.now_utc();
                // Release the config first; the log stays open for
                // fail_sync if this write is lost.
                if let Err(e) = self.store.finish_sync(id, SyncCompletion::Succeeded { at }).await {
                    let cause = IntegrationError::from(e);
                    error!(error = %cause, "failed to record sync completion");
                    return Err(self.fail_sync(id, log, cause).await);
                }

                log.complete(
                    result.records_processed,
                    result.records_succeeded,
                    result.records_failed,
                    at,
                );
                self.finalize_log(log.clone()).await;

                info!(
                    records_processed = result.records_processed,
                    records_failed = result.records_failed,
                    "sync completed"
                );
                self.events
                    .handle_event(SyncEvent::Completed(SyncCompletedEvent {
                        config_id: id,
                        result: SyncOutcome {
                            success: result.success,
                            message: result.message.clone(),
                            records_processed: result.records_processed,
                            records_succeeded: result.records_succeeded,
                            records_failed: result.records_failed,
                        },
                        sync_log_id: log.id,
                        completed_at: at,
                    }))
                    .await;
                Ok(result)
            },
            Err(cause) => Err(self.fail_sync(id, log, cause).await),
        }
    }

    /// Records a failed sync on the log and config, emits the failure event
    /// and returns the error for the caller.
    async fn fail_sync(
        &self,
        id: IntegrationConfigId,
        mut log: SyncLog,
        cause: IntegrationError,
    ) -> IntegrationError {
        let at = self.clock.now_utc();
        log.fail(cause.to_string(), at);
        self.finalize_log(log.clone()).await;
        self.record_failure(id, &cause).await;

        error!(error = %cause, "sync failed");
        self.events
            .handle_event(SyncEvent::Failed(SyncFailedEvent {
                config_id: id,
                error: cause.to_string(),
                sync_log_id: log.id,
                failed_at: at,
            }))
            .await;
        IntegrationError::sync_failed(&cause)
    }

    /// Retry loop around the breaker around the timed adapter call.
    async fn execute_adapter(&self, config: &IntegrationConfig) -> Result<SyncResult> {
        let (adapter, breaker) = self.slot_for(config).await?;
        adapter.validate_config(config)?;

        let policy = RetryPolicy::from(config.effective_retry_config());
        let timeout = self.config.adapter_timeout;
        policy
            .retry_if(
                self.clock.as_ref(),
                |attempt| {
                    let adapter = adapter.clone();
                    let breaker = breaker.clone();
                    async move {
                        debug!(attempt = attempt + 1, "invoking adapter");
                        breaker
                            .execute(|| async {
                                match tokio::time::timeout(timeout, adapter.sync(config)).await {
                                    Ok(result) => result,
                                    Err(_) => Err(IntegrationError::timeout(timeout)),
                                }
                            })
                            .await
                    }
                },
                IntegrationError::is_retryable,
            )
            .await
    }

    async fn finalize_log(&self, log: SyncLog) {
        match self.store.finalize_sync_log(log).await {
            Ok(true) => {},
            Ok(false) => warn!("sync log was already finalized"),
            Err(e) => error!(error = %e, "failed to finalize sync log"),
        }
    }

    async fn record_failure(&self, id: IntegrationConfigId, cause: &IntegrationError) {
        let error = ErrorSnapshot::new(cause.to_string(), self.clock.now_utc());
        if let Err(e) = self.store.finish_sync(id, SyncCompletion::Failed { error }).await {
            error!(config_id = %id, error = %e, "failed to record sync failure");
        }
    }

    async fn breaker_state(&self, id: IntegrationConfigId) -> CircuitState {
        let breaker = self.slots.read().await.get(&id).map(|slot| slot.breaker.clone());
        match breaker {
            Some(breaker) => breaker.state().await,
            None => CircuitState::Closed,
        }
    }

    /// Returns the config's adapter and breaker, building them on first use
    /// or after the connection fields changed.
    async fn slot_for(
        &self,
        config: &IntegrationConfig,
    ) -> Result<(Arc<dyn IntegrationAdapter>, Arc<CircuitBreaker>)> {
        if let Some(slot) = self.slots.read().await.get(&config.id) {
            if slot.matches(config) {
                return Ok((slot.adapter.clone(), slot.breaker.clone()));
            }
        }

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(&config.id) {
            if slot.matches(config) {
                return Ok((slot.adapter.clone(), slot.breaker.clone()));
            }
            debug!(config_id = %config.id, "connection settings changed, rebuilding adapter");
        }

        let adapter = self.registry.create(config.integration_type)?;
        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}:{}", config.integration_type, config.id),
            self.config.circuit.clone(),
            self.clock.clone(),
        ));
        slots.insert(
            config.id,
            AdapterSlot {
                integration_type: config.integration_type,
                endpoint: config.endpoint.clone(),
                credentials: config.credentials.clone(),
                adapter: adapter.clone(),
                breaker: breaker.clone(),
            },
        );
        Ok((adapter, breaker))
    }
}

fn check_syncable(config: &IntegrationConfig) -> Result<()> {
    if !config.is_active {
        return Err(IntegrationError::Inactive { config_id: config.id });
    }
    match config.sync_status {
        SyncStatus::Syncing => Err(IntegrationError::AlreadySyncing { config_id: config.id }),
        SyncStatus::Paused => Err(IntegrationError::Paused { config_id: config.id }),
        SyncStatus::Idle | SyncStatus::Error => Ok(()),
    }
}

fn parse_webhook_url(url: &str) -> Result<Url> {
    Url::parse(url)
        .map_err(|e| IntegrationError::configuration(format!("invalid webhook URL '{url}': {e}")))
}

fn warn_unschedulable(frequency: Option<&str>) {
    if let Some(raw) = frequency {
        if SyncFrequency::parse(raw).is_none() {
            warn!(frequency = raw, "sync frequency is not schedulable, integration will only sync on demand");
        }
    }
}

#[cfg(test)]
mod tests {
    use carelink_core::{MemoryStore, NoOpEventHandler, TestClock};

    use super::*;
    use crate::adapters::AdapterSettings;

    fn orchestrator() -> SyncOrchestrator {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        SyncOrchestrator::new(
            Arc::new(MemoryStore::new()),
            AdapterRegistry::with_defaults(AdapterSettings::default(), clock.clone()),
            Arc::new(NoOpEventHandler::new()),
            clock,
            OrchestratorConfig::default(),
        )
    }

    fn request(name: &str) -> CreateIntegrationConfig {
        CreateIntegrationConfig {
            name: name.to_string(),
            integration_type: IntegrationType::Epic,
            endpoint: "https://fhir.epic.test".to_string(),
            credentials: Credentials::default(),
            metadata: Map::new(),
            is_active: None,
            sync_frequency: None,
            webhook_url: None,
            retry_config: None,
        }
    }

    #[tokio::test]
    async fn update_merges_metadata() {
        let orchestrator = orchestrator();
        let mut create = request("epic");
        create.metadata.insert("syncType".into(), "patients".into());
        create.metadata.insert("batchSize".into(), 50.into());
        let config = orchestrator.create(create).await.unwrap();

        let mut metadata = Map::new();
        metadata.insert("batchSize".into(), 25.into());
        let updated = orchestrator
            .update(config.id, UpdateIntegrationConfig { metadata: Some(metadata), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(updated.metadata_str("syncType"), Some("patients"));
        assert_eq!(updated.metadata_u64("batchSize"), Some(25));
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let err = orchestrator().create(request("  ")).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Configuration { .. }));
    }

    #[tokio::test]
    async fn configure_webhook_rejects_bad_url_and_keeps_metadata() {
        let orchestrator = orchestrator();
        let mut create = request("epic");
        create.metadata.insert("scope".into(), "system/*.read".into());
        let config = orchestrator.create(create).await.unwrap();

        let err = orchestrator.configure_webhook(config.id, "not a url", None).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Configuration { .. }));

        let updated = orchestrator
            .configure_webhook(config.id, "https://hooks.test/in", Some("s3cret".into()))
            .await
            .unwrap();
        assert_eq!(updated.webhook_url.as_deref(), Some("https://hooks.test/in"));
        assert_eq!(updated.webhook_secret(), Some("s3cret"));
        assert_eq!(updated.metadata_str("scope"), Some("system/*.read"));
    }

    #[tokio::test]
    async fn pause_and_resume_guard_states() {
        let orchestrator = orchestrator();
        let config = orchestrator.create(request("epic")).await.unwrap();

        orchestrator.pause(config.id).await.unwrap();
        assert!(matches!(
            orchestrator.pause(config.id).await,
            Err(IntegrationError::InvalidState { .. })
        ));
        assert!(matches!(
            orchestrator.sync(config.id, SyncType::Full).await,
            Err(IntegrationError::Paused { .. })
        ));

        orchestrator.resume(config.id).await.unwrap();
        assert_eq!(orchestrator.get(config.id).await.unwrap().sync_status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn health_metrics_are_zero_without_logs() {
        let orchestrator = orchestrator();
        orchestrator.create(request("a")).await.unwrap();
        let metrics = orchestrator.health_metrics().await.unwrap();
        assert_eq!(metrics.total_integrations, 1);
        assert_eq!(metrics.active_integrations, 1);
        assert_eq!(metrics.recent_syncs, 0);
        assert!(metrics.success_rate.abs() < f64::EPSILON);
        assert!(metrics.failure_rate.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_config_is_not_found() {
        let orchestrator = orchestrator();
        let id = IntegrationConfigId::new();
        assert!(matches!(orchestrator.sync(id, SyncType::Full).await, Err(IntegrationError::NotFound { .. })));
        assert!(matches!(orchestrator.test_connection(id).await, Err(IntegrationError::NotFound { .. })));
        assert!(matches!(orchestrator.delete(id).await, Err(IntegrationError::NotFound { .. })));
    }
}
