//! In-memory test environment wiring store, clock, events and HTTP mock.

use std::sync::Arc;

use anyhow::{Context, Result};
use carelink_core::{
    Clock, EventHandler, IntegrationConfig, IntegrationStore, IntegrationType, MemoryStore,
    TestClock,
};
use carelink_sync::{AdapterRegistry, AdapterSettings, OrchestratorConfig, SyncOrchestrator};
use carelink_webhooks::{DispatcherConfig, WebhookClient, WebhookDispatcher};
use wiremock::MockServer;

use crate::{
    adapters::ScriptedAdapter, events::RecordingEventHandler, fixtures::IntegrationConfigBuilder,
    store::FaultyStore,
};

/// Isolated environment for one test.
///
/// Every component built from the same environment shares its clock and
/// store, so state written through the orchestrator is visible to the
/// dispatcher and to direct store assertions.
pub struct TestEnv {
    /// Deterministic clock; sleeps advance it instantly.
    pub clock: TestClock,
    /// Backing store.
    pub store: Arc<MemoryStore>,
    /// Recorder receiving every sync event.
    pub events: Arc<RecordingEventHandler>,
    /// HTTP mock standing in for external systems and webhook receivers.
    pub http_mock: MockServer,
}

impl TestEnv {
    /// Creates a fresh environment with its own mock server.
    pub async fn new() -> Self {
        Self {
            clock: TestClock::new(),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(RecordingEventHandler::new()),
            http_mock: MockServer::start().await,
        }
    }

    /// The clock as a trait object.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// The store as a trait object.
    pub fn store_handle(&self) -> Arc<dyn IntegrationStore> {
        self.store.clone()
    }

    /// Fault-injecting view of this environment's store.
    pub fn faulty_store(&self) -> Arc<FaultyStore> {
        Arc::new(FaultyStore::new((*self.store).clone()))
    }

    /// Registry with every built-in adapter.
    pub fn default_registry(&self) -> AdapterRegistry {
        AdapterRegistry::with_defaults(AdapterSettings::default(), self.clock_handle())
    }

    /// Built-in registry with `adapter` serving its type.
    pub fn scripted_registry(&self, adapter: &Arc<ScriptedAdapter>) -> AdapterRegistry {
        ScriptedAdapter::registry(adapter, self.default_registry())
    }

    /// Orchestrator with built-in adapters, recording events.
    pub fn orchestrator(&self) -> SyncOrchestrator {
        self.orchestrator_with(self.default_registry(), OrchestratorConfig::default())
    }

    /// Orchestrator with a custom registry and configuration.
    pub fn orchestrator_with(
        &self,
        registry: AdapterRegistry,
        config: OrchestratorConfig,
    ) -> SyncOrchestrator {
        self.orchestrator_with_events(registry, config, self.events.clone())
    }

    /// Orchestrator publishing to a custom event handler.
    pub fn orchestrator_with_events(
        &self,
        registry: AdapterRegistry,
        config: OrchestratorConfig,
        events: Arc<dyn EventHandler>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(self.store_handle(), registry, events, self.clock_handle(), config)
    }

    /// Dispatcher with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn dispatcher(&self) -> Result<WebhookDispatcher> {
        self.dispatcher_with(DispatcherConfig::default())
    }

    /// Dispatcher with custom settings.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn dispatcher_with(&self, config: DispatcherConfig) -> Result<WebhookDispatcher> {
        let client = WebhookClient::with_defaults().context("failed to build webhook client")?;
        Ok(WebhookDispatcher::new(self.store_handle(), client, self.clock_handle(), config))
    }

    /// Config builder pointed at the mock server.
    pub fn config(&self, integration_type: IntegrationType) -> IntegrationConfigBuilder {
        IntegrationConfigBuilder::new(integration_type, self.http_mock.uri(), self.clock.now_utc())
    }

    /// Absolute URL on the mock server.
    pub fn mock_url(&self, path: &str) -> String {
        format!("{}{path}", self.http_mock.uri())
    }

    /// Stores a config directly, bypassing validation.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the insert.
    pub async fn insert_config(&self, config: IntegrationConfig) -> Result<IntegrationConfig> {
        self.store.insert_config(config.clone()).await.context("failed to insert config")?;
        Ok(config)
    }

    /// Reloads a config from the store.
    ///
    /// # Errors
    ///
    /// Fails if the config is missing or the store errors.
    pub async fn reload(&self, config: &IntegrationConfig) -> Result<IntegrationConfig> {
        self.store
            .find_config(config.id)
            .await
            .context("failed to load config")?
            .context("config disappeared")
    }
}
