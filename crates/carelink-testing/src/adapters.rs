//! Scripted adapter for driving the orchestrator without a network.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use carelink_core::{IntegrationConfig, IntegrationType};
use carelink_sync::{
    adapters::require_endpoint, AdapterRegistry, IntegrationAdapter, IntegrationError, SyncResult,
};
use tokio::sync::{Mutex, Notify};

/// What the next `sync` call does.
#[derive(Debug)]
pub enum ScriptedOutcome {
    /// Returns the result.
    Succeed(SyncResult),
    /// Returns the error.
    Fail(IntegrationError),
    /// Waits for the notification, then succeeds with an empty result.
    Gate(Arc<Notify>),
    /// Never returns.
    Hang,
}

/// Adapter that replays queued outcomes and counts calls.
///
/// Once the queue is empty every call succeeds with an empty result.
#[derive(Debug)]
pub struct ScriptedAdapter {
    integration_type: IntegrationType,
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    calls: AtomicUsize,
    connection_ok: AtomicBool,
}

impl ScriptedAdapter {
    /// Creates an adapter serving `integration_type`.
    pub fn new(integration_type: IntegrationType) -> Arc<Self> {
        Arc::new(Self {
            integration_type,
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            connection_ok: AtomicBool::new(true),
        })
    }

    /// Queues an outcome.
    pub async fn push(&self, outcome: ScriptedOutcome) {
        self.outcomes.lock().await.push_back(outcome);
    }

    /// Queues `count` copies of a network failure.
    pub async fn fail_network(&self, count: usize) {
        let mut outcomes = self.outcomes.lock().await;
        for _ in 0..count {
            outcomes.push_back(ScriptedOutcome::Fail(IntegrationError::network("connection refused")));
        }
    }

    /// Sets what `test_connection` reports.
    pub fn set_connection_ok(&self, ok: bool) {
        self.connection_ok.store(ok, Ordering::SeqCst);
    }

    /// Number of `sync` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Registry whose only adapter is `adapter`, shared across configs.
    pub fn registry(adapter: &Arc<Self>, base: AdapterRegistry) -> AdapterRegistry {
        let mut registry = base;
        let adapter = adapter.clone();
        registry.register(adapter.integration_type, move |_settings, _clock| {
            Ok(adapter.clone() as Arc<dyn IntegrationAdapter>)
        });
        registry
    }
}

#[async_trait]
impl IntegrationAdapter for ScriptedAdapter {
    fn integration_type(&self) -> IntegrationType {
        self.integration_type
    }

    fn validate_config(&self, config: &IntegrationConfig) -> carelink_sync::Result<()> {
        require_endpoint(config)
    }

    async fn sync(&self, _config: &IntegrationConfig) -> carelink_sync::Result<SyncResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().await.pop_front();
        match next {
            Some(ScriptedOutcome::Succeed(result)) => Ok(result),
            Some(ScriptedOutcome::Fail(error)) => Err(error),
            Some(ScriptedOutcome::Gate(gate)) => {
                gate.notified().await;
                Ok(SyncResult::completed("released", Vec::new()))
            },
            Some(ScriptedOutcome::Hang) => std::future::pending().await,
            None => Ok(SyncResult::completed("scripted sync completed", Vec::new())),
        }
    }

    async fn test_connection(&self, _config: &IntegrationConfig) -> bool {
        self.connection_ok.load(Ordering::SeqCst)
    }
}
