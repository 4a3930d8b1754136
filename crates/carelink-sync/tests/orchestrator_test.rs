//! Integration tests for the sync orchestrator.
//!
//! Drives full syncs through a scripted adapter against the in-memory store
//! and checks the observable state machine: config status, sync logs, events
//! and circuit state.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use carelink_core::{
    events::{SYNC_COMPLETED, SYNC_FAILED, SYNC_STARTED},
    Clock, IntegrationType, SyncLogStatus, SyncStatus, SyncType,
};
use carelink_sync::{
    CircuitConfig, CircuitState, IntegrationError, OrchestratorConfig, SyncOrchestrator,
    SyncResult,
};
use carelink_testing::{ScriptedAdapter, ScriptedOutcome, StoreFault, TestEnv};
use serde_json::json;
use tokio::sync::Notify;

fn scripted() -> Arc<ScriptedAdapter> {
    ScriptedAdapter::new(IntegrationType::Epic)
}

#[tokio::test]
async fn successful_sync_finalizes_log_and_emits_events() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter
        .push(ScriptedOutcome::Succeed(SyncResult::completed(
            "Epic sync completed",
            vec![json!({"id": "1"}), json!({"id": "2"})],
        )))
        .await;
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    let result = orchestrator.sync(config.id, SyncType::Manual).await.unwrap();
    assert_eq!(result.records_processed, 2);

    let stored = env.reload(&config).await.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Idle);
    assert!(stored.last_sync_at.is_some());
    assert!(stored.last_error.is_none());

    let logs = orchestrator.sync_logs(config.id, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncLogStatus::Success);
    assert_eq!(logs[0].records_succeeded, 2);
    assert!(logs[0].is_finalized());

    assert_eq!(env.events.event_types().await, vec![SYNC_STARTED, SYNC_COMPLETED]);
}

#[tokio::test]
async fn failed_sync_records_error_on_config_and_log() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter
        .push(ScriptedOutcome::Fail(IntegrationError::authentication("token rejected")))
        .await;
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config =
        env.insert_config(env.config(IntegrationType::Epic).fast_retries(3).build()).await.unwrap();

    let err = orchestrator.sync(config.id, SyncType::Full).await.unwrap_err();
    assert!(matches!(err, IntegrationError::SyncFailed { ref message } if message.contains("token rejected")));
    assert_eq!(adapter.calls(), 1, "authentication failures are not retried");

    let stored = env.reload(&config).await.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored.last_error.unwrap().message.contains("token rejected"));

    let logs = orchestrator.sync_logs(config.id, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncLogStatus::Failed);
    assert!(logs[0].completed_at.is_some());

    assert_eq!(env.events.event_types().await, vec![SYNC_STARTED, SYNC_FAILED]);
}

#[tokio::test]
async fn transient_failures_are_retried_within_one_sync() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.fail_network(2).await;
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config =
        env.insert_config(env.config(IntegrationType::Epic).fast_retries(3).build()).await.unwrap();

    orchestrator.sync(config.id, SyncType::Manual).await.unwrap();

    assert_eq!(adapter.calls(), 3);
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::Closed);
    assert_eq!(orchestrator.sync_logs(config.id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_sync_is_rejected() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let gate = Arc::new(Notify::new());
    adapter.push(ScriptedOutcome::Gate(gate.clone())).await;
    let orchestrator =
        Arc::new(env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default()));
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    let id = config.id;
    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.sync(id, SyncType::Manual).await }
    });
    tokio::time::timeout(Duration::from_secs(2), async {
        while adapter.calls() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("first sync never reached the adapter");

    let err = orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::AlreadySyncing { .. }));
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Syncing);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Idle);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn inactive_and_paused_configs_do_not_sync() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let inactive = env.insert_config(env.config(IntegrationType::Epic).inactive().build()).await.unwrap();
    let paused = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();
    orchestrator.pause(paused.id).await.unwrap();

    let err = orchestrator.sync(inactive.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Inactive { .. }));
    let err = orchestrator.sync(paused.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Paused { .. }));

    assert_eq!(adapter.calls(), 0);
    assert!(orchestrator.sync_logs(inactive.id, None).await.unwrap().is_empty());
    assert!(env.events.events().await.is_empty());

    orchestrator.resume(paused.id).await.unwrap();
    orchestrator.sync(paused.id, SyncType::Manual).await.unwrap();
}

#[tokio::test]
async fn unknown_config_is_not_found() {
    let env = TestEnv::new().await;
    let orchestrator = env.orchestrator();
    let err = orchestrator
        .sync(carelink_core::IntegrationConfigId::new(), SyncType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::NotFound { .. }));
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_rejects_without_calling_adapter() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.fail_network(2).await;
    let orchestrator = env.orchestrator_with(
        env.scripted_registry(&adapter),
        OrchestratorConfig {
            circuit: CircuitConfig { failure_threshold: 2, ..CircuitConfig::default() },
            ..OrchestratorConfig::default()
        },
    );
    let config = env.insert_config(env.config(IntegrationType::Epic).no_retries().build()).await.unwrap();

    for _ in 0..2 {
        orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    }
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::Open);

    let err = orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::SyncFailed { ref message } if message.contains("circuit breaker open")));
    assert_eq!(adapter.calls(), 2);
    assert_eq!(orchestrator.sync_logs(config.id, None).await.unwrap().len(), 3);

    orchestrator.reset_circuit(config.id).await.unwrap();
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::Closed);
    orchestrator.sync(config.id, SyncType::Manual).await.unwrap();
    assert_eq!(adapter.calls(), 3);
}

#[tokio::test]
async fn circuit_half_opens_after_reset_timeout() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.fail_network(1).await;
    let orchestrator = env.orchestrator_with(
        env.scripted_registry(&adapter),
        OrchestratorConfig {
            circuit: CircuitConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..OrchestratorConfig::default()
        },
    );
    let config = env.insert_config(env.config(IntegrationType::Epic).no_retries().build()).await.unwrap();

    orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::Open);

    env.clock.advance(Duration::from_secs(61));
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::HalfOpen);

    orchestrator.sync(config.id, SyncType::Manual).await.unwrap();
    assert_eq!(orchestrator.circuit_state(config.id).await.unwrap(), CircuitState::Closed);
}

#[tokio::test]
async fn slow_adapter_times_out() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.push(ScriptedOutcome::Hang).await;
    let orchestrator = env.orchestrator_with(
        env.scripted_registry(&adapter),
        OrchestratorConfig { adapter_timeout: Duration::from_millis(50), ..OrchestratorConfig::default() },
    );
    let config = env.insert_config(env.config(IntegrationType::Epic).no_retries().build()).await.unwrap();

    let err = orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::SyncFailed { ref message } if message.contains("timed out")));
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn scheduled_sync_runs_only_due_configs() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let now = env.clock.now_utc();

    let due = env
        .insert_config(
            env.config(IntegrationType::Epic)
                .sync_frequency("*/5 * * * *")
                .last_sync_at(now - chrono::Duration::minutes(6))
                .build(),
        )
        .await
        .unwrap();
    let recent = env
        .insert_config(
            env.config(IntegrationType::Epic)
                .sync_frequency("*/5 * * * *")
                .last_sync_at(now - chrono::Duration::minutes(2))
                .build(),
        )
        .await
        .unwrap();
    env.insert_config(env.config(IntegrationType::Epic).sync_frequency("*/5 * * * *").inactive().build())
        .await
        .unwrap();

    let summary = orchestrator.scheduled_sync().await;
    assert_eq!(summary.considered, 2);
    assert_eq!(summary.triggered, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(adapter.calls(), 1);

    assert_eq!(orchestrator.sync_logs(due.id, None).await.unwrap().len(), 1);
    assert!(orchestrator.sync_logs(recent.id, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_failed_sync_requires_error_state() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.push(ScriptedOutcome::Fail(IntegrationError::adapter("bad payload"))).await;
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    let err = orchestrator.retry_failed_sync(config.id).await.unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidState { .. }));

    orchestrator.sync(config.id, SyncType::Full).await.unwrap_err();
    orchestrator.retry_failed_sync(config.id).await.unwrap();

    let logs = orchestrator.sync_logs(config.id, None).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs.iter().filter(|l| l.sync_type == SyncType::Manual).count(), 1);
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Idle);
}

#[tokio::test]
async fn health_metrics_reflect_recent_outcomes() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    adapter.push(ScriptedOutcome::Fail(IntegrationError::adapter("bad payload"))).await;
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let failing = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();
    let healthy = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();
    env.insert_config(env.config(IntegrationType::Epic).inactive().build()).await.unwrap();

    orchestrator.sync(failing.id, SyncType::Manual).await.unwrap_err();
    orchestrator.sync(healthy.id, SyncType::Manual).await.unwrap();

    let metrics = orchestrator.health_metrics().await.unwrap();
    assert_eq!(metrics.total_integrations, 3);
    assert_eq!(metrics.active_integrations, 2);
    assert_eq!(metrics.error_integrations, 1);
    assert_eq!(metrics.syncing_integrations, 0);
    assert_eq!(metrics.recent_syncs, 2);
    assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
    assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn connection_test_reports_adapter_result() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    let result = orchestrator.test_connection(config.id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.message, "Connection test successful");

    adapter.set_connection_ok(false);
    let result = orchestrator.test_connection(config.id).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.message, "Connection test failed");
}

#[tokio::test]
async fn delete_removes_config() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let orchestrator = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();
    orchestrator.sync(config.id, SyncType::Manual).await.unwrap();

    orchestrator.delete(config.id).await.unwrap();
    assert!(matches!(
        orchestrator.get(config.id).await.unwrap_err(),
        IntegrationError::NotFound { .. }
    ));
    assert!(matches!(
        orchestrator.delete(config.id).await.unwrap_err(),
        IntegrationError::NotFound { .. }
    ));
}

#[tokio::test]
async fn store_failure_while_recording_success_leaves_config_in_error() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let store = env.faulty_store();
    store.arm(StoreFault::FinishSyncSucceeded);
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        env.scripted_registry(&adapter),
        env.events.clone(),
        env.clock_handle(),
        OrchestratorConfig::default(),
    );
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    let err = orchestrator.sync(config.id, SyncType::Manual).await.unwrap_err();
    assert!(matches!(err, IntegrationError::SyncFailed { ref message } if message.contains("connection reset")));

    let stored = env.reload(&config).await.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored.last_sync_at.is_none());
    assert!(stored.last_error.unwrap().message.contains("connection reset"));

    let logs = orchestrator.sync_logs(config.id, None).await.unwrap();
    assert_eq!(logs[0].status, SyncLogStatus::Failed);
    assert_eq!(env.events.event_types().await, vec![SYNC_STARTED, SYNC_FAILED]);

    store.disarm(StoreFault::FinishSyncSucceeded);
    orchestrator.retry_failed_sync(config.id).await.unwrap();
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Idle);
}

#[tokio::test]
async fn interrupted_syncs_are_recovered_at_startup() {
    let env = TestEnv::new().await;
    let adapter = scripted();
    let store = env.faulty_store();
    store.arm(StoreFault::FinishSyncSucceeded);
    store.arm(StoreFault::FinishSyncFailed);
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        env.scripted_registry(&adapter),
        env.events.clone(),
        env.clock_handle(),
        OrchestratorConfig::default(),
    );
    let config = env.insert_config(env.config(IntegrationType::Epic).build()).await.unwrap();

    orchestrator.sync(config.id, SyncType::Full).await.unwrap_err();
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Syncing);
    assert!(matches!(
        orchestrator.sync(config.id, SyncType::Full).await,
        Err(IntegrationError::AlreadySyncing { .. })
    ));

    store.disarm(StoreFault::FinishSyncSucceeded);
    store.disarm(StoreFault::FinishSyncFailed);
    let restarted = env.orchestrator_with(env.scripted_registry(&adapter), OrchestratorConfig::default());
    assert_eq!(restarted.recover_interrupted_syncs().await.unwrap(), vec![config.id]);

    let stored = env.reload(&config).await.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored.last_error.unwrap().message.contains("interrupted"));

    restarted.retry_failed_sync(config.id).await.unwrap();
    assert_eq!(env.reload(&config).await.unwrap().sync_status, SyncStatus::Idle);
    assert!(restarted.recover_interrupted_syncs().await.unwrap().is_empty());
}
