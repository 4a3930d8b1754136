//! Sync engine for external health and benefits systems.
//!
//! Connects integration configs to their external systems through
//! protocol-specific adapters, guards each config with its own circuit
//! breaker and retries transient failures with configurable backoff.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌─────────────────┐   ┌──────────────────┐
//! │ SyncScheduler    │──▶│ SyncOrchestrator│──▶│ RetryPolicy      │
//! └──────────────────┘   └─────────────────┘   └──────────────────┘
//!                               │                       │
//!                               ▼                       ▼
//!                        ┌──────────────┐      ┌─────────────────┐
//!                        │ Store +      │      │ CircuitBreaker  │
//!                        │ SyncEvents   │      │ ─▶ Adapter      │
//!                        └──────────────┘      └─────────────────┘
//! ```
//!
//! Adapters cover REST/OAuth vendors (Epic, Cerner, Allscripts, Medicaid,
//! Tyler MUNIS, WI DHS), generic FHIR servers, HL7 v2 over MLLP and EDI X12
//! clearinghouses.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use carelink_core::{MemoryStore, NoOpEventHandler, RealClock, SyncType};
//! use carelink_sync::{
//!     AdapterRegistry, AdapterSettings, IntegrationError, OrchestratorConfig, SyncOrchestrator,
//! };
//!
//! # async fn example(id: carelink_core::IntegrationConfigId) -> Result<(), IntegrationError> {
//! let clock = Arc::new(RealClock::new());
//! let orchestrator = SyncOrchestrator::new(
//!     Arc::new(MemoryStore::new()),
//!     AdapterRegistry::with_defaults(AdapterSettings::default(), clock.clone()),
//!     Arc::new(NoOpEventHandler::new()),
//!     clock,
//!     OrchestratorConfig::default(),
//! );
//! let result = orchestrator.sync(id, SyncType::Full).await?;
//! println!("{} records", result.records_processed);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod circuit;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod schedule;
pub mod scheduler;

pub use adapters::{AdapterRegistry, AdapterSettings, IntegrationAdapter, SyncResult};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};
pub use error::{ErrorCategory, IntegrationError, Result};
pub use orchestrator::{
    ConnectionTestResult, CreateIntegrationConfig, HealthMetrics, OrchestratorConfig,
    ScheduleSummary, SyncOrchestrator, SyncStatusView, UpdateIntegrationConfig,
};
pub use retry::RetryPolicy;
pub use schedule::SyncFrequency;
pub use scheduler::SyncScheduler;
