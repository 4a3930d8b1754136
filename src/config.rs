//! Configuration management for the Carelink integration service.

use std::time::Duration;

use anyhow::{Context, Result};
use carelink_sync::{AdapterSettings, CircuitConfig, OrchestratorConfig};
use carelink_webhooks::{ClientConfig, DispatcherConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "carelink.toml";

/// Where integration configs, sync logs and webhook events are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL through the connection pool.
    Postgres,
    /// Process-local maps; state is lost on restart.
    Memory,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`carelink.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use carelink::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Scheduler ticks every {}s", config.scheduler_tick_seconds);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// Storage backend, `postgres` or `memory`.
    ///
    /// Environment variable: `STORAGE_BACKEND`
    #[serde(default = "default_storage_backend", alias = "STORAGE_BACKEND")]
    pub storage_backend: StorageBackend,
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of database connections in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,

    // Periodic drivers
    /// Seconds between scheduled-sync passes.
    ///
    /// Environment variable: `SCHEDULER_TICK_SECONDS`
    #[serde(default = "default_scheduler_tick", alias = "SCHEDULER_TICK_SECONDS")]
    pub scheduler_tick_seconds: u64,
    /// Seconds between webhook retry sweeps.
    ///
    /// Environment variable: `WEBHOOK_SWEEP_SECONDS`
    #[serde(default = "default_webhook_sweep", alias = "WEBHOOK_SWEEP_SECONDS")]
    pub webhook_sweep_seconds: u64,

    // Circuit breaker
    /// Consecutive failures that open an integration's circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a probe.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS`
    #[serde(default = "default_reset_timeout", alias = "CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    /// Probe successes needed to close a half-open circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`
    #[serde(default = "default_success_threshold", alias = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")]
    pub circuit_breaker_success_threshold: u32,

    // Adapters
    /// Bound on every adapter call and adapter HTTP request, in seconds.
    ///
    /// Environment variable: `ADAPTER_REQUEST_TIMEOUT_SECONDS`
    #[serde(default = "default_adapter_timeout", alias = "ADAPTER_REQUEST_TIMEOUT_SECONDS")]
    pub adapter_request_timeout_seconds: u64,
    /// MLLP connect timeout in seconds.
    ///
    /// Environment variable: `HL7_CONNECT_TIMEOUT_SECONDS`
    #[serde(default = "default_hl7_connect_timeout", alias = "HL7_CONNECT_TIMEOUT_SECONDS")]
    pub hl7_connect_timeout_seconds: u64,
    /// MLLP exchange timeout in seconds.
    ///
    /// Environment variable: `HL7_SEND_TIMEOUT_SECONDS`
    #[serde(default = "default_hl7_send_timeout", alias = "HL7_SEND_TIMEOUT_SECONDS")]
    pub hl7_send_timeout_seconds: u64,

    // Webhooks
    /// HTTP timeout for one webhook delivery in seconds.
    ///
    /// Environment variable: `WEBHOOK_DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "WEBHOOK_DELIVERY_TIMEOUT_SECONDS")]
    pub webhook_delivery_timeout_seconds: u64,
    /// Delivery attempts per webhook event before it is marked failed.
    ///
    /// Environment variable: `WEBHOOK_MAX_ATTEMPTS`
    #[serde(default = "default_webhook_max_attempts", alias = "WEBHOOK_MAX_ATTEMPTS")]
    pub webhook_max_attempts: u32,
    /// Delay before the first webhook retry in milliseconds.
    ///
    /// Environment variable: `WEBHOOK_RETRY_BASE_MS`
    #[serde(default = "default_webhook_retry_base", alias = "WEBHOOK_RETRY_BASE_MS")]
    pub webhook_retry_base_ms: u64,
    /// Upper bound on the delay between webhook retries in milliseconds.
    ///
    /// Environment variable: `WEBHOOK_RETRY_CAP_MS`
    #[serde(default = "default_webhook_retry_cap", alias = "WEBHOOK_RETRY_CAP_MS")]
    pub webhook_retry_cap_ms: u64,
    /// Seconds after which an event stuck in `processing` is handed back to
    /// the retry sweep. Must exceed the longest delivery including its
    /// inner retries.
    ///
    /// Environment variable: `WEBHOOK_STALE_PROCESSING_SECONDS`
    #[serde(default = "default_webhook_stale_processing", alias = "WEBHOOK_STALE_PROCESSING_SECONDS")]
    pub webhook_stale_processing_seconds: u64,

    // Health
    /// Number of recent sync logs rolled into health metrics.
    ///
    /// Environment variable: `HEALTH_WINDOW`
    #[serde(default = "default_health_window", alias = "HEALTH_WINDOW")]
    pub health_window: usize,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or a value fails validation.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates a configuration from an assembled figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the per-integration breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker_reset_timeout_seconds),
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    /// Convert to orchestrator configuration.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            circuit: self.to_circuit_config(),
            adapter_timeout: Duration::from_secs(self.adapter_request_timeout_seconds),
            health_window: self.health_window,
        }
    }

    /// Convert to adapter timeouts.
    pub fn to_adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            request_timeout: Duration::from_secs(self.adapter_request_timeout_seconds),
            hl7_connect_timeout: Duration::from_secs(self.hl7_connect_timeout_seconds),
            hl7_send_timeout: Duration::from_secs(self.hl7_send_timeout_seconds),
            ..AdapterSettings::default()
        }
    }

    /// Convert to webhook dispatcher configuration.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: self.webhook_max_attempts,
            retry_base: Duration::from_millis(self.webhook_retry_base_ms),
            retry_cap: Duration::from_millis(self.webhook_retry_cap_ms),
            stale_processing_after: Duration::from_secs(self.webhook_stale_processing_seconds),
        }
    }

    /// Convert to webhook client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.webhook_delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Seconds between scheduled-sync passes as a duration.
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_seconds)
    }

    /// Seconds between webhook sweeps as a duration.
    pub fn webhook_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.webhook_sweep_seconds)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.storage_backend == StorageBackend::Postgres {
            if self.database_max_connections == 0 {
                anyhow::bail!("database_max_connections must be greater than 0");
            }
            if self.database_min_connections > self.database_max_connections {
                anyhow::bail!("database_min_connections cannot exceed database_max_connections");
            }
        }

        let nonzero = [
            ("scheduler_tick_seconds", self.scheduler_tick_seconds),
            ("webhook_sweep_seconds", self.webhook_sweep_seconds),
            ("circuit_breaker_failure_threshold", u64::from(self.circuit_breaker_failure_threshold)),
            ("circuit_breaker_reset_timeout_seconds", self.circuit_breaker_reset_timeout_seconds),
            ("circuit_breaker_success_threshold", u64::from(self.circuit_breaker_success_threshold)),
            ("adapter_request_timeout_seconds", self.adapter_request_timeout_seconds),
            ("hl7_connect_timeout_seconds", self.hl7_connect_timeout_seconds),
            ("hl7_send_timeout_seconds", self.hl7_send_timeout_seconds),
            ("webhook_delivery_timeout_seconds", self.webhook_delivery_timeout_seconds),
            ("webhook_max_attempts", u64::from(self.webhook_max_attempts)),
            ("webhook_retry_base_ms", self.webhook_retry_base_ms),
            ("webhook_stale_processing_seconds", self.webhook_stale_processing_seconds),
            ("health_window", self.health_window as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("{name} must be greater than 0");
        }

        if self.webhook_retry_base_ms > self.webhook_retry_cap_ms {
            anyhow::bail!("webhook_retry_base_ms cannot exceed webhook_retry_cap_ms");
        }
        if self.webhook_stale_processing_seconds <= self.webhook_delivery_timeout_seconds {
            anyhow::bail!(
                "webhook_stale_processing_seconds must exceed webhook_delivery_timeout_seconds"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_backend: default_storage_backend(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            scheduler_tick_seconds: default_scheduler_tick(),
            webhook_sweep_seconds: default_webhook_sweep(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_reset_timeout_seconds: default_reset_timeout(),
            circuit_breaker_success_threshold: default_success_threshold(),
            adapter_request_timeout_seconds: default_adapter_timeout(),
            hl7_connect_timeout_seconds: default_hl7_connect_timeout(),
            hl7_send_timeout_seconds: default_hl7_send_timeout(),
            webhook_delivery_timeout_seconds: default_delivery_timeout(),
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_retry_base_ms: default_webhook_retry_base(),
            webhook_retry_cap_ms: default_webhook_retry_cap(),
            webhook_stale_processing_seconds: default_webhook_stale_processing(),
            health_window: default_health_window(),
            rust_log: default_log_level(),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_database_url() -> String {
    "postgresql://localhost/carelink".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_scheduler_tick() -> u64 {
    60
}

fn default_webhook_sweep() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

fn default_adapter_timeout() -> u64 {
    30
}

fn default_hl7_connect_timeout() -> u64 {
    5
}

fn default_hl7_send_timeout() -> u64 {
    10
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_webhook_max_attempts() -> u32 {
    carelink_core::models::DEFAULT_WEBHOOK_MAX_ATTEMPTS
}

fn default_webhook_retry_base() -> u64 {
    1000
}

fn default_webhook_retry_cap() -> u64 {
    30_000
}

fn default_webhook_stale_processing() -> u64 {
    600
}

fn default_health_window() -> usize {
    100
}

fn default_log_level() -> String {
    "info,carelink=debug".to_string()
}
