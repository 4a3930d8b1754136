//! Adapters translating the generic sync contract into external protocols.
//!
//! Every supported [`IntegrationType`] maps to an [`IntegrationAdapter`]
//! through the [`AdapterRegistry`]. Adapters are stateful only in their token
//! cache; the orchestrator creates one instance per config so tokens are never
//! shared across configs.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use carelink_core::{Clock, IntegrationConfig, IntegrationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IntegrationError, Result};

pub mod auth;
pub mod edi;
pub mod fhir;
pub mod hl7;
pub mod rest;

pub use edi::EdiAdapter;
pub use fhir::FhirAdapter;
pub use hl7::Hl7Adapter;
pub use rest::{RestAdapter, VendorProfile};

/// Aggregate outcome of one adapter sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Adapter-reported success.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Records fetched.
    pub records_processed: u64,
    /// Records handled successfully.
    pub records_succeeded: u64,
    /// Records that could not be handled.
    pub records_failed: u64,
    /// Translated records or per-record summaries.
    pub data: Vec<Value>,
}

impl SyncResult {
    /// Result where every fetched record succeeded.
    pub fn completed(message: impl Into<String>, data: Vec<Value>) -> Self {
        let count = data.len() as u64;
        Self {
            success: true,
            message: message.into(),
            records_processed: count,
            records_succeeded: count,
            records_failed: 0,
            data,
        }
    }

    /// Result where `failed` of the records in `data` could not be handled.
    pub fn with_failures(message: impl Into<String>, data: Vec<Value>, failed: u64) -> Self {
        let count = data.len() as u64;
        let failed = failed.min(count);
        Self {
            success: true,
            message: message.into(),
            records_processed: count,
            records_succeeded: count - failed,
            records_failed: failed,
            data,
        }
    }
}

/// Capability set every external-system adapter implements.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync + fmt::Debug {
    /// Type tag this adapter serves.
    fn integration_type(&self) -> IntegrationType;

    /// Fails fast before any network call when the config is unusable.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the endpoint or credentials are missing.
    fn validate_config(&self, config: &IntegrationConfig) -> Result<()> {
        require_endpoint(config)?;
        require_credentials(config)
    }

    /// Fetches records from the external system.
    ///
    /// Never mutates config state; the orchestrator owns all transitions.
    ///
    /// # Errors
    ///
    /// Returns authentication, network, timeout or adapter errors carrying
    /// the underlying cause.
    async fn sync(&self, config: &IntegrationConfig) -> Result<SyncResult>;

    /// Minimal reachability and auth probe. Never fails; errors become
    /// `false`.
    async fn test_connection(&self, config: &IntegrationConfig) -> bool;
}

/// Fails with `Configuration` when the endpoint is blank.
///
/// # Errors
///
/// Returns `Configuration` for a blank endpoint.
pub fn require_endpoint(config: &IntegrationConfig) -> Result<()> {
    if config.endpoint.trim().is_empty() {
        return Err(IntegrationError::configuration(format!(
            "integration {} has no endpoint",
            config.name
        )));
    }
    Ok(())
}

/// Fails with `Configuration` when no credential value is present.
///
/// # Errors
///
/// Returns `Configuration` when the credential bag is empty.
pub fn require_credentials(config: &IntegrationConfig) -> Result<()> {
    if config.credentials.is_empty() {
        return Err(IntegrationError::configuration(format!(
            "integration {} has no credentials",
            config.name
        )));
    }
    Ok(())
}

/// Joins a base endpoint and a path with exactly one slash.
pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Builds the HTTP client shared by one adapter instance.
pub(crate) fn build_http_client(settings: &AdapterSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .user_agent(&settings.user_agent)
        .build()
        .map_err(|e| IntegrationError::configuration(format!("failed to build HTTP client: {e}")))
}

/// Maps a non-2xx response to an error.
///
/// 401 and 403 become `Authentication`. 502, 503 and 504 mean the vendor or
/// its gateway is briefly unavailable and become retryable `Network` errors.
/// Everything else is an `Adapter` error naming the vendor and status.
pub(crate) fn status_error(vendor: &str, what: &str, status: reqwest::StatusCode) -> IntegrationError {
    use reqwest::StatusCode;

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IntegrationError::authentication(
            format!("{vendor} rejected credentials for {what}: HTTP {}", status.as_u16()),
        ),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            IntegrationError::network(format!(
                "{vendor} {what} unavailable: HTTP {}",
                status.as_u16()
            ))
        },
        _ => IntegrationError::adapter(format!("{vendor} {what} failed: HTTP {}", status.as_u16())),
    }
}

/// Timeouts applied by adapters to outbound calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Bound on each HTTP request.
    pub request_timeout: Duration,
    /// Bound on opening an MLLP connection.
    pub hl7_connect_timeout: Duration,
    /// Bound on an MLLP exchange once connected.
    pub hl7_send_timeout: Duration,
    /// User agent for adapter HTTP requests.
    pub user_agent: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            hl7_connect_timeout: Duration::from_secs(5),
            hl7_send_timeout: Duration::from_secs(10),
            user_agent: "carelink-sync/1.0".to_string(),
        }
    }
}

type AdapterFactory =
    Arc<dyn Fn(&AdapterSettings, Arc<dyn Clock>) -> Result<Arc<dyn IntegrationAdapter>> + Send + Sync>;

/// Maps integration type tags to adapter factories.
#[derive(Clone)]
pub struct AdapterRegistry {
    settings: AdapterSettings,
    clock: Arc<dyn Clock>,
    factories: HashMap<IntegrationType, AdapterFactory>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&'static str> = self.factories.keys().map(IntegrationType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("settings", &self.settings)
            .field("types", &types)
            .finish_non_exhaustive()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new(settings: AdapterSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock, factories: HashMap::new() }
    }

    /// Creates a registry with the built-in adapter for every type.
    pub fn with_defaults(settings: AdapterSettings, clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self::new(settings, clock);
        for profile in rest::PROFILES {
            registry.register(profile.integration_type, move |settings, clock| {
                Ok(Arc::new(RestAdapter::new(profile, settings, clock)?))
            });
        }
        registry.register(IntegrationType::Fhir, |settings, clock| {
            Ok(Arc::new(FhirAdapter::new(settings, clock)?))
        });
        registry.register(IntegrationType::Hl7, |settings, _clock| {
            Ok(Arc::new(Hl7Adapter::new(settings)))
        });
        registry.register(IntegrationType::Edi, |settings, _clock| {
            Ok(Arc::new(EdiAdapter::new(settings)?))
        });
        registry
    }

    /// Registers or replaces the factory for a type.
    pub fn register<F>(&mut self, integration_type: IntegrationType, factory: F)
    where
        F: Fn(&AdapterSettings, Arc<dyn Clock>) -> Result<Arc<dyn IntegrationAdapter>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(integration_type, Arc::new(factory));
    }

    /// True when a factory exists for the type.
    pub fn supports(&self, integration_type: IntegrationType) -> bool {
        self.factories.contains_key(&integration_type)
    }

    /// Builds a fresh adapter instance for the type.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unregistered type or when the adapter
    /// cannot be constructed.
    pub fn create(&self, integration_type: IntegrationType) -> Result<Arc<dyn IntegrationAdapter>> {
        let factory = self.factories.get(&integration_type).ok_or_else(|| {
            IntegrationError::configuration(format!(
                "no adapter registered for integration type {integration_type}"
            ))
        })?;
        factory(&self.settings, self.clock.clone())
    }

    /// Adapter settings shared by all instances.
    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use carelink_core::RealClock;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_cover_every_type() {
        let registry = AdapterRegistry::with_defaults(AdapterSettings::default(), Arc::new(RealClock));
        for ty in IntegrationType::ALL {
            assert!(registry.supports(ty), "missing adapter for {ty}");
            assert_eq!(registry.create(ty).unwrap().integration_type(), ty);
        }
    }

    #[test]
    fn empty_registry_rejects_types() {
        let registry = AdapterRegistry::new(AdapterSettings::default(), Arc::new(RealClock));
        let err = registry.create(IntegrationType::Epic).unwrap_err();
        assert!(matches!(err, IntegrationError::Configuration { .. }));
    }

    #[test]
    fn result_counts_follow_data() {
        let result = SyncResult::with_failures("done", vec![json!(1), json!(2), json!(3)], 1);
        assert_eq!(result.records_processed, 3);
        assert_eq!(result.records_succeeded, 2);
        assert_eq!(result.records_failed, 1);
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        use reqwest::StatusCode;

        let err = status_error("Epic", "/Patient", StatusCode::FORBIDDEN);
        assert!(matches!(err, IntegrationError::Authentication { .. }));
        for status in [StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE, StatusCode::GATEWAY_TIMEOUT] {
            let err = status_error("Epic", "/Patient", status);
            assert!(matches!(err, IntegrationError::Network { .. }), "{status}");
            assert!(err.is_retryable());
        }
        for status in [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::NOT_FOUND] {
            let err = status_error("Epic", "/Patient", status);
            assert!(matches!(err, IntegrationError::Adapter { .. }), "{status}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn url_join_normalizes_slashes() {
        assert_eq!(join_url("https://h/api/", "/Patient"), "https://h/api/Patient");
        assert_eq!(join_url("https://h", "health"), "https://h/health");
    }
}
