//! Generic FHIR R4 REST adapter.

use std::sync::Arc;

use async_trait::async_trait;
use carelink_core::{models::metadata_keys, Clock, IntegrationConfig, IntegrationType};
use reqwest::{header, Method};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    auth::{fetch_client_credentials, ClientCredentialsRequest, TokenCache, TokenRequestFormat},
    build_http_client, join_url, status_error, AdapterSettings, IntegrationAdapter, SyncResult,
};
use crate::error::{IntegrationError, Result};

/// FHIR media type.
pub const FHIR_JSON: &str = "application/fhir+json";

/// Resource searched when `metadata.resourceType` is absent.
pub const DEFAULT_RESOURCE_TYPE: &str = "Patient";

/// Scope requested when `metadata.scope` is absent.
pub const DEFAULT_SCOPE: &str = "system/*.read system/*.write";

/// Resource types the platform consumes; others are passed through as-is.
pub const KNOWN_RESOURCE_TYPES: [&str; 6] =
    ["Patient", "Encounter", "Observation", "DocumentReference", "Appointment", "Claim"];

/// Adapter for standards-compliant FHIR servers.
#[derive(Debug)]
pub struct FhirAdapter {
    http: reqwest::Client,
    tokens: TokenCache,
    settings: AdapterSettings,
}

impl FhirAdapter {
    /// Creates a FHIR adapter.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(settings: &AdapterSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            http: build_http_client(settings)?,
            tokens: TokenCache::new(clock),
            settings: settings.clone(),
        })
    }

    async fn access_token(&self, config: &IntegrationConfig) -> Result<String> {
        self.tokens
            .get_or_refresh(|| async {
                let token_url = config
                    .metadata_str(metadata_keys::AUTH_URL)
                    .map_or_else(|| join_url(&config.endpoint, "/auth/token"), str::to_string);
                fetch_client_credentials(
                    &self.http,
                    config,
                    ClientCredentialsRequest {
                        token_url,
                        scope: Some(config.metadata_str(metadata_keys::SCOPE).unwrap_or(DEFAULT_SCOPE)),
                        format: TokenRequestFormat::Json,
                        vendor: "FHIR",
                    },
                    self.settings.request_timeout,
                )
                .await
            })
            .await
    }

    async fn send(
        &self,
        config: &IntegrationConfig,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let token = self.access_token(config).await?;
        let url = join_url(&config.endpoint, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .header(header::ACCEPT, FHIR_JSON);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| IntegrationError::adapter(format!("unserializable resource: {e}")))?;
            request = request.header(header::CONTENT_TYPE, FHIR_JSON).body(bytes);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::from_http(&e, self.settings.request_timeout))?;
        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
            }
            return Err(status_error("FHIR", path, status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IntegrationError::from_http(&e, self.settings.request_timeout))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| IntegrationError::adapter(format!("FHIR server returned malformed JSON: {e}")))
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn create_resource(
        &self,
        config: &IntegrationConfig,
        resource_type: &str,
        resource: &Value,
    ) -> Result<Value> {
        self.validate_config(config)?;
        self.send(config, Method::POST, &format!("/{resource_type}"), &[], Some(resource)).await
    }

    /// Reads a resource by id.
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn read_resource(
        &self,
        config: &IntegrationConfig,
        resource_type: &str,
        id: &str,
    ) -> Result<Value> {
        self.validate_config(config)?;
        self.send(config, Method::GET, &format!("/{resource_type}/{id}"), &[], None).await
    }

    /// Replaces a resource by id.
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn update_resource(
        &self,
        config: &IntegrationConfig,
        resource_type: &str,
        id: &str,
        resource: &Value,
    ) -> Result<Value> {
        self.validate_config(config)?;
        self.send(config, Method::PUT, &format!("/{resource_type}/{id}"), &[], Some(resource)).await
    }
}

/// Converts `metadata.searchParams` into query pairs.
fn search_params(config: &IntegrationConfig) -> Vec<(String, String)> {
    let Some(Value::Object(params)) = config.metadata.get(metadata_keys::SEARCH_PARAMS) else {
        return Vec::new();
    };
    params
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}

/// Returns `entry[].resource` of a searchset bundle.
///
/// A search that does not answer with a Bundle (an `OperationOutcome`, an
/// empty body) is an `Adapter` error rather than an empty result.
fn bundle_resources(body: Value) -> Result<Vec<Value>> {
    let resource_type = body.get("resourceType").and_then(Value::as_str).unwrap_or("none");
    if resource_type != "Bundle" {
        return Err(IntegrationError::adapter(format!(
            "unexpected response shape: expected Bundle, got resourceType {resource_type}"
        )));
    }
    match body {
        Value::Object(mut object) => match object.remove("entry") {
            Some(Value::Array(entries)) => Ok(entries
                .into_iter()
                .filter_map(|mut entry| entry.get_mut("resource").map(Value::take))
                .collect()),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(_) => {
                Err(IntegrationError::adapter("unexpected response shape: bundle entry is not an array"))
            },
        },
        _ => Err(IntegrationError::adapter("unexpected response shape: bundle is not an object")),
    }
}

fn summarize(resource: &Value) -> Value {
    json!({
        "id": resource.get("id").cloned().unwrap_or(Value::Null),
        "resourceType": resource.get("resourceType").cloned().unwrap_or(Value::Null),
        "lastUpdated": resource.pointer("/meta/lastUpdated").cloned().unwrap_or(Value::Null),
    })
}

#[async_trait]
impl IntegrationAdapter for FhirAdapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Fhir
    }

    async fn sync(&self, config: &IntegrationConfig) -> Result<SyncResult> {
        self.validate_config(config)?;
        let resource_type =
            config.metadata_str(metadata_keys::RESOURCE_TYPE).unwrap_or(DEFAULT_RESOURCE_TYPE);
        if !KNOWN_RESOURCE_TYPES.contains(&resource_type) {
            info!(resource_type, "searching resource type outside the known set");
        }

        let body = self
            .send(config, Method::GET, &format!("/{resource_type}"), &search_params(config), None)
            .await?;
        let summaries: Vec<Value> = bundle_resources(body)?.iter().map(summarize).collect();
        info!(resource_type, records = summaries.len(), "FHIR search completed");
        Ok(SyncResult::completed("FHIR sync completed", summaries))
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> bool {
        if let Err(e) = self.validate_config(config) {
            warn!(error = %e, "FHIR connection test rejected config");
            return false;
        }
        match self.send(config, Method::GET, "/metadata", &[], None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "FHIR connection test failed");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn non_bundle_search_results_are_rejected() {
        assert!(bundle_resources(json!({"resourceType": "Bundle"})).unwrap().is_empty());
        for body in [json!({"resourceType": "OperationOutcome"}), Value::Null, json!([])] {
            assert!(matches!(bundle_resources(body), Err(IntegrationError::Adapter { .. })));
        }
    }

    #[test]
    fn summaries_keep_id_type_and_last_updated() {
        let resources = bundle_resources(json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {
                "resourceType": "Observation",
                "id": "obs-1",
                "meta": {"lastUpdated": "2024-01-01T00:00:00Z"},
                "status": "final"
            }}]
        }))
        .unwrap();
        assert_eq!(
            summarize(&resources[0]),
            json!({"id": "obs-1", "resourceType": "Observation", "lastUpdated": "2024-01-01T00:00:00Z"})
        );
    }

    #[test]
    fn search_params_accept_scalars_only() {
        let mut config = IntegrationConfig::new("f", IntegrationType::Fhir, "https://f", Utc::now());
        config.metadata.insert(
            metadata_keys::SEARCH_PARAMS.into(),
            json!({"status": "active", "_count": 10, "nested": {"x": 1}}),
        );
        let mut params = search_params(&config);
        params.sort();
        assert_eq!(
            params,
            vec![("_count".to_string(), "10".to_string()), ("status".to_string(), "active".to_string())]
        );
    }
}
