//! REST adapter for OAuth2 client-credentials vendors.
//!
//! Epic, Cerner, Allscripts, Medicaid, Tyler MUNIS and WI DHS all share the
//! same shape: a token endpoint, a base URL, one collection path per sync
//! sub-type and paged JSON responses. A [`VendorProfile`] captures what
//! differs between them.

use std::sync::Arc;

use async_trait::async_trait;
use carelink_core::{models::metadata_keys, Clock, IntegrationConfig, IntegrationType};
use reqwest::{header, Method};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    auth::{fetch_client_credentials, ClientCredentialsRequest, TokenCache, TokenRequestFormat},
    build_http_client, join_url, status_error, AdapterSettings, IntegrationAdapter, SyncResult,
};
use crate::error::{IntegrationError, Result};

/// Default page size sent as `_count`.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default upper bound on pages fetched per sync.
pub const DEFAULT_MAX_PAGES: u64 = 50;

/// What distinguishes one REST vendor from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorProfile {
    /// Vendor name used in messages.
    pub name: &'static str,
    /// Type tag served.
    pub integration_type: IntegrationType,
    /// Sync sub-types and their collection paths; the first is the default.
    pub resources: &'static [(&'static str, &'static str)],
    /// FHIR servers expose `/metadata`; others expose `/health`.
    pub fhir: bool,
}

/// Epic FHIR API.
pub const EPIC: VendorProfile = VendorProfile {
    name: "Epic",
    integration_type: IntegrationType::Epic,
    resources: &[
        ("patients", "/Patient"),
        ("appointments", "/Appointment"),
        ("documents", "/DocumentReference"),
    ],
    fhir: true,
};

/// Cerner FHIR API.
pub const CERNER: VendorProfile = VendorProfile {
    name: "Cerner",
    integration_type: IntegrationType::Cerner,
    resources: &[
        ("patients", "/Patient"),
        ("encounters", "/Encounter"),
        ("observations", "/Observation"),
        ("documents", "/DocumentReference"),
    ],
    fhir: true,
};

/// Allscripts proprietary API.
pub const ALLSCRIPTS: VendorProfile = VendorProfile {
    name: "Allscripts",
    integration_type: IntegrationType::Allscripts,
    resources: &[
        ("patients", "/patients"),
        ("appointments", "/appointments"),
        ("clinical", "/clinical"),
    ],
    fhir: false,
};

/// State Medicaid gateway.
pub const MEDICAID: VendorProfile = VendorProfile {
    name: "Medicaid",
    integration_type: IntegrationType::Medicaid,
    resources: &[("eligibility", "/eligibility"), ("claims", "/claims")],
    fhir: false,
};

/// Tyler MUNIS ERP.
pub const TYLER_MUNIS: VendorProfile = VendorProfile {
    name: "Tyler MUNIS",
    integration_type: IntegrationType::TylerMunis,
    resources: &[("vendors", "/vendors"), ("invoices", "/invoices"), ("payments", "/payments")],
    fhir: false,
};

/// Wisconsin DHS.
pub const WI_DHS: VendorProfile = VendorProfile {
    name: "WI DHS",
    integration_type: IntegrationType::WiDhs,
    resources: &[("cases", "/cases"), ("eligibility", "/eligibility")],
    fhir: false,
};

/// Every built-in REST vendor.
pub static PROFILES: &[VendorProfile] = &[EPIC, CERNER, ALLSCRIPTS, MEDICAID, TYLER_MUNIS, WI_DHS];

impl VendorProfile {
    /// Built-in profile for a type, if it is a REST vendor.
    pub fn for_type(integration_type: IntegrationType) -> Option<&'static VendorProfile> {
        PROFILES.iter().find(|p| p.integration_type == integration_type)
    }

    /// Sub-type used when `metadata.syncType` is absent.
    pub fn default_sync_type(&self) -> &'static str {
        self.resources.first().map_or("", |(name, _)| *name)
    }

    /// Collection path for a sub-type.
    pub fn path_for(&self, sync_type: &str) -> Option<&'static str> {
        self.resources.iter().find(|(name, _)| *name == sync_type).map(|(_, path)| *path)
    }

    fn probe_path(&self) -> &'static str {
        if self.fhir {
            "/metadata"
        } else {
            "/health"
        }
    }
}

/// One page of a collection response.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Page {
    pub records: Vec<Value>,
    pub next: Option<String>,
}

/// Extracts records and the next-page link from a response body.
///
/// Understands FHIR bundles (`entry[].resource`, `link[relation=next]`),
/// proprietary envelopes (`records` or `data`, with `next`/`nextPage`) and
/// bare arrays.
///
/// # Errors
///
/// Any other body, including an empty one, is an `Adapter` error. Treating it
/// as an empty page would advance `lastSyncAt` past records never fetched.
pub(crate) fn parse_page(body: Value) -> Result<Page> {
    match body {
        Value::Array(records) => Ok(Page { records, next: None }),
        Value::Object(mut object) => {
            if object.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
                let records = match object.remove("entry") {
                    Some(Value::Array(entries)) => entries
                        .into_iter()
                        .filter_map(|mut entry| entry.get_mut("resource").map(Value::take))
                        .collect(),
                    None | Some(Value::Null) => Vec::new(),
                    Some(_) => {
                        return Err(IntegrationError::adapter(
                            "unexpected response shape: bundle entry is not an array",
                        ))
                    },
                };
                let next = object.get("link").and_then(Value::as_array).and_then(|links| {
                    links
                        .iter()
                        .find(|l| l.get("relation").and_then(Value::as_str) == Some("next"))
                        .and_then(|l| l.get("url").and_then(Value::as_str))
                        .map(str::to_string)
                });
                return Ok(Page { records, next });
            }

            let records = ["records", "data"]
                .iter()
                .find_map(|key| match object.remove(*key) {
                    Some(Value::Array(records)) => Some(records),
                    _ => None,
                })
                .ok_or_else(|| {
                    let keys: Vec<&str> = object.keys().map(String::as_str).collect();
                    IntegrationError::adapter(format!(
                        "unexpected response shape: object without records or data (keys: {})",
                        keys.join(", ")
                    ))
                })?;
            let next = ["next", "nextPage"].iter().find_map(|key| {
                object.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
            });
            Ok(Page { records, next })
        },
        Value::Null => Err(IntegrationError::adapter("unexpected response shape: empty body")),
        other => Err(IntegrationError::adapter(format!(
            "unexpected response shape: {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolves a next-page link against the config endpoint.
pub(crate) fn resolve_link(endpoint: &str, link: &str) -> String {
    if Url::parse(link).is_ok() {
        link.to_string()
    } else {
        join_url(endpoint, link)
    }
}

/// Adapter for REST/OAuth vendors.
#[derive(Debug)]
pub struct RestAdapter {
    profile: &'static VendorProfile,
    http: reqwest::Client,
    tokens: TokenCache,
    settings: AdapterSettings,
}

impl RestAdapter {
    /// Creates an adapter for a vendor profile.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(
        profile: &'static VendorProfile,
        settings: &AdapterSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            profile,
            http: build_http_client(settings)?,
            tokens: TokenCache::new(clock),
            settings: settings.clone(),
        })
    }

    /// Vendor profile served.
    pub fn profile(&self) -> &'static VendorProfile {
        self.profile
    }

    async fn access_token(&self, config: &IntegrationConfig) -> Result<String> {
        self.tokens
            .get_or_refresh(|| async {
                let token_url = config
                    .metadata_str(metadata_keys::AUTH_URL)
                    .map_or_else(|| join_url(&config.endpoint, "/oauth2/token"), str::to_string);
                fetch_client_credentials(
                    &self.http,
                    config,
                    ClientCredentialsRequest {
                        token_url,
                        scope: config.metadata_str(metadata_keys::SCOPE),
                        format: TokenRequestFormat::Form,
                        vendor: self.profile.name,
                    },
                    self.settings.request_timeout,
                )
                .await
            })
            .await
    }

    fn collection_path(&self, sync_type: &str) -> Result<&'static str> {
        self.profile
            .path_for(sync_type)
            .ok_or_else(|| IntegrationError::adapter(format!("unknown sync type: {sync_type}")))
    }

    async fn send(
        &self,
        config: &IntegrationConfig,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let token = self.access_token(config).await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
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
            return Err(status_error(self.profile.name, url, status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IntegrationError::from_http(&e, self.settings.request_timeout))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            IntegrationError::adapter(format!("{} returned malformed JSON: {e}", self.profile.name))
        })
    }

    async fn fetch_all(&self, config: &IntegrationConfig, path: &str) -> Result<Vec<Value>> {
        let batch_size = config.metadata_u64(metadata_keys::BATCH_SIZE).unwrap_or(DEFAULT_BATCH_SIZE);
        let max_pages = config.metadata_u64(metadata_keys::MAX_PAGES).unwrap_or(DEFAULT_MAX_PAGES);

        let mut query = vec![("_count", batch_size.to_string())];
        if let Some(last_sync_at) = config.last_sync_at {
            query.push(("_lastUpdated", format!("ge{}", last_sync_at.to_rfc3339())));
        }

        let mut url = join_url(&config.endpoint, path);
        let mut records = Vec::new();
        let mut pages = 0;
        loop {
            let params: &[(&str, String)] = if pages == 0 { &query } else { &[] };
            let body = self.send(config, Method::GET, &url, params, None).await?;
            let page = parse_page(body).inspect_err(|e| {
                warn!(vendor = self.profile.name, url = %url, error = %e, "rejected page");
            })?;
            pages += 1;
            debug!(vendor = self.profile.name, page = pages, records = page.records.len(), "fetched page");
            records.extend(page.records);

            match page.next {
                Some(next) if pages < max_pages => url = resolve_link(&config.endpoint, &next),
                Some(_) => {
                    warn!(vendor = self.profile.name, max_pages, "page limit reached, stopping");
                    break;
                },
                None => break,
            }
        }
        Ok(records)
    }

    /// Creates a record in a sub-type collection (e.g. an Epic appointment).
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn create_record(
        &self,
        config: &IntegrationConfig,
        sync_type: &str,
        body: &Value,
    ) -> Result<Value> {
        self.validate_config(config)?;
        let url = join_url(&config.endpoint, self.collection_path(sync_type)?);
        self.send(config, Method::POST, &url, &[], Some(body)).await
    }

    /// Reads one record by id.
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn read_record(
        &self,
        config: &IntegrationConfig,
        sync_type: &str,
        id: &str,
    ) -> Result<Value> {
        self.validate_config(config)?;
        let path = format!("{}/{id}", self.collection_path(sync_type)?);
        let url = join_url(&config.endpoint, &path);
        self.send(config, Method::GET, &url, &[], None).await
    }

    /// Replaces one record by id.
    ///
    /// # Errors
    ///
    /// Returns adapter, authentication or transport errors.
    pub async fn update_record(
        &self,
        config: &IntegrationConfig,
        sync_type: &str,
        id: &str,
        body: &Value,
    ) -> Result<Value> {
        self.validate_config(config)?;
        let path = format!("{}/{id}", self.collection_path(sync_type)?);
        let url = join_url(&config.endpoint, &path);
        self.send(config, Method::PUT, &url, &[], Some(body)).await
    }
}

#[async_trait]
impl IntegrationAdapter for RestAdapter {
    fn integration_type(&self) -> IntegrationType {
        self.profile.integration_type
    }

    async fn sync(&self, config: &IntegrationConfig) -> Result<SyncResult> {
        self.validate_config(config)?;
        let sync_type =
            config.metadata_str(metadata_keys::SYNC_TYPE).unwrap_or(self.profile.default_sync_type());
        let path = self.collection_path(sync_type)?;

        let records = self.fetch_all(config, path).await?;
        info!(
            vendor = self.profile.name,
            sync_type,
            records = records.len(),
            "vendor sync fetched records"
        );
        Ok(SyncResult::completed(format!("{} sync completed", self.profile.name), records))
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> bool {
        if let Err(e) = self.validate_config(config) {
            warn!(vendor = self.profile.name, error = %e, "connection test rejected config");
            return false;
        }
        let url = join_url(&config.endpoint, self.profile.probe_path());
        match self.send(config, Method::GET, &url, &[], None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(vendor = self.profile.name, error = %e, "connection test failed");
                false
            },
        }
    }
}
