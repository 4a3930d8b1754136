//! Core domain models and strongly-typed identifiers.
//!
//! Defines integration configs, sync logs, webhook events and newtype ID
//! wrappers for compile-time type safety. Includes the lifecycle helpers that
//! keep state transitions in one place: a sync log is finalized exactly once,
//! a webhook event never moves out of a terminal state.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// Default number of whole-delivery attempts for a webhook event.
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 3;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidInput(format!("invalid id '{s}': {e}")))
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed integration config identifier.
    ///
    /// Every sync log and webhook event hangs off one of these; deleting the
    /// config cascades to both.
    IntegrationConfigId
}

uuid_id! {
    /// Strongly-typed sync log identifier.
    SyncLogId
}

uuid_id! {
    /// Strongly-typed webhook event identifier.
    WebhookEventId
}

/// Writes a lowercase tag and parses it back, for enums stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the stable lowercase tag used in storage and JSON.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(CoreError::InvalidInput(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// External system families the platform can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    /// Tyler MUNIS government ERP.
    TylerMunis,
    /// Wisconsin Department of Health Services eligibility system.
    WiDhs,
    /// State Medicaid eligibility and claims gateway.
    Medicaid,
    /// HL7 v2 over MLLP.
    Hl7,
    /// Generic FHIR R4 REST server.
    Fhir,
    /// EDI X12 clearinghouse.
    Edi,
    /// Epic FHIR API.
    Epic,
    /// Cerner (Oracle Health) FHIR API.
    Cerner,
    /// Allscripts proprietary REST API.
    Allscripts,
}

text_enum!(IntegrationType {
    TylerMunis => "tyler_munis",
    WiDhs => "wi_dhs",
    Medicaid => "medicaid",
    Hl7 => "hl7",
    Fhir => "fhir",
    Edi => "edi",
    Epic => "epic",
    Cerner => "cerner",
    Allscripts => "allscripts",
});

impl IntegrationType {
    /// All supported integration types.
    pub const ALL: [Self; 9] = [
        Self::TylerMunis,
        Self::WiDhs,
        Self::Medicaid,
        Self::Hl7,
        Self::Fhir,
        Self::Edi,
        Self::Epic,
        Self::Cerner,
        Self::Allscripts,
    ];
}

/// Sync lifecycle state of an integration config.
///
/// Transitions: `idle -> syncing -> {idle, error}`, `error -> syncing` on
/// retry, and `idle|error <-> paused` by operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Ready to sync.
    #[default]
    Idle,
    /// A sync is in flight; new sync requests are rejected.
    Syncing,
    /// The last sync failed; `last_error` explains why.
    Error,
    /// Excluded from scheduling and manual sync until resumed.
    Paused,
}

text_enum!(SyncStatus {
    Idle => "idle",
    Syncing => "syncing",
    Error => "error",
    Paused => "paused",
});

/// Outcome recorded on a sync log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    /// All records processed.
    Success,
    /// The sync raised an error.
    Failed,
    /// The sync completed but some records failed.
    Partial,
}

text_enum!(SyncLogStatus {
    Success => "success",
    Failed => "failed",
    Partial => "partial",
});

/// What triggered a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Scheduled or operator-requested complete pass.
    #[default]
    Full,
    /// Only records changed since `last_sync_at`.
    Incremental,
    /// Operator retry after a failure.
    Manual,
}

text_enum!(SyncType {
    Full => "full",
    Incremental => "incremental",
    Manual => "manual",
});

/// Delivery state of an outbound webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    /// Waiting for first delivery or for `next_retry_at`.
    #[default]
    Pending,
    /// A delivery attempt is in flight.
    Processing,
    /// Terminal success.
    Delivered,
    /// Terminal failure after exhausting attempts.
    Failed,
}

text_enum!(WebhookEventStatus {
    Pending => "pending",
    Processing => "processing",
    Delivered => "delivered",
    Failed => "failed",
});

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay doubles each attempt up to the cap.
    #[default]
    Exponential,
    /// Delay grows by the initial delay each attempt up to the cap.
    Linear,
    /// Delay stays at the initial delay.
    Fixed,
}

text_enum!(BackoffStrategy {
    Exponential => "exponential",
    Linear => "linear",
    Fixed => "fixed",
});

/// Per-config retry settings for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    /// How the delay evolves between attempts.
    pub backoff_strategy: BackoffStrategy,
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Message and time of a failure, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    /// Human-readable failure description.
    pub message: String,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
}

impl ErrorSnapshot {
    /// Captures a failure message at the given time.
    pub fn new(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { message: message.into(), timestamp }
    }
}

/// Opaque credential bag.
///
/// `Debug` prints only the keys so secrets never reach logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub HashMap<String, String>);

impl Credentials {
    /// Returns the value for `key` if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// True when no non-empty credential is present.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(String::is_empty)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("Credentials").field("keys", &keys).finish_non_exhaustive()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Well-known metadata keys.
pub mod metadata_keys {
    /// Adapter-specific sync sub-type.
    pub const SYNC_TYPE: &str = "syncType";
    /// Page size for paginated fetches.
    pub const BATCH_SIZE: &str = "batchSize";
    /// Upper bound on pages fetched per sync.
    pub const MAX_PAGES: &str = "maxPages";
    /// OAuth token endpoint override.
    pub const AUTH_URL: &str = "authUrl";
    /// OAuth scope.
    pub const SCOPE: &str = "scope";
    /// FHIR resource type to search.
    pub const RESOURCE_TYPE: &str = "resourceType";
    /// FHIR search parameters object.
    pub const SEARCH_PARAMS: &str = "searchParams";
    /// HL7 message type hint.
    pub const MESSAGE_TYPE: &str = "messageType";
    /// HL7 query message sent at the start of a sync.
    pub const QUERY_MESSAGE: &str = "queryMessage";
    /// EDI transaction set to fetch.
    pub const TRANSACTION_TYPE: &str = "transactionType";
    /// Secret used to sign outbound webhooks.
    pub const WEBHOOK_SECRET: &str = "webhookSecret";
    /// Extra headers for outbound webhooks.
    pub const WEBHOOK_HEADERS: &str = "webhookHeaders";
}

/// One connection to an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    /// Unique identifier.
    pub id: IntegrationConfigId,
    /// Operator-facing name.
    pub name: String,
    /// External system family.
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    /// Base URL (or `mllp://host:port` for HL7).
    pub endpoint: String,
    /// Opaque key to secret mapping.
    pub credentials: Credentials,
    /// Per-type options.
    pub metadata: Map<String, Value>,
    /// Inactive configs are never synced.
    pub is_active: bool,
    /// Cron-like schedule, e.g. `*/15 * * * *` or `hourly`.
    pub sync_frequency: Option<String>,
    /// Completion time of the last successful sync.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub sync_status: SyncStatus,
    /// Last failure, cleared on success.
    pub last_error: Option<ErrorSnapshot>,
    /// Destination for outbound notifications.
    pub webhook_url: Option<String>,
    /// Retry settings for outbound calls.
    pub retry_config: Option<RetryConfig>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl IntegrationConfig {
    /// Creates an active, idle config with empty metadata.
    pub fn new(
        name: impl Into<String>,
        integration_type: IntegrationType,
        endpoint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IntegrationConfigId::new(),
            name: name.into(),
            integration_type,
            endpoint: endpoint.into(),
            credentials: Credentials::default(),
            metadata: Map::new(),
            is_active: true,
            sync_frequency: None,
            last_sync_at: None,
            sync_status: SyncStatus::Idle,
            last_error: None,
            webhook_url: None,
            retry_config: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a string metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Returns a positive integer metadata value, accepting numeric strings.
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .filter(|n| *n > 0)
    }

    /// Returns the webhook signing secret, if configured.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.metadata_str(metadata_keys::WEBHOOK_SECRET)
    }

    /// Returns the extra string headers for outbound webhooks.
    pub fn webhook_headers(&self) -> Vec<(String, String)> {
        let Some(Value::Object(headers)) = self.metadata.get(metadata_keys::WEBHOOK_HEADERS)
        else {
            return Vec::new();
        };
        headers
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect()
    }

    /// Retry settings, falling back to the defaults.
    pub fn effective_retry_config(&self) -> RetryConfig {
        self.retry_config.unwrap_or_default()
    }
}

/// Audit record of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    /// Unique identifier.
    pub id: SyncLogId,
    /// Owning config.
    pub integration_config_id: IntegrationConfigId,
    /// Outcome; optimistically `success` until finalized.
    pub status: SyncLogStatus,
    /// Trigger.
    pub sync_type: SyncType,
    /// When the sync began.
    pub started_at: DateTime<Utc>,
    /// When the sync was finalized; `None` while in flight.
    pub completed_at: Option<DateTime<Utc>>,
    /// Records the adapter touched.
    pub records_processed: u64,
    /// Records handled successfully.
    pub records_succeeded: u64,
    /// Records that failed.
    pub records_failed: u64,
    /// Failure description for failed syncs.
    pub error: Option<ErrorSnapshot>,
}

impl SyncLog {
    /// Opens a log for a sync starting now.
    pub fn start(
        integration_config_id: IntegrationConfigId,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SyncLogId::new(),
            integration_config_id,
            status: SyncLogStatus::Success,
            sync_type,
            started_at,
            completed_at: None,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            error: None,
        }
    }

    /// Finalizes as successful, or partial when some records failed.
    pub fn complete(&mut self, processed: u64, succeeded: u64, failed: u64, at: DateTime<Utc>) {
        self.status = if failed > 0 { SyncLogStatus::Partial } else { SyncLogStatus::Success };
        self.records_processed = processed;
        self.records_succeeded = succeeded;
        self.records_failed = failed;
        self.completed_at = Some(at);
    }

    /// Finalizes as failed with the given error.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.status = SyncLogStatus::Failed;
        self.error = Some(ErrorSnapshot::new(message, at));
        self.completed_at = Some(at);
    }

    /// True once `complete` or `fail` has run.
    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Unique identifier, sent as `X-Webhook-Event-ID`.
    pub id: WebhookEventId,
    /// Owning config.
    pub integration_config_id: IntegrationConfigId,
    /// Event name, sent as `X-Webhook-Event-Type`.
    pub event_type: String,
    /// JSON body.
    pub payload: Value,
    /// Delivery state.
    pub status: WebhookEventStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Earliest time the sweep may retry.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When delivery succeeded.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Last delivery failure.
    pub error: Option<ErrorSnapshot>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Queues a new pending event.
    pub fn new(
        integration_config_id: IntegrationConfigId,
        event_type: impl Into<String>,
        payload: Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            integration_config_id,
            event_type: event_type.into(),
            payload,
            status: WebhookEventStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            delivered_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True for `delivered` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WebhookEventStatus::Delivered | WebhookEventStatus::Failed)
    }

    /// True while another attempt fits in the budget.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integration_type_round_trips_through_tag() {
        for ty in IntegrationType::ALL {
            assert_eq!(ty.as_str().parse::<IntegrationType>().unwrap(), ty);
        }
        assert!("sap".parse::<IntegrationType>().is_err());
    }

    #[test]
    fn integration_type_serializes_as_snake_case() {
        assert_eq!(serde_json::to_value(IntegrationType::TylerMunis).unwrap(), json!("tyler_munis"));
        assert_eq!(serde_json::to_value(IntegrationType::WiDhs).unwrap(), json!("wi_dhs"));
    }

    #[test]
    fn credentials_debug_hides_values() {
        let creds: Credentials = [("clientSecret", "hunter2")].into_iter().collect();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("clientSecret"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn empty_credential_values_are_absent() {
        let creds: Credentials = [("apiKey", "")].into_iter().collect();
        assert_eq!(creds.get("apiKey"), None);
        assert!(creds.is_empty());
    }

    #[test]
    fn metadata_accessors_accept_numbers_and_strings() {
        let mut config = IntegrationConfig::new("x", IntegrationType::Epic, "https://e", Utc::now());
        config.metadata.insert("batchSize".into(), json!(25));
        config.metadata.insert("maxPages".into(), json!("4"));
        config.metadata.insert("webhookHeaders".into(), json!({"X-Tenant": "a", "X-Bad": 1}));

        assert_eq!(config.metadata_u64("batchSize"), Some(25));
        assert_eq!(config.metadata_u64("maxPages"), Some(4));
        assert_eq!(config.webhook_headers(), vec![("X-Tenant".to_string(), "a".to_string())]);
    }

    #[test]
    fn sync_log_partial_when_records_fail() {
        let now = Utc::now();
        let mut log = SyncLog::start(IntegrationConfigId::new(), SyncType::Full, now);
        assert!(!log.is_finalized());

        log.complete(10, 8, 2, now);
        assert_eq!(log.status, SyncLogStatus::Partial);
        assert!(log.is_finalized());
    }

    #[test]
    fn webhook_event_starts_pending_with_no_attempts() {
        let event = WebhookEvent::new(
            IntegrationConfigId::new(),
            "integration.sync.completed",
            json!({}),
            DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            Utc::now(),
        );
        assert_eq!(event.status, WebhookEventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert!(event.has_attempts_remaining());
        assert!(!event.is_terminal());
    }

    #[test]
    fn config_serializes_type_field_name() {
        let config = IntegrationConfig::new("x", IntegrationType::Hl7, "mllp://h", Utc::now());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], json!("hl7"));
        assert_eq!(value["syncStatus"], json!("idle"));
    }
}
