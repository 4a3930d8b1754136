//! Builders for integration configs with sensible test defaults.

use carelink_core::{
    models::metadata_keys, BackoffStrategy, IntegrationConfig, IntegrationType, RetryConfig,
    SyncStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Builder for [`IntegrationConfig`] fixtures.
///
/// Starts from an active, idle config with a unique name, no credentials and
/// default retry settings.
#[derive(Debug, Clone)]
pub struct IntegrationConfigBuilder {
    config: IntegrationConfig,
}

impl IntegrationConfigBuilder {
    /// Creates a builder for the given type and endpoint.
    pub fn new(
        integration_type: IntegrationType,
        endpoint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = format!("{integration_type}-{}", Uuid::new_v4().simple());
        Self { config: IntegrationConfig::new(name, integration_type, endpoint, now) }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Adds one credential entry.
    #[must_use]
    pub fn credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.credentials.0.insert(key.into(), value.into());
        self
    }

    /// Adds OAuth2 client credentials.
    #[must_use]
    pub fn oauth_client(self, client_id: &str, client_secret: &str) -> Self {
        self.credential("clientId", client_id).credential("clientSecret", client_secret)
    }

    /// Adds a static API key.
    #[must_use]
    pub fn api_key(self, key: &str) -> Self {
        self.credential("apiKey", key)
    }

    /// Sets one metadata value.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    /// Switches the config off.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.config.is_active = false;
        self
    }

    /// Sets the schedule expression.
    #[must_use]
    pub fn sync_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.config.sync_frequency = Some(frequency.into());
        self
    }

    /// Sets the time of the last successful sync.
    #[must_use]
    pub fn last_sync_at(mut self, at: DateTime<Utc>) -> Self {
        self.config.last_sync_at = Some(at);
        self
    }

    /// Forces the sync status.
    #[must_use]
    pub fn status(mut self, status: SyncStatus) -> Self {
        self.config.sync_status = status;
        self
    }

    /// Sets the outbound webhook URL.
    #[must_use]
    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.config.webhook_url = Some(url.into());
        self
    }

    /// Sets the webhook signing secret.
    #[must_use]
    pub fn webhook_secret(self, secret: &str) -> Self {
        self.metadata(metadata_keys::WEBHOOK_SECRET, secret)
    }

    /// Sets explicit retry settings.
    #[must_use]
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry_config = Some(retry);
        self
    }

    /// Limits every outbound call to a single attempt.
    #[must_use]
    pub fn no_retries(self) -> Self {
        self.retry_config(RetryConfig { max_retries: 0, ..RetryConfig::default() })
    }

    /// Retries up to `max_retries` times with short fixed delays.
    #[must_use]
    pub fn fast_retries(self, max_retries: u32) -> Self {
        self.retry_config(RetryConfig {
            max_retries,
            backoff_strategy: BackoffStrategy::Fixed,
            initial_delay_ms: 10,
            max_delay_ms: 10,
        })
    }

    /// Returns the config.
    pub fn build(self) -> IntegrationConfig {
        self.config
    }
}
