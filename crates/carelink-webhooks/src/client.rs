//! HTTP client for webhook delivery.
//!
//! Builds the signed POST, bounds it with the delivery timeout and maps the
//! outcome onto [`WebhookError`] so the dispatcher can record it.

use std::time::{Duration, Instant};

use bytes::Bytes;
use carelink_core::WebhookEventId;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{Result, WebhookError},
    signature::SIGNATURE_HEADER,
};

/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";
/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-ID";

const MAX_BODY_EXCERPT: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bound on each delivery request.
    pub timeout: Duration,
    /// User agent sent with every delivery.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), user_agent: "carelink-webhooks/1.0".to_string() }
    }
}

/// One delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Event being delivered.
    pub event_id: WebhookEventId,
    /// Event type header value.
    pub event_type: String,
    /// Destination.
    pub url: String,
    /// Raw JSON body.
    pub body: Bytes,
    /// Hex HMAC of `body`, when the config has a secret.
    pub signature: Option<String>,
    /// Extra headers from config metadata.
    pub headers: Vec<(String, String)>,
    /// One-based attempt number, for logs.
    pub attempt: u32,
}

/// Receiver's answer to a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status.
    pub status_code: u16,
    /// Body excerpt.
    pub body: String,
    /// Round-trip time.
    pub duration: Duration,
}

/// Delivers webhook requests over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| WebhookError::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a client with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// POSTs the request body.
    ///
    /// # Errors
    ///
    /// - `Delivery` for any non-2xx response
    /// - `Timeout` when the receiver does not answer in time
    /// - `Network` for connection failures
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            let started = Instant::now();
            let mut http_request = self.client.post(&request.url);
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key.as_str(), value.as_str());
                }
            }
            http_request = http_request
                .header(header::CONTENT_TYPE, "application/json")
                .header(EVENT_TYPE_HEADER, &request.event_type)
                .header(EVENT_ID_HEADER, request.event_id.to_string())
                .body(request.body.clone());
            if let Some(signature) = &request.signature {
                http_request = http_request.header(SIGNATURE_HEADER, signature);
            }

            let response = http_request.send().await.map_err(|e| {
                warn!(error = %e, "webhook request failed");
                if e.is_timeout() {
                    WebhookError::timeout(self.config.timeout.as_secs())
                } else if e.is_connect() {
                    WebhookError::network(format!("connection failed: {e}"))
                } else {
                    WebhookError::network(e.to_string())
                }
            })?;

            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let body = match response.bytes().await {
                Ok(bytes) => excerpt(&bytes),
                Err(e) => format!("[failed to read response body: {e}]"),
            };
            let duration = started.elapsed();
            debug!(status = status_code, duration_ms = duration.as_millis(), "received response");

            if !is_success {
                warn!(status = status_code, "webhook receiver rejected delivery");
                return Err(WebhookError::delivery(status_code, body));
            }
            info!(status = status_code, "webhook delivered");
            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

fn excerpt(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_BODY_EXCERPT {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_BODY_EXCERPT]))
}

/// Headers the client sets itself; metadata cannot override them.
fn is_managed_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-type"
            | "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "transfer-encoding"
            | "x-webhook-event-type"
            | "x-webhook-event-id"
            | "x-webhook-signature"
    )
}
