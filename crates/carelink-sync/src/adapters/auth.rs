//! OAuth2 client-credentials token acquisition and caching.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use carelink_core::{Clock, IntegrationConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{IntegrationError, Result};

/// Tokens are refreshed when they expire within this margin.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds; defaults to one hour when absent.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Adapter-instance token cache.
///
/// Holds at most one token. Refreshes are serialized so concurrent callers
/// never request two tokens at once.
#[derive(Debug)]
pub struct TokenCache {
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// Creates an empty cache.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, slot: Mutex::new(None) }
    }

    /// Returns the cached token, calling `fetch` when it is absent or within
    /// [`TOKEN_EXPIRY_MARGIN`] of expiry.
    ///
    /// # Errors
    ///
    /// Returns whatever `fetch` returns.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenGrant>>,
    {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        if let Some(token) = slot.as_ref() {
            if now + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        debug!("access token absent or near expiry, authenticating");
        let grant = fetch().await?;
        let lifetime = Duration::from_secs(grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        let token = CachedToken { value: grant.access_token, expires_at: now + lifetime };
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    /// Drops the cached token.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// True when a token is cached and outside the refresh margin.
    pub async fn has_valid_token(&self) -> bool {
        let now = self.clock.now();
        self.slot.lock().await.as_ref().is_some_and(|t| now + TOKEN_EXPIRY_MARGIN < t.expires_at)
    }
}

/// Body encoding of the token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRequestFormat {
    /// `application/x-www-form-urlencoded`.
    Form,
    /// `application/json`.
    Json,
}

/// Client-credentials request parameters.
#[derive(Debug, Clone)]
pub struct ClientCredentialsRequest<'a> {
    /// Token endpoint.
    pub token_url: String,
    /// OAuth scope, if any.
    pub scope: Option<&'a str>,
    /// Body encoding.
    pub format: TokenRequestFormat,
    /// Label used in error messages.
    pub vendor: &'a str,
}

/// Performs the client-credentials grant using `clientId`/`clientSecret`
/// from the config's credentials.
///
/// # Errors
///
/// Returns `Authentication` when credentials are missing, the endpoint
/// rejects them or the response has no token; `Network`/`Timeout` for
/// transport failures.
pub async fn fetch_client_credentials(
    http: &reqwest::Client,
    config: &IntegrationConfig,
    request: ClientCredentialsRequest<'_>,
    timeout: Duration,
) -> Result<TokenGrant> {
    let (Some(client_id), Some(client_secret)) =
        (config.credentials.get("clientId"), config.credentials.get("clientSecret"))
    else {
        return Err(IntegrationError::authentication(format!(
            "{} credentials must include clientId and clientSecret",
            request.vendor
        )));
    };

    let builder = http.post(&request.token_url);
    let builder = match request.format {
        TokenRequestFormat::Form => {
            let mut form = vec![
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ];
            if let Some(scope) = request.scope {
                form.push(("scope", scope));
            }
            builder.form(&form)
        },
        TokenRequestFormat::Json => {
            let mut body = json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "client_secret": client_secret,
            });
            if let Some(scope) = request.scope {
                body["scope"] = json!(scope);
            }
            builder.json(&body)
        },
    };

    let response = builder.send().await.map_err(|e| IntegrationError::from_http(&e, timeout))?;
    let status = response.status();
    if !status.is_success() {
        return Err(IntegrationError::authentication(format!(
            "{} token request rejected: HTTP {}",
            request.vendor,
            status.as_u16()
        )));
    }

    let grant: TokenGrant = response.json().await.map_err(|e| {
        IntegrationError::authentication(format!("{} token response invalid: {e}", request.vendor))
    })?;
    if grant.access_token.is_empty() {
        return Err(IntegrationError::authentication(format!(
            "{} token response has empty access_token",
            request.vendor
        )));
    }
    Ok(grant)
}
