//! EDI X12 clearinghouse adapter.

use async_trait::async_trait;
use carelink_core::{models::metadata_keys, IntegrationConfig, IntegrationType};
use reqwest::{header, Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    build_http_client, join_url, require_endpoint, status_error, AdapterSettings,
    IntegrationAdapter, SyncResult,
};
use crate::error::{IntegrationError, Result};

/// X12 media type.
pub const EDI_X12: &str = "application/edi-x12";

/// Transaction sets the clearinghouse exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdiTransactionType {
    /// 837 health care claim.
    Claim837,
    /// 835 claim payment advice.
    Payment835,
    /// 270 eligibility inquiry.
    Eligibility270,
    /// 271 eligibility response.
    Eligibility271,
    /// 997 functional acknowledgment.
    Acknowledgment997,
    /// 999 implementation acknowledgment.
    Acknowledgment999,
}

impl EdiTransactionType {
    /// Transaction set identifier code (ST01).
    pub fn code(self) -> &'static str {
        match self {
            Self::Claim837 => "837",
            Self::Payment835 => "835",
            Self::Eligibility270 => "270",
            Self::Eligibility271 => "271",
            Self::Acknowledgment997 => "997",
            Self::Acknowledgment999 => "999",
        }
    }

    /// Parses an ST01 code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "837" => Some(Self::Claim837),
            "835" => Some(Self::Payment835),
            "270" => Some(Self::Eligibility270),
            "271" => Some(Self::Eligibility271),
            "997" => Some(Self::Acknowledgment997),
            "999" => Some(Self::Acknowledgment999),
            _ => None,
        }
    }
}

/// ST header of one X12 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X12Transaction {
    /// ST01.
    pub transaction_type: String,
    /// ST02.
    pub control_number: String,
    /// Number of segments.
    pub segment_count: usize,
}

/// Splits X12 text into interchanges, each ending at an `IEA` trailer.
///
/// Trailing segments without a trailer form a final interchange.
pub fn split_interchanges(text: &str) -> Vec<String> {
    let mut interchanges = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for segment in text.split('~').map(str::trim).filter(|s| !s.is_empty()) {
        current.push(segment);
        if segment == "IEA" || segment.starts_with("IEA*") {
            interchanges.push(format!("{}~", current.join("~")));
            current.clear();
        }
    }
    if !current.is_empty() {
        interchanges.push(format!("{}~", current.join("~")));
    }
    interchanges
}

/// Reads the ST segment of a transaction.
///
/// # Errors
///
/// Returns `Adapter` when no ST segment is present.
pub fn parse_transaction(text: &str) -> Result<X12Transaction> {
    let segments: Vec<&str> = text.split('~').map(str::trim).filter(|s| !s.is_empty()).collect();
    let st = segments
        .iter()
        .find(|s| s.starts_with("ST*"))
        .ok_or_else(|| IntegrationError::adapter("X12 transaction has no ST segment"))?;
    let elements: Vec<&str> = st.split('*').collect();
    let transaction_type =
        elements.get(1).copied().filter(|e| !e.is_empty()).unwrap_or("UNKNOWN").to_string();
    let control_number = elements.get(2).copied().unwrap_or_default().to_string();

    Ok(X12Transaction { transaction_type, control_number, segment_count: segments.len() })
}

/// Decodes the `/transactions` body: a JSON array of X12 strings or raw X12.
fn transactions_from_body(body: &str) -> Result<Vec<String>> {
    let trimmed = body.trim();
    if trimmed.starts_with('[') {
        let items: Vec<String> = serde_json::from_str(trimmed).map_err(|e| {
            IntegrationError::adapter(format!("EDI transaction list is not an array of strings: {e}"))
        })?;
        return Ok(items);
    }
    Ok(split_interchanges(trimmed))
}

enum EdiAuth<'a> {
    ApiKey(&'a str),
    Basic { username: &'a str, password: &'a str },
}

impl<'a> EdiAuth<'a> {
    fn from_config(config: &'a IntegrationConfig) -> Result<Self> {
        if let Some(key) = config.credentials.get("apiKey") {
            return Ok(Self::ApiKey(key));
        }
        match (config.credentials.get("username"), config.credentials.get("password")) {
            (Some(username), Some(password)) => Ok(Self::Basic { username, password }),
            _ => Err(IntegrationError::configuration(
                "EDI credentials must include apiKey or username/password",
            )),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => request.header("X-API-Key", *key),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

/// Adapter for X12 clearinghouses.
#[derive(Debug)]
pub struct EdiAdapter {
    http: reqwest::Client,
    settings: AdapterSettings,
}

impl EdiAdapter {
    /// Creates an EDI adapter.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(settings: &AdapterSettings) -> Result<Self> {
        Ok(Self { http: build_http_client(settings)?, settings: settings.clone() })
    }

    async fn send(
        &self,
        config: &IntegrationConfig,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<String>,
    ) -> Result<String> {
        let auth = EdiAuth::from_config(config)?;
        let mut request = auth
            .apply(self.http.request(method, join_url(&config.endpoint, path)))
            .header(header::CONTENT_TYPE, EDI_X12);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::from_http(&e, self.settings.request_timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("EDI", path, status));
        }
        response.text().await.map_err(|e| IntegrationError::from_http(&e, self.settings.request_timeout))
    }

    /// Submits one X12 interchange and returns the clearinghouse transaction
    /// id.
    ///
    /// # Errors
    ///
    /// Returns `Adapter` when the response carries no `transactionId`, plus
    /// the usual transport and auth errors.
    pub async fn submit_transaction(
        &self,
        config: &IntegrationConfig,
        transaction_type: EdiTransactionType,
        x12: &str,
    ) -> Result<String> {
        self.validate_config(config)?;
        let body = self
            .send(
                config,
                Method::POST,
                "/transactions",
                &[("type", transaction_type.code())],
                Some(x12.to_string()),
            )
            .await?;
        let response: Value = serde_json::from_str(&body)
            .map_err(|e| IntegrationError::adapter(format!("EDI submit response invalid: {e}")))?;
        let id = response
            .get("transactionId")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::adapter("EDI submit response has no transactionId"))?;
        info!(transaction_type = transaction_type.code(), transaction_id = id, "EDI transaction submitted");
        Ok(id.to_string())
    }

    /// Fetches the acknowledgment for a submitted transaction.
    ///
    /// # Errors
    ///
    /// Returns `Adapter` when the response is not JSON, plus the usual
    /// transport and auth errors.
    pub async fn check_acknowledgment(
        &self,
        config: &IntegrationConfig,
        transaction_id: &str,
    ) -> Result<Value> {
        self.validate_config(config)?;
        let body = self
            .send(config, Method::GET, &format!("/acknowledgments/{transaction_id}"), &[], None)
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| IntegrationError::adapter(format!("EDI acknowledgment invalid: {e}")))
    }
}

#[async_trait]
impl IntegrationAdapter for EdiAdapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Edi
    }

    fn validate_config(&self, config: &IntegrationConfig) -> Result<()> {
        require_endpoint(config)?;
        EdiAuth::from_config(config).map(|_| ())
    }

    async fn sync(&self, config: &IntegrationConfig) -> Result<SyncResult> {
        self.validate_config(config)?;
        let transaction_type = config
            .metadata_str(metadata_keys::TRANSACTION_TYPE)
            .unwrap_or(EdiTransactionType::Claim837.code());
        if EdiTransactionType::from_code(transaction_type).is_none() {
            warn!(transaction_type, "requesting unrecognised EDI transaction set");
        }

        let body = self
            .send(config, Method::GET, "/transactions", &[("type", transaction_type)], None)
            .await?;
        let transactions = transactions_from_body(&body)?;

        let mut failed = 0;
        let summaries: Vec<Value> = transactions
            .iter()
            .map(|text| match parse_transaction(text) {
                Ok(parsed) => json!({
                    "transactionType": parsed.transaction_type,
                    "controlNumber": parsed.control_number,
                    "status": "processed",
                }),
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "failed to process EDI transaction");
                    json!({"status": "error", "error": e.to_string()})
                },
            })
            .collect();

        info!(transaction_type, transactions = summaries.len(), failed, "EDI sync completed");
        Ok(SyncResult::with_failures("EDI sync completed", summaries, failed))
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> bool {
        if let Err(e) = self.validate_config(config) {
            warn!(error = %e, "EDI connection test rejected config");
            return false;
        }
        match self.send(config, Method::GET, "/health", &[], None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "EDI connection test failed");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    const CLAIM: &str = "ISA*00*          *00*          *ZZ*SENDER*ZZ*RECEIVER*240101*1200*^*00501*000000001*0*P*:~\
GS*HC*SENDER*RECEIVER*20240101*1200*1*X*005010X222A1~ST*837*0001*005010X222A1~BHT*0019*00*1~\
SE*3*0001~GE*1*1~IEA*1*000000001~";

    #[test]
    fn parses_st_header() {
        let parsed = parse_transaction(CLAIM).unwrap();
        assert_eq!(parsed.transaction_type, "837");
        assert_eq!(parsed.control_number, "0001");
        assert_eq!(parsed.segment_count, 7);
    }

    #[test]
    fn transaction_without_st_is_rejected() {
        assert!(parse_transaction("ISA*00~IEA*1~").is_err());
    }

    #[test]
    fn interchanges_split_on_iea() {
        let text = format!("{CLAIM}{}", CLAIM.replace("ST*837*0001", "ST*835*0002"));
        let parts = split_interchanges(&text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parse_transaction(&parts[1]).unwrap().transaction_type, "835");
    }

    #[test]
    fn body_accepts_json_array() {
        let body = serde_json::to_string(&vec![CLAIM, "garbage"]).unwrap();
        let items = transactions_from_body(&body).unwrap();
        assert_eq!(items.len(), 2);
        assert!(parse_transaction(&items[1]).is_err());
    }

    #[test]
    fn credentials_require_api_key_or_basic_pair() {
        let adapter = EdiAdapter::new(&AdapterSettings::default()).unwrap();
        let mut config = IntegrationConfig::new("edi", IntegrationType::Edi, "https://edi", Utc::now());
        assert!(matches!(
            adapter.validate_config(&config),
            Err(IntegrationError::Configuration { .. })
        ));

        config.credentials.0.insert("username".into(), "u".into());
        assert!(adapter.validate_config(&config).is_err());
        config.credentials.0.insert("password".into(), "p".into());
        assert!(adapter.validate_config(&config).is_ok());
    }

    #[test]
    fn transaction_codes_round_trip() {
        for code in ["837", "835", "270", "271", "997", "999"] {
            assert_eq!(EdiTransactionType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(EdiTransactionType::from_code("850"), None);
    }
}
