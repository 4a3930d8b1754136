//! HL7 v2 adapter speaking MLLP over TCP.
//!
//! MLLP wraps each message in a start block byte and an end block plus
//! carriage return:
//!
//! ```text
//! 0x0B <HL7 message, segments separated by \r> 0x1C 0x0D
//! ```
//!
//! Every call opens its own connection. Connecting is bounded by the connect
//! timeout; every read or write after that by the send timeout.

use std::time::Duration;

use async_trait::async_trait;
use carelink_core::{models::metadata_keys, IntegrationConfig, IntegrationType};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{require_endpoint, AdapterSettings, IntegrationAdapter, SyncResult};
use crate::error::{IntegrationError, Result};

/// MLLP start-of-block.
pub const START_BLOCK: u8 = 0x0B;
/// MLLP end-of-block.
pub const END_BLOCK: u8 = 0x1C;
/// Carriage return terminating a frame.
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Largest partial frame the decoder buffers before giving up on the peer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Port used when the endpoint names none.
pub const DEFAULT_MLLP_PORT: u16 = 2575;

/// Message families the platform recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hl7MessageType {
    /// Admit, discharge, transfer.
    Adt,
    /// Observation result.
    Oru,
    /// Medical document management.
    Mdm,
    /// Scheduling information.
    Siu,
}

impl Hl7MessageType {
    /// Parses the MSH-9.1 code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ADT" => Some(Self::Adt),
            "ORU" => Some(Self::Oru),
            "MDM" => Some(Self::Mdm),
            "SIU" => Some(Self::Siu),
            _ => None,
        }
    }
}

/// Header fields pulled from an HL7 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// MSH-9 component 1, e.g. `ADT`.
    pub message_type: String,
    /// MSH-10.
    pub control_id: String,
    /// Number of segments.
    pub segment_count: usize,
}

/// Wraps a message in an MLLP frame.
pub fn frame(message: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(message.len() + 3);
    framed.push(START_BLOCK);
    framed.extend_from_slice(message.as_bytes());
    framed.push(END_BLOCK);
    framed.push(CARRIAGE_RETURN);
    framed
}

/// Splits complete MLLP frames out of a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Appends received bytes.
    ///
    /// Bytes before the first start block are dropped, so the buffer only
    /// ever holds frames or a frame in progress.
    ///
    /// # Errors
    ///
    /// Returns `Adapter` and resets the buffer once more than
    /// [`MAX_FRAME_BYTES`] are pending.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        match self.buffer.iter().position(|b| *b == START_BLOCK) {
            Some(0) => {},
            Some(start) => {
                self.buffer.drain(..start);
            },
            None => self.buffer.clear(),
        }
        if self.buffer.len() > MAX_FRAME_BYTES {
            self.buffer.clear();
            return Err(IntegrationError::adapter(format!(
                "MLLP frame exceeds {MAX_FRAME_BYTES} bytes"
            )));
        }
        Ok(())
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete message, if any.
    ///
    /// Bytes before a start block are discarded.
    pub fn next_frame(&mut self) -> Option<String> {
        let start = self.buffer.iter().position(|b| *b == START_BLOCK)?;
        let end = self.buffer[start..]
            .windows(2)
            .position(|w| w == [END_BLOCK, CARRIAGE_RETURN])
            .map(|offset| start + offset)?;
        let message = String::from_utf8_lossy(&self.buffer[start + 1..end]).into_owned();
        self.buffer.drain(..end + 2);
        Some(message)
    }
}

/// Extracts the header fields of an HL7 v2 message.
///
/// # Errors
///
/// Returns `Adapter` when the message does not start with an MSH segment.
pub fn parse_message(message: &str) -> Result<ParsedMessage> {
    let segments: Vec<&str> =
        message.split(['\r', '\n']).map(str::trim).filter(|s| !s.is_empty()).collect();
    let msh = segments
        .first()
        .filter(|s| s.starts_with("MSH"))
        .ok_or_else(|| IntegrationError::adapter("HL7 message has no MSH segment"))?;
    let fields: Vec<&str> = msh.split('|').collect();
    let message_type = fields
        .get(8)
        .and_then(|f| f.split('^').next())
        .filter(|t| !t.is_empty())
        .unwrap_or("UNKNOWN")
        .to_string();
    let control_id = fields.get(9).copied().unwrap_or_default().to_string();

    Ok(ParsedMessage { message_type, control_id, segment_count: segments.len() })
}

/// Splits an endpoint such as `mllp://host:2575` into host and port.
///
/// # Errors
///
/// Returns `Configuration` when no host can be parsed.
pub fn endpoint_address(endpoint: &str) -> Result<(String, u16)> {
    let trimmed = endpoint.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("mllp://{trimmed}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| {
        IntegrationError::configuration(format!("invalid MLLP endpoint '{endpoint}': {e}"))
    })?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| IntegrationError::configuration(format!("MLLP endpoint '{endpoint}' has no host")))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MLLP_PORT)))
}

/// Adapter for HL7 v2 peers.
#[derive(Debug, Clone)]
pub struct Hl7Adapter {
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl Hl7Adapter {
    /// Creates an HL7 adapter using the MLLP timeouts from `settings`.
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            connect_timeout: settings.hl7_connect_timeout,
            send_timeout: settings.hl7_send_timeout,
        }
    }

    async fn connect(&self, config: &IntegrationConfig) -> Result<TcpStream> {
        let (host, port) = endpoint_address(&config.endpoint)?;
        debug!(%host, port, "opening MLLP connection");
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(IntegrationError::network(format!("MLLP connect to {host}:{port} failed: {e}"))),
            Err(_) => Err(IntegrationError::timeout(self.connect_timeout)),
        }
    }

    async fn write_frame(&self, stream: &mut TcpStream, message: &str) -> Result<()> {
        let framed = frame(message);
        match tokio::time::timeout(self.send_timeout, stream.write_all(&framed)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(IntegrationError::network(format!("MLLP write failed: {e}"))),
            Err(_) => Err(IntegrationError::timeout(self.send_timeout)),
        }
    }

    /// Sends one message and waits for the framed acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns `Network` when the connection fails or closes before an ACK,
    /// `Timeout` when the peer does not answer within the send timeout.
    pub async fn send_message(&self, config: &IntegrationConfig, message: &str) -> Result<String> {
        self.validate_config(config)?;
        let mut stream = self.connect(config).await?;
        self.write_frame(&mut stream, message).await?;

        let mut decoder = FrameDecoder::default();
        let mut buf = [0_u8; 4096];
        loop {
            if let Some(ack) = decoder.next_frame() {
                return Ok(ack);
            }
            match tokio::time::timeout(self.send_timeout, stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(IntegrationError::network(
                        "MLLP peer closed connection before acknowledgment",
                    ))
                },
                Ok(Ok(n)) => decoder.push(&buf[..n])?,
                Ok(Err(e)) => return Err(IntegrationError::network(format!("MLLP read failed: {e}"))),
                Err(_) => return Err(IntegrationError::timeout(self.send_timeout)),
            }
        }
    }

    /// Collects framed messages until the peer closes or goes quiet for the
    /// send timeout.
    async fn receive_messages(&self, config: &IntegrationConfig) -> Result<Vec<String>> {
        let mut stream = self.connect(config).await?;
        if let Some(query) = config.metadata_str(metadata_keys::QUERY_MESSAGE) {
            self.write_frame(&mut stream, query).await?;
        }

        let mut decoder = FrameDecoder::default();
        let mut messages = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            match tokio::time::timeout(self.send_timeout, stream.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    decoder.push(&buf[..n])?;
                    while let Some(message) = decoder.next_frame() {
                        messages.push(message);
                    }
                },
                Ok(Err(e)) => return Err(IntegrationError::network(format!("MLLP read failed: {e}"))),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl IntegrationAdapter for Hl7Adapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Hl7
    }

    fn validate_config(&self, config: &IntegrationConfig) -> Result<()> {
        require_endpoint(config)?;
        endpoint_address(&config.endpoint).map(|_| ())
    }

    async fn sync(&self, config: &IntegrationConfig) -> Result<SyncResult> {
        self.validate_config(config)?;
        let expected = config.metadata_str(metadata_keys::MESSAGE_TYPE);
        let messages = self.receive_messages(config).await?;

        let mut failed = 0;
        let summaries: Vec<Value> = messages
            .iter()
            .map(|message| match parse_message(message) {
                Ok(parsed) => {
                    if expected.is_some_and(|t| t != parsed.message_type) {
                        debug!(
                            message_type = %parsed.message_type,
                            "received HL7 message of unexpected type"
                        );
                    }
                    json!({
                        "type": parsed.message_type,
                        "controlId": parsed.control_id,
                        "known": Hl7MessageType::from_code(&parsed.message_type).is_some(),
                        "status": "processed",
                    })
                },
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "failed to parse HL7 message");
                    json!({"status": "error", "error": e.to_string()})
                },
            })
            .collect();

        info!(messages = summaries.len(), failed, "HL7 sync received messages");
        Ok(SyncResult::with_failures("HL7 sync completed", summaries, failed))
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> bool {
        if let Err(e) = self.validate_config(config) {
            warn!(error = %e, "HL7 connection test rejected config");
            return false;
        }
        match self.connect(config).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "HL7 connection test failed");
                false
            },
        }
    }
}
