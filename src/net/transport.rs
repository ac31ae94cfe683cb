//! # Secure Transport
//!
//! Executes exactly one HTTP request described by a
//! [`TransportRequirements`]. The contract that makes DNS rebinding
//! impossible between guard and connect:
//!
//! - The TCP connection goes to `connect_to_ip:port`, never to a hostname:
//!   the client's resolver is overridden to map the hostname to the
//!   validated address.
//! - SNI and the `Host:` header carry `hostname`, so virtual hosting and
//!   certificate verification behave normally.
//! - The body is streamed and capped at `max_response_bytes`; overflow
//!   tears the connection down.
//! - Connect, read, and total deadlines are independent.
//! - When pins are configured, the negotiated leaf certificate's SPKI
//!   digest must match one of them before any body byte is surfaced.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use super::pin::{check_pins, PinCheck};
use super::ssrf::TransportRequirements;
use crate::config::{FetchConfig, PinMode};
use crate::error::CoreError;

// ============================================================================
// Request / response / errors
// ============================================================================

/// The caller-shaped half of a request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: reqwest::Method,
    /// Extra headers, applied after the standard ones.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Caller-level deadline; past it the request is cancelled rather than
    /// timed out, and the redirect guard propagates it across hops.
    pub deadline: Option<Instant>,
}

impl Default for OutboundRequest {
    fn default() -> Self {
        Self {
            method: reqwest::Method::GET,
            headers: Vec::new(),
            body: None,
            deadline: None,
        }
    }
}

impl OutboundRequest {
    /// Plain GET.
    pub fn get() -> Self {
        Self::default()
    }

    /// POST with a body.
    pub fn post(body: Vec<u8>) -> Self {
        Self {
            method: reqwest::Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Bounded response handed back to callers.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers (first value per name).
    pub headers: HashMap<String, String>,
    /// Body, within the byte cap.
    pub body: Vec<u8>,
    /// Wall-clock cost of the request.
    pub timing_ms: u64,
    /// The URL that was actually requested.
    pub final_url: String,
}

impl TransportResponse {
    /// Whether the status is a 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A redirect target, when the response is a 3xx with `Location`.
    pub fn redirect_location(&self) -> Option<&str> {
        if (300..400).contains(&self.status) {
            self.headers.get("location").map(|s| s.as_str())
        } else {
            None
        }
    }
}

/// Transport-stage failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP or TLS could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A stage deadline was exceeded.
    #[error("timeout during {stage}")]
    Timeout {
        /// connect, read, or total.
        stage: &'static str,
    },

    /// The caller's deadline expired.
    #[error("request cancelled")]
    Cancelled,

    /// The body exceeded the configured cap.
    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// The cap that was hit.
        limit: u64,
    },

    /// Pins are configured and the presented certificate does not match.
    #[error("certificate pin mismatch")]
    PinMismatch {
        /// SPKI digest presented by the server, when extractable.
        presented: Option<String>,
    },

    /// Anything else the HTTP stack reported.
    #[error("request failed: {0}")]
    Request(String),
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(msg) => CoreError::BackendUnavailable(msg),
            TransportError::Timeout { stage } => CoreError::Timeout { stage },
            TransportError::Cancelled => CoreError::Cancelled,
            TransportError::ResponseTooLarge { limit } => CoreError::TooLarge {
                what: "response body",
                limit,
            },
            TransportError::PinMismatch { presented } => CoreError::PolicyDenied {
                reason: "PIN_MISMATCH".to_string(),
                detail: presented,
            },
            TransportError::Request(msg) => CoreError::BackendUnavailable(msg),
        }
    }
}

/// Object-safe transport seam; the delivery engine, verification executor,
/// and redirect guard all speak this trait so tests can script responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform exactly one request.
    async fn execute(
        &self,
        requirements: &TransportRequirements,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError>;
}

// ============================================================================
// Implementation
// ============================================================================

/// Production transport.
pub struct SecureTransport {
    validate_certs: bool,
    user_agent: String,
    pin_mode: PinMode,
}

impl SecureTransport {
    /// Build from the fetch configuration slice.
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            validate_certs: config.validate_certs,
            user_agent: config.user_agent.clone(),
            pin_mode: config.pin_mode,
        }
    }

    /// The URL the request line targets. The hostname stays in the URL
    /// (connection routing is overridden separately) so SNI, `Host:`, and
    /// certificate verification all see the real name.
    pub(crate) fn target_url(requirements: &TransportRequirements) -> String {
        let scheme = if requirements.use_tls { "https" } else { "http" };
        let default_port = if requirements.use_tls { 443 } else { 80 };
        let host = if requirements.connect_to_ip.is_ipv6()
            && requirements.hostname.contains(':')
        {
            format!("[{}]", requirements.hostname)
        } else {
            requirements.hostname.clone()
        };
        if requirements.port == default_port {
            format!("{}://{}{}", scheme, host, requirements.request_path)
        } else {
            format!(
                "{}://{}:{}{}",
                scheme, host, requirements.port, requirements.request_path
            )
        }
    }

    fn build_client(
        &self,
        requirements: &TransportRequirements,
    ) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder()
            .resolve(
                &requirements.hostname,
                SocketAddr::new(requirements.connect_to_ip, requirements.port),
            )
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_millis(requirements.connect_timeout_ms))
            .timeout(Duration::from_millis(requirements.total_timeout_ms))
            .user_agent(self.user_agent.clone());

        if !self.validate_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !requirements.certificate_pins.is_empty() {
            builder = builder.tls_info(true);
        }

        builder
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn verify_pins(
        &self,
        requirements: &TransportRequirements,
        response: &reqwest::Response,
    ) -> Result<(), TransportError> {
        if requirements.certificate_pins.is_empty() || !requirements.use_tls {
            return Ok(());
        }

        let presented = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(|der| check_pins(der, &requirements.certificate_pins));

        let outcome = match presented {
            Some(PinCheck::Matched) => return Ok(()),
            Some(PinCheck::Mismatched { presented }) => Some(presented),
            Some(PinCheck::Unparseable) | None => None,
        };

        match self.pin_mode {
            PinMode::Enforce => Err(TransportError::PinMismatch { presented: outcome }),
            PinMode::ReportOnly => {
                tracing::warn!(
                    hostname = %requirements.hostname,
                    presented = outcome.as_deref().unwrap_or("unknown"),
                    "certificate pin mismatch (report-only)"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HttpTransport for SecureTransport {
    async fn execute(
        &self,
        requirements: &TransportRequirements,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        if let Some(deadline) = request.deadline {
            if Instant::now() >= deadline {
                return Err(TransportError::Cancelled);
            }
        }

        let started = Instant::now();
        let client = self.build_client(requirements)?;
        let url = Self::target_url(requirements);

        let mut builder = client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let send = builder.send();
        let response = match request.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, send).await {
                    Ok(result) => result,
                    Err(_) => return Err(TransportError::Cancelled),
                }
            }
            None => send.await,
        }
        .map_err(classify_reqwest_error)?;

        self.verify_pins(requirements, &response)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        // Stream the body under the cap; one extra byte is enough to fail.
        let limit = requirements.max_response_bytes;
        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        let read_timeout = Duration::from_millis(requirements.read_timeout_ms);
        loop {
            let chunk = tokio::time::timeout(read_timeout, response.chunk())
                .await
                .map_err(|_| TransportError::Timeout { stage: "read" })?
                .map_err(classify_reqwest_error)?;
            let Some(chunk) = chunk else { break };
            if (body.len() + chunk.len()) as u64 > limit {
                // Take exactly up to the cap, then drop the connection.
                let room = (limit as usize).saturating_sub(body.len());
                body.extend_from_slice(&chunk[..room]);
                return Err(TransportError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(TransportResponse {
            status,
            headers,
            body,
            timing_ms: started.elapsed().as_millis() as u64,
            final_url: url,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout { stage: "total" }
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

// ============================================================================
// Scripted transport (tests and air-gapped runs)
// ============================================================================

/// Scripted [`HttpTransport`]: pops one canned response per call, repeating
/// the last, and records every executed requirement/request pair.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: parking_lot::Mutex<std::collections::VecDeque<Result<TransportResponse, String>>>,
    executed: parking_lot::Mutex<Vec<(TransportRequirements, OutboundRequest)>>,
}

impl ScriptedTransport {
    /// Empty script; calls fail until responses are pushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_response(&self, status: u16, body: &[u8]) {
        self.push(Ok(TransportResponse {
            status,
            headers: HashMap::new(),
            body: body.to_vec(),
            timing_ms: 1,
            final_url: String::new(),
        }))
    }

    /// Queue a redirect response.
    pub fn push_redirect(&self, status: u16, location: &str) {
        let mut headers = HashMap::new();
        headers.insert("location".to_string(), location.to_string());
        self.push(Ok(TransportResponse {
            status,
            headers,
            body: Vec::new(),
            timing_ms: 1,
            final_url: String::new(),
        }))
    }

    /// Queue a connect failure.
    pub fn push_error(&self, message: &str) {
        self.push(Err(message.to_string()));
    }

    fn push(&self, entry: Result<TransportResponse, String>) {
        self.responses.lock().push_back(entry);
    }

    /// Requirement/request pairs seen so far.
    pub fn executed(&self) -> Vec<(TransportRequirements, OutboundRequest)> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(
        &self,
        requirements: &TransportRequirements,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.executed
            .lock()
            .push((requirements.clone(), request.clone()));
        let mut responses = self.responses.lock();
        let entry = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match entry {
            Some(Ok(mut response)) => {
                if response.final_url.is_empty() {
                    response.final_url = SecureTransport::target_url(requirements);
                }
                Ok(response)
            }
            Some(Err(message)) => Err(TransportError::Connect(message)),
            None => Err(TransportError::Connect("no scripted response".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinMode;
    use crate::net::ssrf::PinModeField;

    fn requirements(use_tls: bool, port: u16) -> TransportRequirements {
        TransportRequirements {
            original_url: "http://public.test/".to_string(),
            connect_to_ip: "93.184.216.34".parse().unwrap(),
            port,
            use_tls,
            hostname: "public.test".to_string(),
            request_path: "/data?page=2".to_string(),
            max_response_bytes: 1024,
            connect_timeout_ms: 1000,
            read_timeout_ms: 1000,
            total_timeout_ms: 5000,
            allow_redirects: true,
            max_redirects: 3,
            certificate_pins: Vec::new(),
            pin_mode: PinModeField(PinMode::Enforce),
        }
    }

    #[test]
    fn target_url_keeps_hostname_for_sni_and_host() {
        assert_eq!(
            SecureTransport::target_url(&requirements(true, 443)),
            "https://public.test/data?page=2"
        );
        assert_eq!(
            SecureTransport::target_url(&requirements(false, 80)),
            "http://public.test/data?page=2"
        );
        assert_eq!(
            SecureTransport::target_url(&requirements(false, 8080)),
            "http://public.test:8080/data?page=2"
        );
    }

    #[test]
    fn response_helpers() {
        let mut headers = HashMap::new();
        headers.insert("location".to_string(), "https://next.test/".to_string());
        let redirect = TransportResponse {
            status: 302,
            headers,
            body: Vec::new(),
            timing_ms: 3,
            final_url: "http://public.test/".to_string(),
        };
        assert!(!redirect.is_success());
        assert_eq!(redirect.redirect_location(), Some("https://next.test/"));

        let ok = TransportResponse {
            status: 204,
            headers: HashMap::new(),
            body: Vec::new(),
            timing_ms: 3,
            final_url: String::new(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.redirect_location(), None);
    }

    #[tokio::test]
    async fn scripted_transport_pops_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_response(500, b"boom");
        transport.push_response(200, b"ok");

        let req = requirements(false, 80);
        let first = transport.execute(&req, OutboundRequest::get()).await.unwrap();
        assert_eq!(first.status, 500);
        let second = transport.execute(&req, OutboundRequest::get()).await.unwrap();
        assert_eq!(second.status, 200);
        // Last response repeats.
        let third = transport.execute(&req, OutboundRequest::get()).await.unwrap();
        assert_eq!(third.status, 200);
        assert_eq!(transport.executed().len(), 3);
    }

    #[test]
    fn errors_map_to_core_kinds() {
        use crate::error::ErrorKind;
        assert_eq!(
            CoreError::from(TransportError::ResponseTooLarge { limit: 10 }).kind(),
            ErrorKind::TooLarge
        );
        assert_eq!(
            CoreError::from(TransportError::Cancelled).kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            CoreError::from(TransportError::Timeout { stage: "read" }).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CoreError::from(TransportError::PinMismatch { presented: None }).kind(),
            ErrorKind::PolicyDenied
        );
    }
}
