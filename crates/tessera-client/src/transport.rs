//! HTTP transport to the pairing peer.
//!
//! Three calls: the pairing round trip (JSON), data messages (base64 text) and
//! streamed uploads (raw chunk-encrypted bytes).

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_stream::Stream;

use tessera_core::config::ServerConfig;

use crate::pairing::PairRole;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const VERSION_HEADER: &str = "x-mte-version";
pub const FIXED_LENGTH_HEADER: &str = "x-flen";

/// Protocol version advertised in [`VERSION_HEADER`].
pub const PROTOCOL_VERSION: &str = "1.0";

/// Transport failures, each with a stable [`code`](Self::code).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server returned no data")]
    NoData,

    #[error("Server is no longer paired (HTTP {0})")]
    ServerNoLongerPaired(u16),

    #[error("Unable to authenticate with server")]
    UnableToAuthenticate,

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Map a non-success HTTP status.
    pub const fn from_status(status: u16) -> Self {
        match status {
            400 | 500 => Self::ServerNoLongerPaired(status),
            401 => Self::UnableToAuthenticate,
            _ => Self::HttpStatus(status),
        }
    }

    pub fn code(&self) -> String {
        match self {
            Self::ConnectionFailed(_) => "ConnectionFailed".into(),
            Self::NoData => "NoData".into(),
            Self::ServerNoLongerPaired(_) => "ServerNoLongerPaired".into(),
            Self::UnableToAuthenticate => "UnableToAuthenticate".into(),
            Self::HttpStatus(status) => format!("HttpStatus:{status}"),
            Self::Malformed(_) => "ProtocolError".into(),
            Self::Config(_) => "Config".into(),
        }
    }

    /// Numeric status reported alongside [`code`](Self::code).
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::ConnectionFailed(_) => 503,
            Self::NoData | Self::Malformed(_) | Self::Config(_) => 550,
            Self::ServerNoLongerPaired(status) | Self::HttpStatus(status) => *status,
            Self::UnableToAuthenticate => 401,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

/// Body of the pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub personalization_string: String,
    pub public_key: String,
    pub pair_type: PairRole,
}

/// Body of the pairing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    pub public_key: String,
    /// Decimal milliseconds; becomes the engine nonce.
    pub timestamp: String,
}

impl PairResponse {
    pub fn timestamp_value(&self) -> Option<u64> {
        self.timestamp.trim().parse().ok()
    }
}

/// The three calls a client makes against its peer.
pub trait PeerTransport: Send + Sync + 'static {
    fn pair_one(
        &self,
        request: &PairRequest,
    ) -> impl Future<Output = Result<PairResponse, TransportError>> + Send;

    /// Send one base64 encoded message; returns the base64 encoded reply.
    fn send_data(
        &self,
        body: String,
        fixed_length: Option<usize>,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Stream an encrypted upload; returns the server's acknowledgement text.
    fn upload<S>(
        &self,
        name: &str,
        body: S,
    ) -> impl Future<Output = Result<String, TransportError>> + Send
    where
        S: Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static;
}

/// reqwest-backed [`PeerTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    pair_route: String,
    send_route: String,
    upload_route: String,
}

impl HttpTransport {
    pub fn new(server: &ServerConfig, client_id: &str) -> Result<Self, TransportError> {
        if server.url.is_empty() {
            return Err(TransportError::Config("server url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        let id = HeaderValue::from_str(client_id)
            .map_err(|_| TransportError::Config("Invalid client id".into()))?;
        headers.insert(HeaderName::from_static(CLIENT_ID_HEADER), id);
        headers.insert(
            HeaderName::from_static(VERSION_HEADER),
            HeaderValue::from_static(PROTOCOL_VERSION),
        );

        // reqwest is built with rustls-no-provider; an Err here means a
        // provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(server.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: server.url.trim_end_matches('/').to_string(),
            pair_route: server.pair_route.clone(),
            send_route: server.send_route.clone(),
            upload_route: server.upload_route.clone(),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route.trim_start_matches('/'))
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), TransportError> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            tracing::warn!(status = status.as_u16(), url = %resp.url(), "Peer rejected request");
            Err(TransportError::from_status(status.as_u16()))
        }
    }

    async fn read_body(resp: reqwest::Response) -> Result<String, TransportError> {
        Self::check_status(&resp)?;
        let body = resp.text().await?;
        if body.is_empty() {
            return Err(TransportError::NoData);
        }
        Ok(body)
    }
}

impl PeerTransport for HttpTransport {
    async fn pair_one(&self, request: &PairRequest) -> Result<PairResponse, TransportError> {
        let resp = self
            .http
            .post(self.url(&self.pair_route))
            .json(request)
            .send()
            .await?;
        let body = Self::read_body(resp).await?;
        serde_json::from_str(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn send_data(
        &self,
        body: String,
        fixed_length: Option<usize>,
    ) -> Result<String, TransportError> {
        let mut req = self
            .http
            .post(self.url(&self.send_route))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body);
        if let Some(len) = fixed_length {
            req = req.header(FIXED_LENGTH_HEADER, len.to_string());
        }
        Self::read_body(req.send().await?).await
    }

    async fn upload<S>(&self, name: &str, body: S) -> Result<String, TransportError>
    where
        S: Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static,
    {
        let mut url = reqwest::Url::parse(&self.url(&self.upload_route))
            .map_err(|e| TransportError::Config(format!("Invalid upload url: {e}")))?;
        url.query_pairs_mut().append_pair("name", name);

        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        Self::read_body(resp).await
    }
}
