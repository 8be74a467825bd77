//! In-process peer.
//!
//! Plays the server side of every call: pairs the opposite role, echoes data
//! messages back through its own encoder and decrypts uploads. The HTTP test
//! server wraps the same handlers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use tessera_crypto::{
    CryptoError, EngineConfig, KeyPair, NonceValue, SessionState, SoftDecoder, SoftEncoder,
    SystemClock, TimestampSource,
};

use crate::pairing::PairRole;
use crate::transport::{PairRequest, PairResponse, PeerTransport, TransportError};

#[derive(Default)]
struct PeerSessions {
    encoder: Option<SessionState<SoftEncoder>>,
    decoder: Option<SessionState<SoftDecoder>>,
    uploads: HashMap<String, Vec<u8>>,
}

pub struct LoopbackPeer {
    config: EngineConfig,
    pair_delay: Duration,
    sessions: Mutex<PeerSessions>,
}

impl Default for LoopbackPeer {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for LoopbackPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPeer")
            .field("config", &self.config)
            .field("pair_delay", &self.pair_delay)
            .finish_non_exhaustive()
    }
}

fn not_paired() -> TransportError {
    TransportError::from_status(400)
}

fn rejected(err: CryptoError) -> TransportError {
    debug!(error = %err, "Peer rejected message");
    TransportError::from_status(400)
}

impl LoopbackPeer {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            pair_delay: Duration::ZERO,
            sessions: Mutex::new(PeerSessions::default()),
        }
    }

    /// Delay every pairing response.
    #[must_use]
    pub const fn with_pair_delay(mut self, delay: Duration) -> Self {
        self.pair_delay = delay;
        self
    }

    fn sessions(&self) -> Result<MutexGuard<'_, PeerSessions>, TransportError> {
        self.sessions
            .lock()
            .map_err(|_| TransportError::from_status(500))
    }

    /// Pair the role opposite to the request's.
    pub fn handle_pair(&self, request: &PairRequest) -> Result<PairResponse, TransportError> {
        let key_pair = KeyPair::generate();
        let public_key = key_pair
            .public_key_base64()
            .map_err(|_| TransportError::from_status(500))?;
        let mut entropy = key_pair
            .derive_shared_entropy(&request.public_key)
            .map_err(rejected)?;
        let timestamp = SystemClock.timestamp();
        let mut nonce = NonceValue::new(timestamp);
        let ps = &request.personalization_string;

        let mut sessions = self.sessions()?;
        match request.pair_type.opposite() {
            PairRole::Decoder => {
                let mut decoder = SessionState::new(SoftDecoder::new(self.config));
                decoder
                    .instantiate(ps, &mut entropy, &mut nonce)
                    .map_err(rejected)?;
                sessions.decoder = Some(decoder);
            }
            PairRole::Encoder => {
                let mut encoder = SessionState::new(SoftEncoder::new(self.config));
                encoder
                    .instantiate(ps, &mut entropy, &mut nonce)
                    .map_err(rejected)?;
                sessions.encoder = Some(encoder);
            }
        }
        info!(client_role = request.pair_type.wire_name(), "Peer paired");

        Ok(PairResponse {
            public_key,
            timestamp: timestamp.to_string(),
        })
    }

    /// Decode a client message and send it back through the peer encoder.
    pub fn handle_data(&self, body: &str) -> Result<String, TransportError> {
        let message = self.decode_message(body)?;
        self.encode_message(&message)
    }

    /// Decode one base64 message from the client.
    pub fn decode_message(&self, body: &str) -> Result<Vec<u8>, TransportError> {
        let mut sessions = self.sessions()?;
        let decoder = sessions.decoder.as_mut().ok_or_else(not_paired)?;
        let decoded = decoder.decode_b64(body.trim()).map_err(rejected)?;
        if !decoded.is_success() {
            debug!(status = decoded.status.name(), "Peer rejected message");
            return Err(not_paired());
        }
        Ok(decoded.data)
    }

    /// Encode one message for the client, as base64.
    pub fn encode_message(&self, data: &[u8]) -> Result<String, TransportError> {
        let mut sessions = self.sessions()?;
        let encoder = sessions.encoder.as_mut().ok_or_else(not_paired)?;
        encoder.encode_b64(data).map_err(rejected)
    }

    /// Decrypt an upload stream and keep the plaintext under `name`.
    pub async fn handle_upload<S>(&self, name: &str, body: S) -> Result<String, TransportError>
    where
        S: Stream<Item = Result<Vec<u8>, std::io::Error>> + Send,
    {
        let mut handle = {
            let sessions = self.sessions()?;
            let decoder = sessions.decoder.as_ref().ok_or_else(not_paired)?;
            decoder.start_decrypt().map_err(rejected)?
        };

        let mut body = std::pin::pin!(body);
        let mut plain = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            plain.extend(handle.decrypt_chunk(&chunk).map_err(rejected)?);
        }
        let (tail, saved) = handle.finish().map_err(rejected)?;
        plain.extend(tail);

        let received = plain.len();
        let mut sessions = self.sessions()?;
        if let Some(decoder) = sessions.decoder.as_mut() {
            decoder.replace(saved);
        }
        sessions.uploads.insert(name.to_string(), plain);
        info!(name, bytes = received, "Upload received");
        Ok(format!("Received {received} bytes"))
    }

    /// Plaintext of a finished upload.
    pub fn uploaded(&self, name: &str) -> Option<Vec<u8>> {
        self.sessions().ok()?.uploads.get(name).cloned()
    }
}

impl PeerTransport for LoopbackPeer {
    async fn pair_one(&self, request: &PairRequest) -> Result<PairResponse, TransportError> {
        if !self.pair_delay.is_zero() {
            tokio::time::sleep(self.pair_delay).await;
        }
        self.handle_pair(request)
    }

    async fn send_data(
        &self,
        body: String,
        _fixed_length: Option<usize>,
    ) -> Result<String, TransportError> {
        self.handle_data(&body)
    }

    async fn upload<S>(&self, name: &str, body: S) -> Result<String, TransportError>
    where
        S: Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static,
    {
        self.handle_upload(name, body).await
    }
}
