//! Pairing: one key agreement round trip seeds one engine.
//!
//! The engine pulls entropy synchronously during instantiation. The
//! [`HandshakeEntropy`] source it pulls from performs the network round trip
//! on the tokio runtime and blocks the calling thread, with a bounded wait,
//! until the peer's public key arrives. The peer's timestamp is handed to the
//! nonce source through a shared slot.

use std::cell::Cell;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use tessera_crypto::{
    CryptoError, Engine, EntropySource, KeyPair, NonceSource, NonceValue, SavedState,
    SessionState, Status,
};

use crate::transport::{PairRequest, PairResponse, PeerTransport, TransportError};

/// Which side of a channel the local engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairRole {
    #[serde(rename = "Enc")]
    Encoder,
    #[serde(rename = "Dec")]
    Decoder,
}

impl PairRole {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Encoder => "Enc",
            Self::Decoder => "Dec",
        }
    }

    /// The role the peer pairs for this request.
    pub const fn opposite(self) -> Self {
        match self {
            Self::Encoder => Self::Decoder,
            Self::Decoder => Self::Encoder,
        }
    }
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(CryptoError),

    #[error("Engine rejected pairing: {0}")]
    Engine(CryptoError),

    #[error("No pairing entropy after {0:?}")]
    EntropyTimeout(Duration),

    #[error("Pairing task failed: {0}")]
    Task(String),
}

impl PairingError {
    pub fn code(&self) -> String {
        match self {
            Self::Transport(TransportError::Malformed(_)) | Self::ProtocolError(_) => {
                "ProtocolError".into()
            }
            Self::Transport(e) => e.code(),
            Self::KeyAgreement(_) => "KeyAgreement".into(),
            Self::Engine(e) => e
                .status()
                .map_or_else(|| "Engine".into(), |s| s.name().to_string()),
            Self::EntropyTimeout(_) => "EntropyTimeout".into(),
            Self::Task(_) => "Task".into(),
        }
    }
}

/// Runs pairings against one peer.
pub struct PairingCoordinator<T> {
    transport: Arc<T>,
    runtime: Handle,
    timeout: Duration,
}

impl<T> Clone for PairingCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            runtime: self.runtime.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> std::fmt::Debug for PairingCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCoordinator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T: PeerTransport> PairingCoordinator<T> {
    pub const fn new(transport: Arc<T>, runtime: Handle, timeout: Duration) -> Self {
        Self {
            transport,
            runtime,
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pair `template` for `role` and return its first checkpoint.
    ///
    /// Runs the blocking part on the blocking pool.
    pub async fn pair<E>(
        &self,
        role: PairRole,
        personalization: String,
        template: E,
    ) -> Result<SavedState, PairingError>
    where
        E: Engine + Clone + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.pair_blocking(role, &personalization, &template))
            .await
            .map_err(|e| PairingError::Task(e.to_string()))?
    }

    /// Blocking form of [`pair`](Self::pair).
    ///
    /// Must not run on a runtime worker: the round trip is spawned onto
    /// `runtime` and this thread waits for it.
    pub fn pair_blocking<E: Engine + Clone>(
        &self,
        role: PairRole,
        personalization: &str,
        template: &E,
    ) -> Result<SavedState, PairingError> {
        info!(role = role.wire_name(), "Pairing with peer");
        let key_pair = KeyPair::generate();
        let request = PairRequest {
            personalization_string: personalization.to_string(),
            public_key: key_pair
                .public_key_base64()
                .map_err(PairingError::KeyAgreement)?,
            pair_type: role,
        };

        let nonce_slot = Cell::new(None);
        let mut entropy = HandshakeEntropy {
            coordinator: self,
            pending: Some((request, key_pair)),
            nonce_slot: &nonce_slot,
            failure: None,
            timed_out: false,
        };
        let mut nonce = HandshakeNonce {
            slot: &nonce_slot,
        };

        let mut state = SessionState::new(template.clone());
        let result = state.instantiate(personalization, &mut entropy, &mut nonce);

        if let Some(failure) = entropy.failure.take() {
            warn!(role = role.wire_name(), error = %failure, "Pairing failed");
            return Err(failure);
        }
        if entropy.timed_out {
            warn!(
                role = role.wire_name(),
                "Pairing degraded: engine instantiated without peer entropy"
            );
            return Err(PairingError::EntropyTimeout(self.timeout));
        }
        result.map_err(PairingError::Engine)?;

        let saved = state
            .saved()
            .cloned()
            .ok_or(PairingError::Engine(CryptoError::NoSavedState))?;
        info!(role = role.wire_name(), "Paired");
        Ok(saved)
    }

    fn round_trip(
        &self,
        request: PairRequest,
    ) -> Result<Result<PairResponse, TransportError>, mpsc::RecvTimeoutError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let transport = Arc::clone(&self.transport);
        self.runtime.spawn(async move {
            let result = transport.pair_one(&request).await;
            // The receiver is gone once the wait timed out.
            let _ = tx.send(result);
        });
        rx.recv_timeout(self.timeout)
    }
}

/// Entropy source that performs the pairing round trip on first use.
struct HandshakeEntropy<'a, T> {
    coordinator: &'a PairingCoordinator<T>,
    pending: Option<(PairRequest, KeyPair)>,
    nonce_slot: &'a Cell<Option<u64>>,
    failure: Option<PairingError>,
    timed_out: bool,
}

impl<T: PeerTransport> HandshakeEntropy<'_, T> {
    fn fail(&mut self, failure: PairingError) -> Result<Zeroizing<Vec<u8>>, Status> {
        self.failure = Some(failure);
        Err(Status::InvalidInput)
    }
}

impl<T: PeerTransport> EntropySource for HandshakeEntropy<'_, T> {
    fn entropy(&mut self, min_len: usize, max_len: usize) -> Result<Zeroizing<Vec<u8>>, Status> {
        let Some((request, key_pair)) = self.pending.take() else {
            return Ok(Zeroizing::new(Vec::new()));
        };

        let response = match self.coordinator.round_trip(request) {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Malformed(detail))) => {
                return self.fail(PairingError::ProtocolError(detail));
            }
            Ok(Err(e)) => return self.fail(PairingError::Transport(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    timeout = ?self.coordinator.timeout,
                    "Timed out waiting for pairing response, continuing without entropy"
                );
                self.timed_out = true;
                return Ok(Zeroizing::new(Vec::new()));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return self.fail(PairingError::Task("pairing task dropped".into()));
            }
        };

        let Some(timestamp) = response.timestamp_value() else {
            return self.fail(PairingError::ProtocolError(format!(
                "timestamp is not a number: {:?}",
                response.timestamp
            )));
        };
        let mut shared = match key_pair.derive_shared_entropy(&response.public_key) {
            Ok(shared) => shared,
            Err(e) => return self.fail(PairingError::KeyAgreement(e)),
        };
        self.nonce_slot.set(Some(timestamp));
        debug!(min_len, max_len, "Pairing entropy ready");
        shared.entropy(min_len, max_len)
    }
}

/// Nonce source fed by [`HandshakeEntropy`] with the peer's timestamp.
///
/// The slot is only filled once the round trip succeeded. An empty slot
/// yields no bytes, which the engine refuses as too short.
struct HandshakeNonce<'a> {
    slot: &'a Cell<Option<u64>>,
}

impl NonceSource for HandshakeNonce<'_> {
    fn nonce(&mut self, min_len: usize, max_len: usize) -> Zeroizing<Vec<u8>> {
        match self.slot.take() {
            Some(value) => NonceValue::new(value).nonce(min_len, max_len),
            None => Zeroizing::new(Vec::new()),
        }
    }
}
