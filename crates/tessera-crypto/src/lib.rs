//! `Tessera` Crypto Library
//!
//! Stateful encoding sessions seeded by a one-time key agreement.
//!
//! ## Building blocks
//!
//! - **Agreement**: ephemeral P-256 ECDH per pairing, SHA-256 of the shared secret → 32 bytes of entropy
//! - **Engine**: encoder/decoder contract plus the software engine (HKDF-SHA256 seed, ChaCha20-Poly1305 per message)
//! - **SessionState**: sessions live as saved snapshots between operations
//! - **Sequencing**: verification-only, forward-only and async decode windows
//! - **Chunks**: start/update/finish stream encryption
//! - **SDR**: named items encrypted in memory or on disk
//! - **Local**: handshake-free pairs from shared entropy and a seeded nonce

pub mod agreement;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod local;
pub mod sdr;
pub mod secret;
pub mod sequenced;
pub mod state;

pub use agreement::KeyPair;
pub use chunk::{DecryptHandle, EncryptHandle};
pub use engine::{
    ChunkDecrypt, ChunkEncrypt, Decode, Decoded, Encode, Engine, EngineConfig, EntropySource,
    FixedClock, FixedLengthEncoder, NonceSource, NonceValue, SeedNonce, SoftDecoder, SoftEncoder,
    Status, SystemClock, TimestampSource,
};
pub use error::CryptoError;
pub use sdr::SecureItemStore;
pub use secret::{SecretBuf, SharedEntropy};
pub use sequenced::{SequenceWindow, SequencedSession, SessionPhase};
pub use state::{SavedState, SessionState};

/// Fresh personalization string for a pairing (lowercase UUID v4).
pub fn new_personalization_string() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Instantiate a matched encoder/decoder pair from fixed material.
///
/// Both ends of a real pairing reach this state independently; tests use it
/// to skip the network.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_session_pair(
    config: EngineConfig,
    personalization: &str,
) -> Result<(SessionState<SoftEncoder>, SessionState<SoftDecoder>), CryptoError> {
    local::seeded_pair(config, personalization, &[0x5Au8; 32], 1)
}
