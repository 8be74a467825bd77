//! Session pairs seeded in-process.
//!
//! Both ends are instantiated from the same entropy and one [`SeedNonce`],
//! so no handshake is needed. The CLI self-check uses this to exercise the
//! engine without a peer.

use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::engine::{Decoded, EngineConfig, SeedNonce, SoftDecoder, SoftEncoder};
use crate::error::CryptoError;
use crate::new_personalization_string;
use crate::secret::SecretBuf;
use crate::state::SessionState;

const LOCAL_ENTROPY_LEN: usize = 32;

/// Encoder and decoder sessions instantiated from the same material.
pub fn seeded_pair(
    config: EngineConfig,
    personalization: &str,
    entropy: &[u8],
    seed: u64,
) -> Result<(SessionState<SoftEncoder>, SessionState<SoftDecoder>), CryptoError> {
    let mut nonce = SeedNonce::new(seed);
    let mut encoder = SessionState::new(SoftEncoder::new(config));
    encoder.instantiate(personalization, &mut SecretBuf::from_slice(entropy), &mut nonce)?;
    let mut decoder = SessionState::new(SoftDecoder::new(config));
    decoder.instantiate(personalization, &mut SecretBuf::from_slice(entropy), &mut nonce)?;
    Ok((encoder, decoder))
}

/// Pair from fresh OS randomness, encode `value` and decode it again.
pub fn self_check(config: EngineConfig, value: &[u8]) -> Result<Decoded, CryptoError> {
    let mut entropy = Zeroizing::new(vec![0u8; LOCAL_ENTROPY_LEN]);
    OsRng.fill_bytes(&mut entropy);
    let seed = OsRng.next_u64();

    let (mut encoder, mut decoder) =
        seeded_pair(config, &new_personalization_string(), &entropy, seed)?;
    let encoded = encoder.encode_b64(value)?;
    let decoded = decoder.decode_b64(&encoded)?;
    tracing::debug!(status = decoded.status.name(), "Local self-check decoded");
    Ok(decoded)
}
