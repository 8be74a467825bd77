//! Software engine.
//!
//! Instantiation mixes entropy, nonce and personalization string into a
//! 32-byte seed with HKDF-SHA256. Message `n` is sealed with
//! ChaCha20-Poly1305 under a key expanded from the seed and `n`; the
//! plaintext carries an 8-byte LE encode timestamp. The sequence number is
//! never sent: the decoder finds it by trying every sequence its window
//! currently accepts, so a forged or corrupted message looks exactly like an
//! out-of-window one.
//!
//! Chunk streams take one sequence number each and use a ChaCha20 keystream
//! with a truncated HMAC-SHA256 trailer over the ciphertext.

use std::sync::Arc;

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use super::sources::SystemClock;
use super::window::{WindowTracker, window_in_range};
use super::{
    ChunkDecrypt, ChunkEncrypt, Decode, Decoded, Encode, Engine, EntropySource, NonceSource,
    Status, TimestampSource,
};
use crate::state::SavedState;

type HmacSha256 = Hmac<Sha256>;
type Seed = Zeroizing<[u8; 32]>;

/// HKDF info prefix for the instantiation seed.
const SEED_LABEL: &[u8] = b"tessera-soft-engine-v1";

pub const ENTROPY_MIN: usize = 32;
pub const ENTROPY_MAX: usize = 64;
pub const NONCE_MIN: usize = 16;
pub const NONCE_MAX: usize = 32;

const TIMESTAMP_LEN: usize = 8;
const AEAD_TAG_LEN: usize = 16;
/// Trailer emitted by `finish_encrypt`.
pub const CHUNK_TAG_LEN: usize = 16;

/// Every key is used for exactly one message or stream.
const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// Settings that must match between a saved state and the handle restoring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 0 verification-only, >0 forward-only window, <0 async window.
    pub sequence_window: i32,
    /// Maximum encode/decode timestamp difference in ms. 0 disables the check.
    pub timestamp_window_ms: u64,
}

impl EngineConfig {
    pub const fn with_window(sequence_window: i32) -> Self {
        Self {
            sequence_window,
            timestamp_window_ms: 0,
        }
    }

    /// Whether the sequence window is within `-MAX_WINDOW..=MAX_WINDOW`.
    /// Engines refuse to instantiate or restore with any other window.
    pub fn is_supported(&self) -> bool {
        window_in_range(self.sequence_window)
    }
}

type SharedClock = Arc<dyn TimestampSource + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    Encoder,
    Decoder,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    role: Role,
    config: EngineConfig,
    seed: String,
    next: u64,
    window: Option<WindowTracker>,
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl Snapshot {
    fn save(&self) -> Option<SavedState> {
        serde_json::to_vec(self).ok().map(SavedState::new)
    }

    fn load(state: &SavedState, role: Role, config: EngineConfig) -> Result<(Self, Seed), Status> {
        let snapshot: Self =
            serde_json::from_slice(state.as_bytes()).map_err(|_| Status::InvalidState)?;
        if snapshot.role != role || snapshot.config != config {
            return Err(Status::InvalidState);
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(&snapshot.seed, &mut seed[..]).map_err(|_| Status::InvalidState)?;
        Ok((snapshot, seed))
    }
}

fn seed_from_sources(
    personalization: &str,
    entropy: &mut dyn EntropySource,
    nonce: &mut dyn NonceSource,
) -> Result<Seed, Status> {
    let entropy = entropy.entropy(ENTROPY_MIN, ENTROPY_MAX)?;
    if entropy.len() < ENTROPY_MIN {
        return Err(Status::EntropyTooShort);
    }
    let nonce = nonce.nonce(NONCE_MIN, NONCE_MAX);
    if nonce.len() < NONCE_MIN {
        return Err(Status::NonceTooShort);
    }
    let nonce_len = nonce.len().min(NONCE_MAX);

    let hk = Hkdf::<Sha256>::new(Some(&nonce[..nonce_len]), &entropy);
    let mut seed = Zeroizing::new([0u8; 32]);
    hk.expand_multi_info(&[SEED_LABEL, personalization.as_bytes()], &mut seed[..])
        .map_err(|_| Status::InvalidInput)?;
    Ok(seed)
}

fn expand<const N: usize>(seed: &Seed, label: &[u8], seq: u64) -> Result<Zeroizing<[u8; N]>, Status> {
    let hk = Hkdf::<Sha256>::from_prk(&seed[..]).map_err(|_| Status::InvalidState)?;
    let mut out = Zeroizing::new([0u8; N]);
    hk.expand_multi_info(&[label, seq.to_le_bytes().as_slice()], &mut out[..])
        .map_err(|_| Status::InvalidState)?;
    Ok(out)
}

fn message_cipher(seed: &Seed, seq: u64) -> Result<ChaCha20Poly1305, Status> {
    let key = expand::<32>(seed, b"msg", seq)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
}

fn seal(seed: &Seed, seq: u64, timestamp: u64, payload: &[u8]) -> Result<Vec<u8>, Status> {
    let cipher = message_cipher(seed, seq)?;
    let mut plain = Zeroizing::new(Vec::with_capacity(TIMESTAMP_LEN + payload.len()));
    plain.extend_from_slice(&timestamp.to_le_bytes());
    plain.extend_from_slice(payload);
    cipher
        .encrypt(Nonce::from_slice(&ZERO_NONCE), plain.as_slice())
        .map_err(|_| Status::InvalidInput)
}

fn open(seed: &Seed, seq: u64, sealed: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let cipher = message_cipher(seed, seq).ok()?;
    cipher
        .decrypt(Nonce::from_slice(&ZERO_NONCE), sealed)
        .ok()
        .map(Zeroizing::new)
}

struct StreamKeys {
    cipher: ChaCha20,
    mac: HmacSha256,
}

impl StreamKeys {
    fn new(seed: &Seed, seq: u64) -> Result<Self, Status> {
        let keys = expand::<64>(seed, b"chunk", seq)?;
        let cipher = ChaCha20::new(
            chacha20::Key::from_slice(&keys[..32]),
            chacha20::Nonce::from_slice(&ZERO_NONCE),
        );
        let mac =
            <HmacSha256 as Mac>::new_from_slice(&keys[32..]).map_err(|_| Status::InvalidState)?;
        Ok(Self { cipher, mac })
    }

    fn tag(self) -> Zeroizing<Vec<u8>> {
        let full = self.mac.finalize().into_bytes();
        Zeroizing::new(full[..CHUNK_TAG_LEN].to_vec())
    }
}

#[derive(Clone)]
struct EncoderCore {
    seed: Seed,
    next: u64,
}

/// Sequenced encoder.
pub struct SoftEncoder {
    config: EngineConfig,
    clock: SharedClock,
    core: Option<EncoderCore>,
    stream: Option<StreamKeys>,
}

impl Default for SoftEncoder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl SoftEncoder {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            core: None,
            stream: None,
        }
    }

    pub const fn config(&self) -> EngineConfig {
        self.config
    }
}

impl std::fmt::Debug for SoftEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftEncoder")
            .field("config", &self.config)
            .field("instantiated", &self.core.is_some())
            .field("next", &self.core.as_ref().map(|c| c.next))
            .finish_non_exhaustive()
    }
}

/// A clone shares the session but never an open chunk stream.
impl Clone for SoftEncoder {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            clock: Arc::clone(&self.clock),
            core: self.core.clone(),
            stream: None,
        }
    }
}

impl Engine for SoftEncoder {
    fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Status {
        self.stream = None;
        if !self.config.is_supported() {
            self.core = None;
            return Status::InvalidInput;
        }
        match seed_from_sources(personalization, entropy, nonce) {
            Ok(seed) => {
                self.core = Some(EncoderCore { seed, next: 0 });
                Status::Success
            }
            Err(status) => {
                self.core = None;
                status
            }
        }
    }

    fn save_state(&self) -> Option<SavedState> {
        let core = self.core.as_ref()?;
        Snapshot {
            role: Role::Encoder,
            config: self.config,
            seed: hex::encode(&core.seed[..]),
            next: core.next,
            window: None,
        }
        .save()
    }

    fn restore_state(&mut self, state: &SavedState) -> Status {
        if !self.config.is_supported() {
            return Status::InvalidInput;
        }
        match Snapshot::load(state, Role::Encoder, self.config) {
            Ok((snapshot, seed)) => {
                self.core = Some(EncoderCore {
                    seed,
                    next: snapshot.next,
                });
                self.stream = None;
                Status::Success
            }
            Err(status) => status,
        }
    }

    fn uninstantiate(&mut self) -> Status {
        self.core = None;
        self.stream = None;
        Status::Success
    }

    fn is_instantiated(&self) -> bool {
        self.core.is_some()
    }
}

impl EncoderCore {
    fn take_sequence(&mut self) -> Result<u64, Status> {
        if self.next == u64::MAX {
            return Err(Status::SequenceExhausted);
        }
        let seq = self.next;
        self.next += 1;
        Ok(seq)
    }
}

impl Encode for SoftEncoder {
    fn encode(&mut self, input: &[u8]) -> (Vec<u8>, Status) {
        let Some(core) = self.core.as_mut() else {
            return (Vec::new(), Status::NotInstantiated);
        };
        let timestamp = self.clock.timestamp();
        let sealed = core
            .take_sequence()
            .and_then(|seq| seal(&core.seed, seq, timestamp, input));
        match sealed {
            Ok(out) => (out, Status::Success),
            Err(status) => (Vec::new(), status),
        }
    }
}

impl ChunkEncrypt for SoftEncoder {
    fn start_encrypt(&mut self) -> Status {
        if self.stream.is_some() {
            return Status::ChunkOutOfOrder;
        }
        let Some(core) = self.core.as_mut() else {
            return Status::NotInstantiated;
        };
        match core
            .take_sequence()
            .and_then(|seq| StreamKeys::new(&core.seed, seq))
        {
            Ok(keys) => {
                self.stream = Some(keys);
                Status::Success
            }
            Err(status) => status,
        }
    }

    fn encrypt_chunk(&mut self, data: &mut Vec<u8>) -> Status {
        let Some(stream) = self.stream.as_mut() else {
            return Status::ChunkOutOfOrder;
        };
        stream.cipher.apply_keystream(data);
        stream.mac.update(data);
        Status::Success
    }

    fn finish_encrypt(&mut self) -> (Vec<u8>, Status) {
        match self.stream.take() {
            Some(stream) => (stream.tag().to_vec(), Status::Success),
            None => (Vec::new(), Status::ChunkOutOfOrder),
        }
    }
}

#[derive(Clone)]
struct DecoderCore {
    seed: Seed,
    window: WindowTracker,
}

struct DecryptStream {
    keys: StreamKeys,
    /// Trailing bytes that may still turn out to be the tag.
    pending: Vec<u8>,
}

/// Sequenced decoder enforcing the configured window.
pub struct SoftDecoder {
    config: EngineConfig,
    clock: SharedClock,
    core: Option<DecoderCore>,
    stream: Option<DecryptStream>,
}

impl Default for SoftDecoder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl SoftDecoder {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            core: None,
            stream: None,
        }
    }

    pub const fn config(&self) -> EngineConfig {
        self.config
    }
}

impl std::fmt::Debug for SoftDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDecoder")
            .field("config", &self.config)
            .field("instantiated", &self.core.is_some())
            .finish_non_exhaustive()
    }
}

impl Clone for SoftDecoder {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            clock: Arc::clone(&self.clock),
            core: self.core.clone(),
            stream: None,
        }
    }
}

impl Engine for SoftDecoder {
    fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Status {
        self.stream = None;
        if !self.config.is_supported() {
            self.core = None;
            return Status::InvalidInput;
        }
        match seed_from_sources(personalization, entropy, nonce) {
            Ok(seed) => {
                self.core = Some(DecoderCore {
                    seed,
                    window: WindowTracker::new(self.config.sequence_window),
                });
                Status::Success
            }
            Err(status) => {
                self.core = None;
                status
            }
        }
    }

    fn save_state(&self) -> Option<SavedState> {
        let core = self.core.as_ref()?;
        Snapshot {
            role: Role::Decoder,
            config: self.config,
            seed: hex::encode(&core.seed[..]),
            next: 0,
            window: Some(core.window),
        }
        .save()
    }

    fn restore_state(&mut self, state: &SavedState) -> Status {
        if !self.config.is_supported() {
            return Status::InvalidInput;
        }
        match Snapshot::load(state, Role::Decoder, self.config) {
            Ok((snapshot, seed)) => {
                let Some(window) = snapshot.window else {
                    return Status::InvalidState;
                };
                if window.window() != self.config.sequence_window {
                    return Status::InvalidState;
                }
                self.core = Some(DecoderCore { seed, window });
                self.stream = None;
                Status::Success
            }
            Err(status) => status,
        }
    }

    fn uninstantiate(&mut self) -> Status {
        self.core = None;
        self.stream = None;
        Status::Success
    }

    fn is_instantiated(&self) -> bool {
        self.core.is_some()
    }
}

impl Decode for SoftDecoder {
    fn decode(&mut self, input: &[u8]) -> Decoded {
        let decode_timestamp = self.clock.timestamp();
        let Some(core) = self.core.as_mut() else {
            return Decoded::rejected(Status::NotInstantiated);
        };
        if input.len() < TIMESTAMP_LEN + AEAD_TAG_LEN {
            return Decoded {
                status: Status::InvalidInput,
                decode_timestamp,
                ..Decoded::default()
            };
        }

        for seq in core.window.candidates() {
            let Some(plain) = open(&core.seed, seq, input) else {
                continue;
            };
            let mut ts = [0u8; TIMESTAMP_LEN];
            ts.copy_from_slice(&plain[..TIMESTAMP_LEN]);
            let encode_timestamp = u64::from_le_bytes(ts);

            let limit = self.config.timestamp_window_ms;
            if limit > 0 && encode_timestamp.abs_diff(decode_timestamp) > limit {
                return Decoded {
                    status: Status::TimestampOutsideWindow,
                    decode_timestamp,
                    encode_timestamp,
                    ..Decoded::default()
                };
            }

            let sequence_skipped = core.window.accept(seq);
            return Decoded {
                data: plain[TIMESTAMP_LEN..].to_vec(),
                status: Status::Success,
                sequence_skipped,
                decode_timestamp,
                encode_timestamp,
            };
        }

        Decoded {
            status: Status::SeqOutsideWindow,
            decode_timestamp,
            ..Decoded::default()
        }
    }

    fn sequence_window(&self) -> i32 {
        self.config.sequence_window
    }
}

impl ChunkDecrypt for SoftDecoder {
    fn start_decrypt(&mut self) -> Status {
        if self.stream.is_some() {
            return Status::ChunkOutOfOrder;
        }
        let Some(core) = self.core.as_mut() else {
            return Status::NotInstantiated;
        };
        let seq = core.window.reserve_next();
        match StreamKeys::new(&core.seed, seq) {
            Ok(keys) => {
                self.stream = Some(DecryptStream {
                    keys,
                    pending: Vec::new(),
                });
                Status::Success
            }
            Err(status) => status,
        }
    }

    fn decrypt_chunk(&mut self, data: &[u8]) -> (Vec<u8>, Status) {
        let Some(stream) = self.stream.as_mut() else {
            return (Vec::new(), Status::ChunkOutOfOrder);
        };
        stream.pending.extend_from_slice(data);
        if stream.pending.len() <= CHUNK_TAG_LEN {
            return (Vec::new(), Status::Success);
        }
        let ready = stream.pending.len() - CHUNK_TAG_LEN;
        let mut out: Vec<u8> = stream.pending.drain(..ready).collect();
        stream.keys.mac.update(&out);
        stream.keys.cipher.apply_keystream(&mut out);
        (out, Status::Success)
    }

    fn finish_decrypt(&mut self) -> (Vec<u8>, Status) {
        let Some(stream) = self.stream.take() else {
            return (Vec::new(), Status::ChunkOutOfOrder);
        };
        if stream.pending.len() != CHUNK_TAG_LEN {
            return (Vec::new(), Status::TokenDoesNotMatch);
        }
        let expected = stream.keys.tag();
        if bool::from(expected.as_slice().ct_eq(&stream.pending)) {
            (Vec::new(), Status::Success)
        } else {
            (Vec::new(), Status::TokenDoesNotMatch)
        }
    }
}

/// Encoder that always encodes exactly `length` bytes.
///
/// Shorter inputs are zero-padded and longer ones truncated, so every
/// message on the wire has the same size. Stripping the padding after
/// decode is up to the caller.
#[derive(Debug, Clone)]
pub struct FixedLengthEncoder {
    inner: SoftEncoder,
    length: usize,
}

impl FixedLengthEncoder {
    pub fn new(config: EngineConfig, length: usize) -> Self {
        Self {
            inner: SoftEncoder::new(config),
            length,
        }
    }

    pub fn with_clock(config: EngineConfig, length: usize, clock: SharedClock) -> Self {
        Self {
            inner: SoftEncoder::with_clock(config, clock),
            length,
        }
    }

    pub const fn length(&self) -> usize {
        self.length
    }
}

impl Engine for FixedLengthEncoder {
    fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Status {
        self.inner.instantiate(personalization, entropy, nonce)
    }

    fn save_state(&self) -> Option<SavedState> {
        self.inner.save_state()
    }

    fn restore_state(&mut self, state: &SavedState) -> Status {
        self.inner.restore_state(state)
    }

    fn uninstantiate(&mut self) -> Status {
        self.inner.uninstantiate()
    }

    fn is_instantiated(&self) -> bool {
        self.inner.is_instantiated()
    }
}

impl Encode for FixedLengthEncoder {
    fn encode(&mut self, input: &[u8]) -> (Vec<u8>, Status) {
        let mut padded = Zeroizing::new(vec![0u8; self.length]);
        let n = input.len().min(self.length);
        padded[..n].copy_from_slice(&input[..n]);
        self.inner.encode(&padded)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::sources::{FixedClock, NonceValue};
    use crate::secret::SecretBuf;

    const PS: &str = "0b6b9b0e-6f4c-4a53-8c2f-6c7d9f1c2a10";

    fn instantiate<E: Engine>(engine: &mut E, ps: &str) -> Status {
        engine.instantiate(
            ps,
            &mut SecretBuf::new(vec![0x11; 32]),
            &mut NonceValue::new(1_700_000_000_000),
        )
    }

    fn pair(config: EngineConfig, clock: &FixedClock) -> (SoftEncoder, SoftDecoder) {
        let mut enc = SoftEncoder::with_clock(config, Arc::new(clock.clone()));
        let mut dec = SoftDecoder::with_clock(config, Arc::new(clock.clone()));
        assert_eq!(instantiate(&mut enc, PS), Status::Success);
        assert_eq!(instantiate(&mut dec, PS), Status::Success);
        (enc, dec)
    }

    #[test]
    fn round_trip_preserves_payloads() {
        let clock = FixedClock::new(1_000);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);

        let payloads: [&[u8]; 4] = [b"", b"a", b"hello world", &[0u8; 4096]];
        for payload in payloads {
            let (encoded, status) = enc.encode(payload);
            assert_eq!(status, Status::Success);
            let decoded = dec.decode(&encoded);
            assert_eq!(decoded.status, Status::Success);
            assert_eq!(decoded.data, payload);
            assert_eq!(decoded.encode_timestamp, 1_000);
        }
    }

    #[test]
    fn string_variants_round_trip() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);

        let (b64, status) = enc.encode_str("héllo");
        assert_eq!(status, Status::Success);
        assert_eq!(dec.decode_str(&b64), ("héllo".to_string(), Status::Success));
        assert_eq!(dec.decode_b64("%%%").status, Status::InvalidInput);
    }

    #[test]
    fn mismatched_personalization_never_decodes() {
        let clock = FixedClock::new(0);
        let mut enc = SoftEncoder::with_clock(EngineConfig::default(), Arc::new(clock.clone()));
        let mut dec = SoftDecoder::with_clock(EngineConfig::default(), Arc::new(clock));
        instantiate(&mut enc, "left");
        instantiate(&mut dec, "right");

        let (encoded, _) = enc.encode(b"x");
        assert_eq!(dec.decode(&encoded).status, Status::SeqOutsideWindow);
    }

    #[test]
    fn corrupted_message_is_outside_window() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);
        let (mut encoded, _) = enc.encode(b"payload");
        encoded[3] ^= 0x40;
        assert_eq!(dec.decode(&encoded).status, Status::SeqOutsideWindow);
        assert_eq!(dec.decode(&[0u8; 4]).status, Status::InvalidInput);
    }

    #[test]
    fn short_entropy_is_refused() {
        let mut enc = SoftEncoder::default();
        let status = enc.instantiate(
            PS,
            &mut SecretBuf::new(vec![1; 31]),
            &mut NonceValue::new(1),
        );
        assert_eq!(status, Status::EntropyTooShort);
        assert!(!enc.is_instantiated());
        assert_eq!(enc.encode(b"x").1, Status::NotInstantiated);
    }

    #[test]
    fn short_nonce_is_refused() {
        struct Tiny;
        impl NonceSource for Tiny {
            fn nonce(&mut self, _min: usize, _max: usize) -> Zeroizing<Vec<u8>> {
                Zeroizing::new(vec![1, 2, 3])
            }
        }
        let mut dec = SoftDecoder::default();
        let status = dec.instantiate(PS, &mut SecretBuf::new(vec![1; 32]), &mut Tiny);
        assert_eq!(status, Status::NonceTooShort);
    }

    #[test]
    fn restored_encoder_reproduces_output() {
        let clock = FixedClock::new(42);
        let (mut enc, _) = pair(EngineConfig::default(), &clock);
        let saved = enc.save_state().unwrap();

        let first: Vec<_> = (0..3).map(|i| enc.encode(&[i; 10]).0).collect();

        let mut fresh = SoftEncoder::with_clock(EngineConfig::default(), Arc::new(clock));
        assert_eq!(fresh.restore_state(&saved), Status::Success);
        let second: Vec<_> = (0..3).map(|i| fresh.encode(&[i; 10]).0).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn restore_with_other_configuration_is_invalid() {
        let clock = FixedClock::new(0);
        let (_, dec) = pair(EngineConfig::with_window(-2), &clock);
        let saved = dec.save_state().unwrap();

        let mut other = SoftDecoder::new(EngineConfig::with_window(2));
        assert_eq!(other.restore_state(&saved), Status::InvalidState);

        let mut encoder = SoftEncoder::new(EngineConfig::with_window(-2));
        assert_eq!(encoder.restore_state(&saved), Status::InvalidState);

        let garbage = SavedState::new(b"not json".to_vec());
        assert_eq!(other.restore_state(&garbage), Status::InvalidState);
    }

    #[test]
    fn skip_count_reports_distance() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::with_window(3), &clock);
        let _ = enc.encode(b"0");
        let _ = enc.encode(b"1");
        let (third, _) = enc.encode(b"2");
        let decoded = dec.decode(&third);
        assert_eq!(decoded.status, Status::Success);
        assert_eq!(decoded.sequence_skipped, 2);
    }

    #[test]
    fn timestamp_window_rejects_without_advancing() {
        let clock = FixedClock::new(10_000);
        let config = EngineConfig {
            sequence_window: 0,
            timestamp_window_ms: 1_000,
        };
        let (mut enc, mut dec) = pair(config, &clock);
        let (encoded, _) = enc.encode(b"late");

        clock.advance(5_000);
        let decoded = dec.decode(&encoded);
        assert_eq!(decoded.status, Status::TimestampOutsideWindow);
        assert_eq!(decoded.encode_timestamp, 10_000);
        assert_eq!(decoded.decode_timestamp, 15_000);

        clock.set(10_500);
        assert_eq!(dec.decode(&encoded).status, Status::Success);
    }

    #[test]
    fn fixed_length_pads_and_truncates() {
        let clock = FixedClock::new(0);
        let config = EngineConfig::default();
        let mut enc = FixedLengthEncoder::with_clock(config, 8, Arc::new(clock.clone()));
        let mut dec = SoftDecoder::with_clock(config, Arc::new(clock));
        instantiate(&mut enc, PS);
        instantiate(&mut dec, PS);

        let (short, _) = enc.encode(b"abc");
        let (long, _) = enc.encode(b"abcdefghijkl");
        assert_eq!(short.len(), long.len());

        assert_eq!(dec.decode(&short).data, b"abc\0\0\0\0\0");
        assert_eq!(dec.decode(&long).data, b"abcdefgh");
    }

    #[test]
    fn chunk_stream_round_trips_and_consumes_one_sequence() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);

        assert_eq!(enc.start_encrypt(), Status::Success);
        let mut a = b"first part ".to_vec();
        let mut b = b"second part".to_vec();
        assert_eq!(enc.encrypt_chunk(&mut a), Status::Success);
        assert_eq!(enc.encrypt_chunk(&mut b), Status::Success);
        let (tail, status) = enc.finish_encrypt();
        assert_eq!(status, Status::Success);
        assert_eq!(tail.len(), CHUNK_TAG_LEN);

        assert_eq!(dec.start_decrypt(), Status::Success);
        let mut plain = Vec::new();
        for part in [&a, &b, &tail] {
            let (out, status) = dec.decrypt_chunk(part);
            assert_eq!(status, Status::Success);
            plain.extend(out);
        }
        let (rest, status) = dec.finish_decrypt();
        assert_eq!(status, Status::Success);
        plain.extend(rest);
        assert_eq!(plain, b"first part second part");

        let (next, _) = enc.encode(b"after");
        assert_eq!(dec.decode(&next).data, b"after");
    }

    #[test]
    fn tampered_stream_tag_fails() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);

        enc.start_encrypt();
        let mut data = vec![9u8; 100];
        enc.encrypt_chunk(&mut data);
        let (mut tail, _) = enc.finish_encrypt();
        tail[0] ^= 1;

        dec.start_decrypt();
        dec.decrypt_chunk(&data);
        dec.decrypt_chunk(&tail);
        assert_eq!(dec.finish_decrypt().1, Status::TokenDoesNotMatch);
    }

    #[test]
    fn windows_wider_than_the_replay_mask_are_refused() {
        for window in [-100, -64, 64, i32::MIN, i32::MAX] {
            let mut dec = SoftDecoder::new(EngineConfig::with_window(window));
            assert_eq!(instantiate(&mut dec, PS), Status::InvalidInput, "window {window}");
            assert!(!dec.is_instantiated());
            assert_eq!(dec.decode(&[0u8; 64]).status, Status::NotInstantiated);

            let mut enc = SoftEncoder::new(EngineConfig::with_window(window));
            assert_eq!(instantiate(&mut enc, PS), Status::InvalidInput, "window {window}");
        }

        let clock = FixedClock::new(0);
        let (_, dec) = pair(EngineConfig::with_window(-63), &clock);
        let saved = dec.save_state().unwrap();
        let mut wide = SoftDecoder::new(EngineConfig::with_window(-100));
        assert_eq!(wide.restore_state(&saved), Status::InvalidInput);
    }

    #[test]
    fn widest_async_window_survives_far_jumps() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::with_window(-63), &clock);
        let messages: Vec<_> = (0..80u8).map(|i| enc.encode(&[i]).0).collect();

        let far = dec.decode(&messages[70]);
        assert_eq!(far.status, Status::Success);
        assert_eq!(far.data, [70]);
        assert_eq!(dec.decode(&messages[10]).data, [10]);
        assert_eq!(dec.decode(&messages[70]).status, Status::SeqOutsideWindow);
        assert_eq!(dec.decode(&messages[5]).status, Status::SeqOutsideWindow);
        assert_eq!(dec.decode(&messages[79]).data, [79]);
    }

    #[test]
    fn clones_leave_open_streams_behind() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);

        assert_eq!(enc.start_encrypt(), Status::Success);
        let mut first = b"streamed ".to_vec();
        enc.encrypt_chunk(&mut first);

        let mut copy = enc.clone();
        assert!(copy.is_instantiated());
        assert_eq!(copy.encrypt_chunk(&mut vec![1, 2]), Status::ChunkOutOfOrder);
        assert_eq!(copy.finish_encrypt().1, Status::ChunkOutOfOrder);

        let mut second = b"bytes".to_vec();
        assert_eq!(enc.encrypt_chunk(&mut second), Status::Success);
        let (tail, status) = enc.finish_encrypt();
        assert_eq!(status, Status::Success);

        assert_eq!(dec.start_decrypt(), Status::Success);
        let mut plain = dec.decrypt_chunk(&first).0;
        let mut dec_copy = dec.clone();
        assert_eq!(dec_copy.decrypt_chunk(&second).1, Status::ChunkOutOfOrder);
        plain.extend(dec.decrypt_chunk(&second).0);
        plain.extend(dec.decrypt_chunk(&tail).0);
        assert_eq!(dec.finish_decrypt().1, Status::Success);
        assert_eq!(plain, b"streamed bytes");

        // The copy kept the session: its next message follows the stream.
        let (message, _) = copy.encode(b"from the copy");
        assert_eq!(dec.decode(&message).data, b"from the copy");
    }

    #[test]
    fn chunk_calls_outside_stream_are_out_of_order() {
        let clock = FixedClock::new(0);
        let (mut enc, mut dec) = pair(EngineConfig::default(), &clock);
        assert_eq!(enc.encrypt_chunk(&mut vec![1]), Status::ChunkOutOfOrder);
        assert_eq!(enc.finish_encrypt().1, Status::ChunkOutOfOrder);
        assert_eq!(dec.decrypt_chunk(&[1]).1, Status::ChunkOutOfOrder);
        assert_eq!(enc.start_encrypt(), Status::Success);
        assert_eq!(enc.start_encrypt(), Status::ChunkOutOfOrder);
    }
}
