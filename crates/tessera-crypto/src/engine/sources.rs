//! Entropy, nonce and timestamp strategies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use zeroize::{Zeroize, Zeroizing};

use super::{EntropySource, NonceSource, Status, TimestampSource};
use crate::secret::SecretBuf;

/// One-shot entropy: the buffer is consumed (and wiped) on first use.
impl EntropySource for SecretBuf {
    fn entropy(&mut self, _min_len: usize, max_len: usize) -> Result<Zeroizing<Vec<u8>>, Status> {
        let mut bytes = self.consume();
        bytes.truncate(max_len);
        Ok(bytes)
    }
}

/// A 64-bit nonce, supplied once and then zeroed.
///
/// Encoded little-endian and zero-padded up to the engine minimum.
pub struct NonceValue {
    value: u64,
}

impl NonceValue {
    pub const fn new(value: u64) -> Self {
        Self { value }
    }
}

impl NonceSource for NonceValue {
    fn nonce(&mut self, min_len: usize, max_len: usize) -> Zeroizing<Vec<u8>> {
        let bytes = le_padded(self.value, min_len, max_len);
        self.value.zeroize();
        bytes
    }
}

impl Drop for NonceValue {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Deterministic nonce derived from a fixed seed.
///
/// Unlike [`NonceValue`] this can be handed to any number of
/// instantiations, so both ends can derive it without a handshake.
#[derive(Debug, Clone, Copy)]
pub struct SeedNonce {
    seed: u64,
}

impl SeedNonce {
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl NonceSource for SeedNonce {
    fn nonce(&mut self, min_len: usize, max_len: usize) -> Zeroizing<Vec<u8>> {
        le_padded(self.seed, min_len, max_len)
    }
}

/// `value` as LE bytes, capped at `max_len` and zero-padded to `min_len`.
fn le_padded(value: u64, min_len: usize, max_len: usize) -> Zeroizing<Vec<u8>> {
    let mut raw = value.to_le_bytes();
    let copied = raw.len().min(max_len);
    let mut out = Zeroizing::new(vec![0u8; copied.max(min_len)]);
    out[..copied].copy_from_slice(&raw[..copied]);
    raw.zeroize();
    out
}

/// Wall clock in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimestampSource for SystemClock {
    fn timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct FixedClock {
    now: Arc<AtomicU64>,
}

impl FixedClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }
}

impl TimestampSource for FixedClock {
    fn timestamp(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
