//! Zeroize-on-use secret buffers.
//!
//! Entropy and nonces are handed to an engine exactly once. [`SecretBuf`]
//! makes that explicit: [`SecretBuf::consume`] moves the bytes out and leaves
//! an empty, already-wiped buffer behind.

use zeroize::{Zeroize, Zeroizing};

/// A secret byte buffer that can be taken exactly once.
pub struct SecretBuf {
    bytes: Zeroizing<Vec<u8>>,
    consumed: bool,
}

/// Entropy derived from an ECDH shared secret (SHA-256 digest, 32 bytes).
pub type SharedEntropy = SecretBuf;

impl SecretBuf {
    /// Take ownership of `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            consumed: false,
        }
    }

    /// Copy `bytes` into a new buffer. The caller still owns (and should wipe)
    /// the original.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether [`consume`](Self::consume) has already been called.
    pub const fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Move the secret out. Subsequent calls return an empty buffer.
    pub fn consume(&mut self) -> Zeroizing<Vec<u8>> {
        let taken = std::mem::take(&mut *self.bytes);
        self.bytes.zeroize();
        self.consumed = true;
        Zeroizing::new(taken)
    }
}

impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBuf")
            .field("len", &self.bytes.len())
            .field("consumed", &self.consumed)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
