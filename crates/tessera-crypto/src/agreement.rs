//! P-256 key agreement for pairing.
//!
//! Each pairing generates a fresh keypair, sends its public key to the peer
//! as base64 DER (SubjectPublicKeyInfo), and hashes the ECDH shared secret
//! with SHA-256 to get the entropy that seeds the session engine.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::ecdh::diffie_hellman;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::secret::SharedEntropy;

/// Size of the derived entropy in bytes.
pub const ENTROPY_SIZE: usize = 32;

/// Ephemeral P-256 keypair for a single pairing.
///
/// Consumed by [`KeyPair::derive_shared_entropy`], so one keypair can only
/// ever seed one session.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh in-process keypair from the OS RNG.
    pub fn generate() -> Self {
        tracing::debug!("Generating P-256 pairing key");
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public key as DER SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.public
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::AgreementFailed(format!("encode public key: {e}")))
    }

    /// Public key as base64 DER, the form sent in a pairing request.
    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        self.public_key_der().map(|der| BASE64.encode(der))
    }

    /// Run ECDH against the peer's base64 DER public key and hash the result.
    ///
    /// The raw shared secret and the intermediate digest are wiped before
    /// returning. The keypair is dropped (and its scalar zeroized) here.
    pub fn derive_shared_entropy(self, remote_b64: &str) -> Result<SharedEntropy, CryptoError> {
        let remote = parse_remote_key(remote_b64)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), remote.as_affine());

        let mut digest = Sha256::digest(shared.raw_secret_bytes());
        let entropy = SharedEntropy::from_slice(digest.as_slice());
        digest.as_mut_slice().zeroize();

        Ok(entropy)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn parse_remote_key(remote_b64: &str) -> Result<PublicKey, CryptoError> {
    let der = BASE64
        .decode(remote_b64.trim())
        .map_err(|e| CryptoError::InvalidRemoteKey(format!("not base64: {e}")))?;
    PublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::InvalidRemoteKey(format!("not a P-256 public key: {e}")))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_entropy() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let alice_pub = alice.public_key_base64().unwrap();
        let bob_pub = bob.public_key_base64().unwrap();

        let mut a = alice.derive_shared_entropy(&bob_pub).unwrap();
        let mut b = bob.derive_shared_entropy(&alice_pub).unwrap();

        assert_eq!(a.len(), ENTROPY_SIZE);
        assert_eq!(a.consume().as_slice(), b.consume().as_slice());
    }

    #[test]
    fn different_peers_give_different_entropy() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let carol_pub = carol.public_key_base64().unwrap();

        let mut ab = alice
            .derive_shared_entropy(&bob.public_key_base64().unwrap())
            .unwrap();
        let mut bc = bob.derive_shared_entropy(&carol_pub).unwrap();
        assert_ne!(ab.consume().as_slice(), bc.consume().as_slice());
    }

    #[test]
    fn public_key_is_spki_der() {
        let kp = KeyPair::generate();
        let der = kp.public_key_der().unwrap();
        // SEQUENCE header, 91 bytes total for an uncompressed P-256 SPKI.
        assert_eq!(der[0], 0x30);
        assert_eq!(der.len(), 91);
        assert!(PublicKey::from_public_key_der(&der).is_ok());
    }

    #[test]
    fn rejects_non_base64_remote_key() {
        let kp = KeyPair::generate();
        let err = kp.derive_shared_entropy("not base64 !!").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidRemoteKey(_)));
    }

    #[test]
    fn rejects_garbage_der() {
        let kp = KeyPair::generate();
        let junk = BASE64.encode([0x30, 0x03, 0x01, 0x02, 0x03]);
        let err = kp.derive_shared_entropy(&junk).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidRemoteKey(_)));
    }

    #[test]
    fn debug_redacts_secret() {
        let dbg = format!("{:?}", KeyPair::generate());
        assert!(dbg.contains("REDACTED"));
    }
}
