//! Saved engine state and the restore-operate-save cycle.
//!
//! Between operations a session exists only as a [`SavedState`]. Each
//! operation restores a fresh handle from it, runs, saves the new state and
//! uninstantiates the handle again, so at most one live handle exists per
//! role at a time.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::Zeroizing;

use crate::engine::{Decode, Decoded, Encode, Engine, EntropySource, NonceSource, Status};
use crate::error::{CryptoError, check};

/// Opaque engine snapshot. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SavedState(Zeroizing<Vec<u8>>);

impl SavedState {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.as_bytes()))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        BASE64
            .decode(encoded.trim())
            .map(Self::new)
            .map_err(|e| CryptoError::SerializationError(format!("saved state: {e}")))
    }
}

impl std::fmt::Debug for SavedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SavedState([REDACTED; {} bytes])", self.0.len())
    }
}

/// One role (encoder or decoder) of a paired session, kept as a checkpoint.
///
/// `template` is an un-instantiated handle carrying the engine configuration;
/// it is cloned whenever a live handle is needed.
#[derive(Debug, Clone)]
pub struct SessionState<E> {
    template: E,
    saved: Option<SavedState>,
}

impl<E: Engine + Clone> SessionState<E> {
    pub const fn new(template: E) -> Self {
        Self {
            template,
            saved: None,
        }
    }

    pub const fn from_saved(template: E, saved: SavedState) -> Self {
        Self {
            template,
            saved: Some(saved),
        }
    }

    pub const fn is_paired(&self) -> bool {
        self.saved.is_some()
    }

    pub const fn saved(&self) -> Option<&SavedState> {
        self.saved.as_ref()
    }

    pub const fn template(&self) -> &E {
        &self.template
    }

    /// Replace the checkpoint wholesale.
    pub fn replace(&mut self, saved: SavedState) {
        self.saved = Some(saved);
    }

    pub fn clear(&mut self) {
        self.saved = None;
    }

    /// Instantiate a fresh handle, checkpoint it and drop it.
    ///
    /// On failure the previous checkpoint (if any) is kept.
    pub fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Result<(), CryptoError> {
        let mut handle = self.template.clone();
        check(
            handle.instantiate(personalization, entropy, nonce),
            "instantiate",
        )?;
        self.checkpoint(&mut handle)
    }

    /// Save `handle` as the new checkpoint and uninstantiate it.
    pub fn checkpoint(&mut self, handle: &mut E) -> Result<(), CryptoError> {
        let saved = handle
            .save_state()
            .ok_or(CryptoError::engine(Status::NotInstantiated, "save state"))?;
        self.saved = Some(saved);
        check(handle.uninstantiate(), "uninstantiate")
    }

    /// Restore a live handle from the checkpoint. The checkpoint is not
    /// touched; commit changes with [`checkpoint`](Self::checkpoint).
    pub fn restore(&self) -> Result<E, CryptoError> {
        let saved = self.saved.as_ref().ok_or(CryptoError::NoSavedState)?;
        let mut handle = self.template.clone();
        check(handle.restore_state(saved), "restore state")?;
        Ok(handle)
    }

    /// Restore, run `op`, checkpoint.
    pub fn with_live<T>(&mut self, op: impl FnOnce(&mut E) -> T) -> Result<T, CryptoError> {
        let mut handle = self.restore()?;
        let out = op(&mut handle);
        self.checkpoint(&mut handle)?;
        Ok(out)
    }
}

impl<E: Encode + Clone> SessionState<E> {
    pub fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (encoded, status) = self.with_live(|h| h.encode(input))?;
        check(status, "encode")?;
        Ok(encoded)
    }

    pub fn encode_b64(&mut self, input: &[u8]) -> Result<String, CryptoError> {
        let (encoded, status) = self.with_live(|h| h.encode_b64(input))?;
        check(status, "encode")?;
        Ok(encoded)
    }
}

impl<E: Decode + Clone> SessionState<E> {
    /// Decode one message.
    ///
    /// Window and timestamp rejections come back as `Ok` with the rejecting
    /// status; any other engine failure is an error.
    pub fn decode(&mut self, input: &[u8]) -> Result<Decoded, CryptoError> {
        let decoded = self.with_live(|h| h.decode(input))?;
        accept_rejection(decoded)
    }

    pub fn decode_b64(&mut self, input: &str) -> Result<Decoded, CryptoError> {
        let decoded = self.with_live(|h| h.decode_b64(input))?;
        accept_rejection(decoded)
    }
}

/// Let sequencing outcomes through and turn everything else into an error.
pub(crate) fn accept_rejection(decoded: Decoded) -> Result<Decoded, CryptoError> {
    match decoded.status {
        Status::Success | Status::SeqOutsideWindow | Status::TimestampOutsideWindow => Ok(decoded),
        status => Err(CryptoError::engine(status, "decode")),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, NonceValue, SoftDecoder, SoftEncoder};
    use crate::secret::SecretBuf;

    fn paired() -> (SessionState<SoftEncoder>, SessionState<SoftDecoder>) {
        crate::test_session_pair(EngineConfig::default(), "ps").unwrap()
    }

    #[test]
    fn instantiate_leaves_only_a_checkpoint() {
        let (enc, _) = paired();
        assert!(enc.is_paired());
        assert!(!enc.template().is_instantiated());
        assert!(!enc.saved().unwrap().is_empty());
    }

    #[test]
    fn encode_and_decode_advance_the_checkpoint() {
        let (mut enc, mut dec) = paired();
        let before = enc.saved().cloned().unwrap();

        let first = enc.encode(b"one").unwrap();
        assert_ne!(enc.saved().unwrap(), &before);
        let second = enc.encode_b64(b"two").unwrap();

        assert_eq!(dec.decode(&first).unwrap().data, b"one");
        assert_eq!(dec.decode_b64(&second).unwrap().data, b"two");

        let replay = dec.decode(&first).unwrap();
        assert_eq!(replay.status, Status::SeqOutsideWindow);
    }

    #[test]
    fn failed_instantiate_keeps_previous_checkpoint() {
        let (mut enc, _) = paired();
        let before = enc.saved().cloned().unwrap();
        let err = enc
            .instantiate("ps", &mut SecretBuf::new(vec![]), &mut NonceValue::new(1))
            .unwrap_err();
        assert_eq!(err.status(), Some(Status::EntropyTooShort));
        assert_eq!(enc.saved().unwrap(), &before);
    }

    #[test]
    fn restore_without_checkpoint_fails() {
        let state = SessionState::new(SoftEncoder::default());
        assert!(matches!(state.restore(), Err(CryptoError::NoSavedState)));
    }

    #[test]
    fn saved_state_base64_round_trip_and_redaction() {
        let (enc, _) = paired();
        let saved = enc.saved().unwrap();
        let restored = SavedState::from_base64(&saved.to_base64()).unwrap();
        assert_eq!(&restored, saved);
        assert!(format!("{saved:?}").contains("REDACTED"));
        assert!(SavedState::from_base64("!!").is_err());
    }
}
