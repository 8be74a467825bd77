//! Decoder sessions with an explicit sequencing policy.

use crate::engine::{Decode, Decoded, EngineConfig, EntropySource, NonceSource, SoftDecoder};
use crate::error::{CryptoError, check};
use crate::state::{SavedState, accept_rejection};

pub use crate::engine::MAX_WINDOW;

/// Which sequence numbers a decoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceWindow {
    /// Only the next sequence number, exactly once.
    VerificationOnly,
    /// Up to `n` ahead of the next expected sequence, never backwards.
    ForwardOnly(u8),
    /// Reordering within `n` of the base, each sequence at most once.
    Async(u8),
}

impl SequenceWindow {
    /// Convert from the signed form used in configuration:
    /// `0`, `n > 0` forward-only, `n < 0` async.
    pub fn from_raw(raw: i32) -> Result<Self, CryptoError> {
        let magnitude = u8::try_from(raw.unsigned_abs())
            .ok()
            .filter(|m| *m <= MAX_WINDOW)
            .ok_or(CryptoError::WindowOutOfRange(raw))?;
        Ok(match raw {
            0 => Self::VerificationOnly,
            r if r > 0 => Self::ForwardOnly(magnitude),
            _ => Self::Async(magnitude),
        })
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::VerificationOnly => 0,
            Self::ForwardOnly(n) => i32::from(n),
            Self::Async(n) => -i32::from(n),
        }
    }
}

/// Lifecycle of a [`SequencedSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninstantiated,
    Ready,
    /// Terminal.
    Closed,
}

impl SessionPhase {
    const fn name(self) -> &'static str {
        match self {
            Self::Uninstantiated => "uninstantiated",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

/// A live decoder plus the window it was configured with.
///
/// Rejected messages do not change the phase: [`decode`](Self::decode)
/// returns them as `Ok` with [`Status::SeqOutsideWindow`](crate::engine::Status::SeqOutsideWindow)
/// so callers handle them as ordinary control flow.
#[derive(Debug)]
pub struct SequencedSession<D> {
    decoder: D,
    window: SequenceWindow,
    phase: SessionPhase,
}

impl SequencedSession<SoftDecoder> {
    pub fn new(window: SequenceWindow) -> Self {
        Self {
            decoder: SoftDecoder::new(EngineConfig::with_window(window.as_raw())),
            window,
            phase: SessionPhase::Uninstantiated,
        }
    }
}

impl<D: Decode> SequencedSession<D> {
    /// Wrap an existing decoder. Its configured window must match `window`.
    pub fn with_decoder(decoder: D, window: SequenceWindow) -> Result<Self, CryptoError> {
        let actual = decoder.sequence_window();
        if actual != window.as_raw() {
            return Err(CryptoError::WindowMismatch {
                expected: window.as_raw(),
                actual,
            });
        }
        let phase = if decoder.is_instantiated() {
            SessionPhase::Ready
        } else {
            SessionPhase::Uninstantiated
        };
        Ok(Self {
            decoder,
            window,
            phase,
        })
    }

    pub const fn window(&self) -> SequenceWindow {
        self.window
    }

    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Result<(), CryptoError> {
        self.require(SessionPhase::Uninstantiated)?;
        check(
            self.decoder.instantiate(personalization, entropy, nonce),
            "instantiate",
        )?;
        self.phase = SessionPhase::Ready;
        tracing::debug!(window = self.window.as_raw(), "Sequenced session ready");
        Ok(())
    }

    pub fn decode(&mut self, input: &[u8]) -> Result<Decoded, CryptoError> {
        self.require(SessionPhase::Ready)?;
        let decoded = self.decoder.decode(input);
        if decoded.status.is_error() {
            tracing::debug!(status = decoded.status.name(), "Message rejected");
        }
        accept_rejection(decoded)
    }

    pub fn decode_b64(&mut self, input: &str) -> Result<Decoded, CryptoError> {
        self.require(SessionPhase::Ready)?;
        accept_rejection(self.decoder.decode_b64(input))
    }

    pub fn save_state(&self) -> Result<SavedState, CryptoError> {
        self.require(SessionPhase::Ready)?;
        self.decoder
            .save_state()
            .ok_or(CryptoError::InvalidPhase(SessionPhase::Uninstantiated.name()))
    }

    /// Replace the decoder's state. Allowed before instantiation as well,
    /// which is how a session resumes from a checkpoint.
    pub fn restore_state(&mut self, state: &SavedState) -> Result<(), CryptoError> {
        if self.phase == SessionPhase::Closed {
            return Err(CryptoError::InvalidPhase(self.phase.name()));
        }
        check(self.decoder.restore_state(state), "restore state")?;
        self.phase = SessionPhase::Ready;
        Ok(())
    }

    pub fn uninstantiate(&mut self) -> Result<(), CryptoError> {
        if self.phase == SessionPhase::Closed {
            return Ok(());
        }
        let status = self.decoder.uninstantiate();
        self.phase = SessionPhase::Closed;
        check(status, "uninstantiate")
    }

    fn require(&self, phase: SessionPhase) -> Result<(), CryptoError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(CryptoError::InvalidPhase(self.phase.name()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{Encode, Engine, NonceValue, SoftEncoder, Status};
    use crate::secret::SecretBuf;

    const PS: &str = "sequencing";

    fn session(window: SequenceWindow) -> SequencedSession<SoftDecoder> {
        let mut s = SequencedSession::new(window);
        s.instantiate(PS, &mut SecretBuf::new(vec![8; 32]), &mut NonceValue::new(5))
            .unwrap();
        s
    }

    /// Messages with sequence numbers 0..count.
    fn messages(window: SequenceWindow, count: usize) -> Vec<Vec<u8>> {
        let mut enc = SoftEncoder::new(EngineConfig::with_window(window.as_raw()));
        enc.instantiate(PS, &mut SecretBuf::new(vec![8; 32]), &mut NonceValue::new(5));
        (0..count)
            .map(|i| enc.encode(format!("seq{i}").as_bytes()).0)
            .collect()
    }

    fn status(s: &mut SequencedSession<SoftDecoder>, msg: &[u8]) -> Status {
        s.decode(msg).unwrap().status
    }

    #[test]
    fn verification_only_window() {
        let w = SequenceWindow::VerificationOnly;
        let m = messages(w, 3);
        let mut s = session(w);

        assert_eq!(status(&mut s, &m[0]), Status::Success);
        assert_eq!(status(&mut s, &m[0]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[2]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[1]), Status::Success);
        assert_eq!(status(&mut s, &m[2]), Status::Success);
        assert_eq!(s.phase(), SessionPhase::Ready);
    }

    #[test]
    fn forward_only_window() {
        let w = SequenceWindow::ForwardOnly(2);
        let m = messages(w, 4);
        let mut s = session(w);

        assert_eq!(status(&mut s, &m[0]), Status::Success);
        assert_eq!(status(&mut s, &m[0]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[2]), Status::Success);
        assert_eq!(status(&mut s, &m[1]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[2]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[3]), Status::Success);
    }

    #[test]
    fn async_window_and_restore() {
        let w = SequenceWindow::Async(2);
        let m = messages(w, 4);
        let mut s = session(w);
        let fresh = s.save_state().unwrap();

        assert_eq!(status(&mut s, &m[0]), Status::Success);
        assert_eq!(status(&mut s, &m[2]), Status::Success);
        let reordered = s.decode(&m[1]).unwrap();
        assert_eq!(reordered.status, Status::Success);
        assert_eq!(reordered.data, b"seq1");

        s.restore_state(&fresh).unwrap();
        assert_eq!(status(&mut s, &m[3]), Status::Success);
        assert_eq!(status(&mut s, &m[0]), Status::SeqOutsideWindow);
        assert_eq!(status(&mut s, &m[2]), Status::Success);
        assert_eq!(status(&mut s, &m[1]), Status::Success);
    }

    #[test]
    fn restored_session_matches_fresh_session() {
        let w = SequenceWindow::Async(2);
        let m = messages(w, 4);
        let order = [3, 0, 2, 1];

        let mut fresh = session(w);
        let saved = fresh.save_state().unwrap();
        let from_scratch: Vec<_> = order.iter().map(|&i| fresh.decode(&m[i]).unwrap()).collect();

        let mut resumed = SequencedSession::new(w);
        resumed.restore_state(&saved).unwrap();
        let from_restore: Vec<_> = order.iter().map(|&i| resumed.decode(&m[i]).unwrap()).collect();

        for (a, b) in from_scratch.iter().zip(&from_restore) {
            assert_eq!(a.status, b.status);
            assert_eq!(a.data, b.data);
            assert_eq!(a.sequence_skipped, b.sequence_skipped);
        }
    }

    #[test]
    fn window_conversion() {
        for raw in [-63, -2, 0, 2, 63] {
            assert_eq!(SequenceWindow::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(
            SequenceWindow::from_raw(-5).unwrap(),
            SequenceWindow::Async(5)
        );
        assert!(matches!(
            SequenceWindow::from_raw(64),
            Err(CryptoError::WindowOutOfRange(64))
        ));
        assert!(SequenceWindow::from_raw(i32::MIN).is_err());
    }

    #[test]
    fn decoder_with_other_window_is_rejected() {
        let decoder = SoftDecoder::new(EngineConfig::with_window(3));
        let err = SequencedSession::with_decoder(decoder, SequenceWindow::Async(3)).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::WindowMismatch {
                expected: -3,
                actual: 3
            }
        ));
    }

    #[test]
    fn phases_are_enforced() {
        let mut s = SequencedSession::new(SequenceWindow::VerificationOnly);
        assert!(matches!(
            s.decode(b"anything"),
            Err(CryptoError::InvalidPhase("uninstantiated"))
        ));

        s.instantiate(PS, &mut SecretBuf::new(vec![8; 32]), &mut NonceValue::new(5))
            .unwrap();
        s.uninstantiate().unwrap();
        assert_eq!(s.phase(), SessionPhase::Closed);
        assert!(s.decode(b"anything").is_err());
        assert!(s.save_state().is_err());
        assert!(s.uninstantiate().is_ok());
    }

    #[test]
    fn malformed_input_is_an_error() {
        let mut s = session(SequenceWindow::VerificationOnly);
        let err = s.decode(b"short").unwrap_err();
        assert_eq!(err.status(), Some(Status::InvalidInput));
        assert_eq!(s.phase(), SessionPhase::Ready);
    }
}
