//! Cryptographic engine contract.
//!
//! Everything above this module (sessions, chunk streams, the item store,
//! pairing) talks to an engine only through these traits and only looks at
//! the returned [`Status`]. Entropy, nonce and time are supplied through
//! strategy objects passed to `instantiate` rather than registered callbacks.
//!
//! [`soft`] provides the engine shipped with the workspace.

pub mod soft;
pub mod sources;
mod window;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::Zeroizing;

use crate::state::SavedState;

pub use soft::{EngineConfig, FixedLengthEncoder, SoftDecoder, SoftEncoder};
pub use sources::{FixedClock, NonceValue, SeedNonce, SystemClock};
pub use window::MAX_WINDOW;

/// Closed set of engine result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Success,
    /// The message's sequence number is not acceptable to the decoder
    /// (replayed, too old, too far ahead, or not authentic).
    SeqOutsideWindow,
    /// A chunk stream's trailing token did not verify.
    TokenDoesNotMatch,
    /// Encode and decode timestamps differ by more than the configured window.
    TimestampOutsideWindow,
    EntropyTooShort,
    NonceTooShort,
    /// A saved state could not be parsed or belongs to another configuration.
    InvalidState,
    NotInstantiated,
    InvalidInput,
    /// Chunk operation called outside a started stream.
    ChunkOutOfOrder,
    /// The encoder has used every sequence number.
    SequenceExhausted,
}

impl Status {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::SeqOutsideWindow => "SeqOutsideWindow",
            Self::TokenDoesNotMatch => "TokenDoesNotMatch",
            Self::TimestampOutsideWindow => "TimestampOutsideWindow",
            Self::EntropyTooShort => "EntropyTooShort",
            Self::NonceTooShort => "NonceTooShort",
            Self::InvalidState => "InvalidState",
            Self::NotInstantiated => "NotInstantiated",
            Self::InvalidInput => "InvalidInput",
            Self::ChunkOutOfOrder => "ChunkOutOfOrder",
            Self::SequenceExhausted => "SequenceExhausted",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Success => "The operation completed successfully.",
            Self::SeqOutsideWindow => "Sequence number is outside the decoder window.",
            Self::TokenDoesNotMatch => "Verification token does not match.",
            Self::TimestampOutsideWindow => "Timestamp is outside the allowed window.",
            Self::EntropyTooShort => "Entropy input is shorter than the engine minimum.",
            Self::NonceTooShort => "Nonce is shorter than the engine minimum.",
            Self::InvalidState => "Saved state is invalid for this engine.",
            Self::NotInstantiated => "The engine has not been instantiated.",
            Self::InvalidInput => "Input is malformed.",
            Self::ChunkOutOfOrder => "Chunk operation called outside a started stream.",
            Self::SequenceExhausted => "No sequence numbers remain.",
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Supplies instantiation entropy.
///
/// `instantiate` asks for entropy exactly once, before it asks the
/// [`NonceSource`]. Sources may rely on that order to hand the nonce over.
pub trait EntropySource {
    /// Return between `min_len` and `max_len` bytes. Returning fewer than
    /// `min_len` is allowed; the engine reports [`Status::EntropyTooShort`].
    fn entropy(&mut self, min_len: usize, max_len: usize) -> Result<Zeroizing<Vec<u8>>, Status>;
}

/// Supplies the instantiation nonce.
///
/// Only called after [`EntropySource::entropy`] succeeded, and at most once
/// per instantiation.
pub trait NonceSource {
    /// Fewer than `min_len` bytes makes the engine report
    /// [`Status::NonceTooShort`].
    fn nonce(&mut self, min_len: usize, max_len: usize) -> Zeroizing<Vec<u8>>;
}

/// Millisecond clock used for message timestamps.
pub trait TimestampSource {
    fn timestamp(&self) -> u64;
}

/// Lifecycle shared by encoders and decoders.
pub trait Engine {
    fn instantiate(
        &mut self,
        personalization: &str,
        entropy: &mut dyn EntropySource,
        nonce: &mut dyn NonceSource,
    ) -> Status;

    /// Snapshot the full internal state. `None` when not instantiated.
    fn save_state(&self) -> Option<SavedState>;

    fn restore_state(&mut self, state: &SavedState) -> Status;

    fn uninstantiate(&mut self) -> Status;

    fn is_instantiated(&self) -> bool;
}

pub trait Encode: Engine {
    fn encode(&mut self, input: &[u8]) -> (Vec<u8>, Status);

    /// Encode and return the result as base64.
    fn encode_b64(&mut self, input: &[u8]) -> (String, Status) {
        let (encoded, status) = self.encode(input);
        if status.is_error() {
            return (String::new(), status);
        }
        (BASE64.encode(encoded), status)
    }

    fn encode_str(&mut self, input: &str) -> (String, Status) {
        self.encode_b64(input.as_bytes())
    }
}

/// Result of a single decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub data: Vec<u8>,
    pub status: Status,
    /// How far ahead of the decoder's base the message was.
    pub sequence_skipped: u32,
    pub decode_timestamp: u64,
    pub encode_timestamp: u64,
}

impl Decoded {
    pub fn rejected(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub const fn is_success(&self) -> bool {
        !self.status.is_error()
    }
}

pub trait Decode: Engine {
    fn decode(&mut self, input: &[u8]) -> Decoded;

    /// Configured signed sequence window.
    fn sequence_window(&self) -> i32;

    fn decode_b64(&mut self, input: &str) -> Decoded {
        match BASE64.decode(input.trim()) {
            Ok(bytes) => self.decode(&bytes),
            Err(_) => Decoded::rejected(Status::InvalidInput),
        }
    }

    /// Decode base64 input to a UTF-8 string.
    fn decode_str(&mut self, input: &str) -> (String, Status) {
        let decoded = self.decode_b64(input);
        if decoded.status.is_error() {
            return (String::new(), decoded.status);
        }
        match String::from_utf8(decoded.data) {
            Ok(s) => (s, Status::Success),
            Err(_) => (String::new(), Status::InvalidInput),
        }
    }
}

/// Streaming encryption: start, any number of chunks, finish.
pub trait ChunkEncrypt: Engine {
    fn start_encrypt(&mut self) -> Status;

    /// Encrypt `data` in place. The output length may differ from the input.
    fn encrypt_chunk(&mut self, data: &mut Vec<u8>) -> Status;

    /// Final bytes that terminate the stream.
    fn finish_encrypt(&mut self) -> (Vec<u8>, Status);
}

pub trait ChunkDecrypt: Engine {
    fn start_decrypt(&mut self) -> Status;

    fn decrypt_chunk(&mut self, data: &[u8]) -> (Vec<u8>, Status);

    fn finish_decrypt(&mut self) -> (Vec<u8>, Status);
}
