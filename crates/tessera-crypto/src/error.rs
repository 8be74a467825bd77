//! Crypto error types.

use crate::engine::Status;

/// Errors from handshake, session and item store operations.
///
/// Sequencing rejections are not errors: they come back as a
/// [`Status::SeqOutsideWindow`] inside a successful decode result.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid remote public key: {0}")]
    InvalidRemoteKey(String),

    #[error("Key agreement failed: {0}")]
    AgreementFailed(String),

    #[error("{context} failed: Status: {}. Description: {}", .status.name(), .status.description())]
    Engine { status: Status, context: &'static str },

    #[error("No saved state for this session")]
    NoSavedState,

    #[error("Operation not allowed while session is {0}")]
    InvalidPhase(&'static str),

    #[error("Decoder window mismatch: expected {expected}, decoder uses {actual}")]
    WindowMismatch { expected: i32, actual: i32 },

    #[error("Sequence window {0} is outside -63..=63")]
    WindowOutOfRange(i32),

    #[error("Chunk stream aborted after an earlier failure")]
    StreamAborted,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item is corrupt: {0}")]
    CorruptItem(String),

    #[error("Invalid item name: {0:?}")]
    InvalidItemName(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CryptoError {
    /// Wrap a non-success engine status.
    pub const fn engine(status: Status, context: &'static str) -> Self {
        Self::Engine { status, context }
    }

    /// The engine status behind this error, if any.
    pub const fn status(&self) -> Option<Status> {
        match self {
            Self::Engine { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convert an engine status into `Ok(())` or a [`CryptoError::Engine`].
pub(crate) fn check(status: Status, context: &'static str) -> Result<(), CryptoError> {
    if status.is_error() {
        Err(CryptoError::engine(status, context))
    } else {
        Ok(())
    }
}
