//! Chunked stream cipher sessions.
//!
//! A stream is started from a [`SessionState`] checkpoint, fed any number of
//! chunks and finished. The checkpoint only moves forward on a successful
//! finish; a failed chunk aborts the handle and leaves it untouched.

use crate::engine::{ChunkDecrypt, ChunkEncrypt, Status};
use crate::error::{CryptoError, check};
use crate::state::{SavedState, SessionState};

/// Live encrypting stream.
#[derive(Debug)]
pub struct EncryptHandle<E> {
    engine: E,
    aborted: bool,
}

impl<E: ChunkEncrypt> EncryptHandle<E> {
    /// Encrypt `chunk` in place.
    pub fn encrypt_chunk(&mut self, chunk: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.aborted {
            return Err(CryptoError::StreamAborted);
        }
        let status = self.engine.encrypt_chunk(chunk);
        self.abort_on(status, "encrypt chunk")
    }

    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn abort_on(&mut self, status: Status, context: &'static str) -> Result<(), CryptoError> {
        if status.is_error() {
            self.aborted = true;
            tracing::warn!(status = status.name(), context, "Chunk stream aborted");
        }
        check(status, context)
    }

    /// Finish the stream detached from its [`SessionState`]. The caller
    /// commits the returned checkpoint with [`SessionState::replace`].
    pub fn finish(mut self) -> Result<(Vec<u8>, SavedState), CryptoError> {
        if self.aborted {
            return Err(CryptoError::StreamAborted);
        }
        let (tail, status) = self.engine.finish_encrypt();
        check(status, "finish encrypt")?;
        let saved = self
            .engine
            .save_state()
            .ok_or(CryptoError::engine(Status::NotInstantiated, "save state"))?;
        check(self.engine.uninstantiate(), "uninstantiate")?;
        Ok((tail, saved))
    }
}

/// Live decrypting stream.
#[derive(Debug)]
pub struct DecryptHandle<D> {
    engine: D,
    aborted: bool,
}

impl<D: ChunkDecrypt> DecryptHandle<D> {
    /// Decrypt one chunk. May return fewer bytes than given while the
    /// stream trailer is still outstanding.
    pub fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.aborted {
            return Err(CryptoError::StreamAborted);
        }
        let (plain, status) = self.engine.decrypt_chunk(chunk);
        if status.is_error() {
            self.aborted = true;
            tracing::warn!(status = status.name(), "Chunk stream aborted");
        }
        check(status, "decrypt chunk")?;
        Ok(plain)
    }

    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn finish(mut self) -> Result<(Vec<u8>, SavedState), CryptoError> {
        if self.aborted {
            return Err(CryptoError::StreamAborted);
        }
        let (tail, status) = self.engine.finish_decrypt();
        check(status, "finish decrypt")?;
        let saved = self
            .engine
            .save_state()
            .ok_or(CryptoError::engine(Status::NotInstantiated, "save state"))?;
        check(self.engine.uninstantiate(), "uninstantiate")?;
        Ok((tail, saved))
    }
}

impl<E: ChunkEncrypt + Clone> SessionState<E> {
    pub fn start_encrypt(&self) -> Result<EncryptHandle<E>, CryptoError> {
        let mut engine = self.restore()?;
        check(engine.start_encrypt(), "start encrypt")?;
        Ok(EncryptHandle {
            engine,
            aborted: false,
        })
    }

    /// Finish the stream, commit the new checkpoint and return the final bytes.
    pub fn finish_encrypt(&mut self, handle: EncryptHandle<E>) -> Result<Vec<u8>, CryptoError> {
        let (tail, saved) = handle.finish()?;
        self.replace(saved);
        Ok(tail)
    }
}

impl<D: ChunkDecrypt + Clone> SessionState<D> {
    pub fn start_decrypt(&self) -> Result<DecryptHandle<D>, CryptoError> {
        let mut engine = self.restore()?;
        check(engine.start_decrypt(), "start decrypt")?;
        Ok(DecryptHandle {
            engine,
            aborted: false,
        })
    }

    pub fn finish_decrypt(&mut self, handle: DecryptHandle<D>) -> Result<Vec<u8>, CryptoError> {
        let (tail, saved) = handle.finish()?;
        self.replace(saved);
        Ok(tail)
    }
}
