//! Secure item store.
//!
//! Every item is encoded by its own freshly instantiated engine: the item
//! name is the personalization string and the nonce is the write timestamp
//! XORed with the store's base nonce. The timestamp is stored in front of
//! the ciphertext (8 bytes LE) so a read can rebuild the same engine.
//!
//! Items live either in memory or as one file per name in the store
//! directory. Memory wins when both exist.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::engine::{
    Decode, Encode, EngineConfig, NonceValue, SoftDecoder, SoftEncoder, Status, SystemClock,
    TimestampSource,
};
use crate::error::{CryptoError, check};
use crate::secret::SecretBuf;

const TIMESTAMP_PREFIX: usize = 8;

/// Named, individually encrypted items.
pub struct SecureItemStore<E = SoftEncoder, D = SoftDecoder> {
    dir: PathBuf,
    entropy: Zeroizing<Vec<u8>>,
    base_nonce: u64,
    encoder: E,
    decoder: D,
    clock: Arc<dyn TimestampSource + Send + Sync>,
    memory: HashMap<String, Vec<u8>>,
}

impl SecureItemStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn open(dir: impl Into<PathBuf>, entropy: SecretBuf, nonce: u64) -> Result<Self, CryptoError> {
        Self::with_engines(
            dir,
            entropy,
            nonce,
            SoftEncoder::new(EngineConfig::default()),
            SoftDecoder::new(EngineConfig::default()),
            Arc::new(SystemClock),
        )
    }
}

impl<E: Encode + Clone, D: Decode + Clone> SecureItemStore<E, D> {
    /// Open a store with explicit engine templates and clock.
    pub fn with_engines(
        dir: impl Into<PathBuf>,
        mut entropy: SecretBuf,
        nonce: u64,
        encoder: E,
        decoder: D,
        clock: Arc<dyn TimestampSource + Send + Sync>,
    ) -> Result<Self, CryptoError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "Opened secure item store");
        Ok(Self {
            dir,
            entropy: entropy.consume(),
            base_nonce: nonce,
            encoder,
            decoder,
            clock,
            memory: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encode and store `data` under `name`, replacing any previous value
    /// in the same location.
    pub fn write(&mut self, name: &str, data: &[u8], to_memory: bool) -> Result<(), CryptoError> {
        if !to_memory {
            validate_file_name(name)?;
        }

        let timestamp = self.clock.timestamp().swap_bytes();
        let mut encoder = self.encoder.clone();
        check(
            encoder.instantiate(
                name,
                &mut SecretBuf::from_slice(&self.entropy),
                &mut NonceValue::new(timestamp ^ self.base_nonce),
            ),
            "instantiate encoder",
        )?;
        let (encoded, status) = encoder.encode(data);
        check(encoder.uninstantiate(), "uninstantiate encoder")?;
        check(status, "encode item")?;

        let mut blob = Vec::with_capacity(TIMESTAMP_PREFIX + encoded.len());
        blob.extend_from_slice(&timestamp.to_le_bytes());
        blob.extend_from_slice(&encoded);

        if to_memory {
            self.memory.insert(name.to_string(), blob);
        } else {
            std::fs::write(self.dir.join(name), blob)?;
        }
        tracing::debug!(name, to_memory, "Wrote secure item");
        Ok(())
    }

    pub fn write_str(&mut self, name: &str, value: &str, to_memory: bool) -> Result<(), CryptoError> {
        self.write(name, value.as_bytes(), to_memory)
    }

    /// Read and decode the item called `name`.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = self.load(name)?;
        if blob.len() < TIMESTAMP_PREFIX {
            return Err(CryptoError::CorruptItem(name.to_string()));
        }
        let (prefix, encoded) = blob.split_at(TIMESTAMP_PREFIX);
        let mut ts = [0u8; TIMESTAMP_PREFIX];
        ts.copy_from_slice(prefix);
        let timestamp = u64::from_le_bytes(ts);

        let mut decoder = self.decoder.clone();
        check(
            decoder.instantiate(
                name,
                &mut SecretBuf::from_slice(&self.entropy),
                &mut NonceValue::new(timestamp ^ self.base_nonce),
            ),
            "instantiate decoder",
        )?;
        let decoded = decoder.decode(encoded);
        check(decoder.uninstantiate(), "uninstantiate decoder")?;

        match decoded.status {
            Status::Success => Ok(decoded.data),
            Status::SeqOutsideWindow | Status::InvalidInput => {
                Err(CryptoError::CorruptItem(name.to_string()))
            }
            status => Err(CryptoError::engine(status, "decode item")),
        }
    }

    pub fn read_string(&self, name: &str) -> Result<String, CryptoError> {
        let bytes = self.read(name)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::CorruptItem(name.to_string()))
    }

    /// Remove one item. Removing an item that does not exist is not an error.
    pub fn remove(&mut self, name: &str) -> Result<(), CryptoError> {
        if self.memory.remove(name).is_some() {
            return Ok(());
        }
        if validate_file_name(name).is_err() {
            return Ok(());
        }
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every item, then the store directory itself.
    pub fn remove_all(&mut self) -> Result<(), CryptoError> {
        self.memory.clear();
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
        }
        std::fs::remove_dir(&self.dir)?;
        tracing::info!(dir = %self.dir.display(), "Removed secure item store");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Vec<u8>, CryptoError> {
        if let Some(blob) = self.memory.get(name) {
            return Ok(blob.clone());
        }
        validate_file_name(name).map_err(|_| CryptoError::ItemNotFound(name.to_string()))?;
        match std::fs::read(self.dir.join(name)) {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CryptoError::ItemNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<E, D> std::fmt::Debug for SecureItemStore<E, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureItemStore")
            .field("dir", &self.dir)
            .field("memory_items", &self.memory.len())
            .finish_non_exhaustive()
    }
}

/// Durable item names become file names, so they must be a single path
/// component.
fn validate_file_name(name: &str) -> Result<(), CryptoError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        return Err(CryptoError::InvalidItemName(name.to_string()));
    }
    Ok(())
}
