//! A paired encoder/decoder pair talking to one peer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tracing::{info, warn};

use tessera_core::Config;
use tessera_crypto::{
    ChunkEncrypt, CryptoError, Decoded, Encode, EngineConfig, FixedLengthEncoder, SessionState,
    SoftDecoder, SoftEncoder, new_personalization_string,
};

use crate::pairing::{PairRole, PairingCoordinator, PairingError};
use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not paired")]
    NotPaired,

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload stream ended before it was finished")]
    UploadIncomplete,
}

/// Client side of a secure channel.
///
/// Holds the encoder and decoder checkpoints; every operation restores a live
/// handle, uses it and saves it back.
pub struct SecureChannel<T, E = SoftEncoder> {
    transport: Arc<T>,
    coordinator: PairingCoordinator<T>,
    encoder: SessionState<E>,
    decoder: SessionState<SoftDecoder>,
    fixed_length: Option<usize>,
    chunk_size: usize,
}

pub(crate) fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        sequence_window: config.session.sequence_window,
        timestamp_window_ms: config.session.timestamp_window_ms,
    }
}

impl<T: PeerTransport> SecureChannel<T> {
    pub fn new(transport: Arc<T>, runtime: Handle, config: &Config) -> Self {
        let engine = engine_config(config);
        Self::with_encoder(transport, runtime, config, SoftEncoder::new(engine), None)
    }
}

impl<T: PeerTransport> SecureChannel<T, FixedLengthEncoder> {
    /// Channel whose messages are padded or truncated to
    /// `config.session.fixed_length` bytes.
    pub fn fixed_length(transport: Arc<T>, runtime: Handle, config: &Config) -> Self {
        let length = config.session.fixed_length;
        let encoder = FixedLengthEncoder::new(engine_config(config), length);
        Self::with_encoder(transport, runtime, config, encoder, Some(length))
    }
}

impl<T: PeerTransport, E: Encode + Clone + Send + 'static> SecureChannel<T, E> {
    fn with_encoder(
        transport: Arc<T>,
        runtime: Handle,
        config: &Config,
        encoder: E,
        fixed_length: Option<usize>,
    ) -> Self {
        let coordinator = PairingCoordinator::new(
            Arc::clone(&transport),
            runtime,
            Duration::from_secs(config.pairing.entropy_timeout_secs),
        );
        Self {
            transport,
            coordinator,
            encoder: SessionState::new(encoder),
            decoder: SessionState::new(SoftDecoder::new(engine_config(config))),
            fixed_length,
            chunk_size: config.stream.chunk_size,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.encoder.is_paired() && self.decoder.is_paired()
    }

    /// Pair the encoder, then the decoder, each under a fresh
    /// personalization string.
    ///
    /// A failure leaves the channel unpaired.
    pub async fn pair(&mut self) -> Result<(), ChannelError> {
        self.encoder.clear();
        self.decoder.clear();

        let saved = self
            .coordinator
            .pair(
                PairRole::Encoder,
                new_personalization_string(),
                self.encoder.template().clone(),
            )
            .await?;
        self.encoder.replace(saved);

        let saved = self
            .coordinator
            .pair(
                PairRole::Decoder,
                new_personalization_string(),
                self.decoder.template().clone(),
            )
            .await;
        match saved {
            Ok(saved) => self.decoder.replace(saved),
            Err(e) => {
                self.encoder.clear();
                return Err(e.into());
            }
        }
        info!("Channel paired");
        Ok(())
    }

    /// Send one message and decode the peer's reply.
    ///
    /// A reply rejected by the decoder's window comes back as `Ok` with the
    /// rejecting status.
    pub async fn send(&mut self, message: &[u8]) -> Result<Decoded, ChannelError> {
        if !self.is_paired() {
            return Err(ChannelError::NotPaired);
        }
        let encoded = self.encoder.encode_b64(message)?;
        let reply = self
            .transport
            .send_data(encoded, self.fixed_length)
            .await?;
        let decoded = self.decoder.decode_b64(reply.trim())?;
        if !decoded.is_success() {
            warn!(status = decoded.status.name(), "Reply rejected");
        }
        Ok(decoded)
    }
}

impl<T: PeerTransport, E> SecureChannel<T, E>
where
    E: Encode + ChunkEncrypt + Clone + Send + 'static,
{
    /// Stream `path` to the peer, chunk-encrypted.
    ///
    /// The encoder checkpoint is only committed once the whole file has been
    /// sent and the peer accepted it.
    pub async fn upload_file(&mut self, path: &Path) -> Result<String, ChannelError> {
        if !self.is_paired() {
            return Err(ChannelError::NotPaired);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mut file = tokio::fs::File::open(path).await?;
        let mut handle = self.encoder.start_encrypt()?;
        let chunk_size = self.chunk_size;
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let body = async_stream::stream! {
            let mut buf = vec![0u8; chunk_size];
            loop {
                let read = match file.read(&mut buf).await {
                    Ok(read) => read,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if read == 0 {
                    break;
                }
                let mut chunk = buf[..read].to_vec();
                if let Err(e) = handle.encrypt_chunk(&mut chunk) {
                    yield Err(std::io::Error::other(e));
                    return;
                }
                yield Ok(chunk);
            }
            match handle.finish() {
                Ok((tail, saved)) => {
                    let _ = done_tx.send(saved);
                    yield Ok(tail);
                }
                Err(e) => yield Err(std::io::Error::other(e)),
            }
        };

        info!(name = %name, chunk_size, "Uploading");
        let response = self.transport.upload(&name, body).await?;
        let saved = done_rx.await.map_err(|_| ChannelError::UploadIncomplete)?;
        self.encoder.replace(saved);
        info!(name = %name, "Upload finished");
        Ok(response)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPeer;
    use std::io::Write;
    use tessera_crypto::Status;

    fn channel(peer: &Arc<LoopbackPeer>, config: &Config) -> SecureChannel<LoopbackPeer> {
        SecureChannel::new(Arc::clone(peer), Handle::current(), config)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_echoes_through_peer() {
        let peer = Arc::new(LoopbackPeer::default());
        let mut channel = channel(&peer, &Config::default());
        channel.pair().await.unwrap();
        assert!(channel.is_paired());

        for message in ["hello", "second", ""] {
            let reply = channel.send(message.as_bytes()).await.unwrap();
            assert_eq!(reply.status, Status::Success);
            assert_eq!(reply.data, message.as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unpaired_channel_refuses_to_send() {
        let peer = Arc::new(LoopbackPeer::default());
        let mut channel = channel(&peer, &Config::default());
        assert!(matches!(
            channel.send(b"x").await,
            Err(ChannelError::NotPaired)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fixed_length_messages_are_padded() {
        let peer = Arc::new(LoopbackPeer::default());
        let mut config = Config::default();
        config.session.fixed_length = 16;
        let mut channel = SecureChannel::fixed_length(Arc::clone(&peer), Handle::current(), &config);
        channel.pair().await.unwrap();

        let reply = channel.send(b"short").await.unwrap();
        assert_eq!(reply.data.len(), 16);
        assert!(reply.data.starts_with(b"short"));

        let reply = channel.send(&[b'x'; 40]).await.unwrap();
        assert_eq!(reply.data, [b'x'; 16]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_streams_file_and_stays_in_step() {
        let peer = Arc::new(LoopbackPeer::default());
        let mut config = Config::default();
        config.stream.chunk_size = 100;
        let mut channel = channel(&peer, &config);
        channel.pair().await.unwrap();

        let contents: Vec<u8> = (0..1000u32).map(|i| u8::try_from(i % 253).unwrap()).collect();
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&contents).unwrap();
        let name = file
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        channel.upload_file(file.path()).await.unwrap();
        assert_eq!(peer.uploaded(&name).unwrap(), contents);

        let reply = channel.send(b"after upload").await.unwrap();
        assert_eq!(reply.data, b"after upload");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_file_leaves_encoder_alone() {
        let peer = Arc::new(LoopbackPeer::default());
        let mut channel = channel(&peer, &Config::default());
        channel.pair().await.unwrap();

        let err = channel
            .upload_file(Path::new("/nonexistent/tessera/upload.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));

        let reply = channel.send(b"still paired").await.unwrap();
        assert_eq!(reply.status, Status::Success);
    }
}
