//! `Tessera` Client Library
//!
//! Pairs encoder and decoder sessions with a remote peer and carries
//! messages and streamed uploads over the resulting channel.

pub mod channel;
pub mod channel_cmd;
pub mod check_cmd;
pub mod loopback;
pub mod pairing;
pub mod sdr_cmd;
pub mod transport;

pub use channel::{ChannelError, SecureChannel};
pub use loopback::LoopbackPeer;
pub use pairing::{PairRole, PairingCoordinator, PairingError};
pub use transport::{HttpTransport, PairRequest, PairResponse, PeerTransport, TransportError};
