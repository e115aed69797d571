//! Channel subsystem of a lattice mesh node.
//!
//! A node negotiates WebRTC sessions with other nodes and with end-user
//! accounts over a lightweight signalling transport, then talks to each peer
//! over two data channels: `command` for liveness and control, `data` for
//! application envelopes. Once a channel is stable, signalling is dropped and
//! all traffic flows peer to peer.

pub mod account;
pub mod address;
pub mod audit;
pub mod channel;
pub mod delay;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod signaling;

pub use account::{Account, AccountManager};
pub use address::Address;
pub use audit::BufferAuditor;
pub use channel::{Channel, ChannelConfig, ChannelKind, ChannelState};
pub use delay::CancellableDelay;
pub use envelope::{MessageEnvelope, Party, Payload, SessionDescription};
pub use error::{CodecError, MeshError, SignalingError};
pub use manager::{ChannelManager, Validators};
pub use signaling::SignalingTransport;
