use thiserror::Error;

use crate::channel::ChannelState;

/// Errors surfaced by the mesh channel subsystem.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("malformed address: {0}")]
    BadAddress(String),

    #[error("envelope decode failed: {0}")]
    Protocol(#[from] CodecError),

    #[error("envelope rejected: {0}")]
    Admission(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signalling transport: {0}")]
    Signaling(#[from] SignalingError),

    #[error("webrtc transport: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("transport buffer stalled on {channel} channel")]
    Stalled { channel: &'static str },

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("{op} is not permitted in state {state:?}")]
    InvalidState { op: &'static str, state: ChannelState },

    #[error("internal precondition failed: {0}")]
    Internal(String),
}

/// Envelope codec failures: bad JSON, missing payload tag, unknown payload
/// kind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("not valid JSON or not an envelope: {0}")]
    BadFormat(String),

    #[error("envelope has no payload.type tag")]
    MissingPayload,

    #[error("unknown payload kind {0:?}")]
    UnknownKind(String),
}

/// Signalling transport failures.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signalling connect failed: {0}")]
    Connect(String),

    #[error("signalling connect timed out")]
    ConnectTimeout,

    #[error("signalling channel closed")]
    Closed,

    #[error("signalling send failed: {0}")]
    Send(String),
}
