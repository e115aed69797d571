pub mod memory;

use async_trait::async_trait;

use crate::envelope::MessageEnvelope;
use crate::error::SignalingError;

pub type EnvelopeHandler = Box<dyn Fn(MessageEnvelope) + Send + Sync>;
pub type OpenHandler = Box<dyn Fn() + Send + Sync>;

/// The out-of-band transport a channel negotiates over.
///
/// Contract for implementations:
/// - `send` calls issued while `is_open()` is false are queued and flushed in
///   order once the transport opens;
/// - inbound envelopes are delivered to every subscriber exactly once, in
///   arrival order;
/// - `connect` and `disconnect` are idempotent.
///
/// Subscribers must not block: negotiation-critical ordering is preserved by
/// the caller, not by the transport.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn is_open(&self) -> bool;

    async fn connect(&self) -> Result<(), SignalingError>;

    async fn disconnect(&self);

    async fn send(&self, envelope: MessageEnvelope) -> Result<(), SignalingError>;

    /// Subscribe to transport-open notifications.
    fn on_open(&self, handler: OpenHandler);

    /// Subscribe to inbound envelopes.
    fn on_message(&self, handler: EnvelopeHandler);
}
