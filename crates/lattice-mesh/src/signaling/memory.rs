use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EnvelopeHandler, OpenHandler, SignalingTransport};
use crate::envelope::MessageEnvelope;
use crate::error::SignalingError;

/// In-process signalling endpoint: two of these wired back to back stand in
/// for a real socket during tests and local experiments.
pub struct MemorySignaling {
    open: AtomicBool,
    peer: Mutex<Weak<MemorySignaling>>,
    pending: Mutex<Vec<MessageEnvelope>>,
    message_handlers: Mutex<Vec<EnvelopeHandler>>,
    open_handlers: Mutex<Vec<OpenHandler>>,
}

impl MemorySignaling {
    /// A connected pair of endpoints; what one sends the other receives.
    pub fn pair() -> (Arc<MemorySignaling>, Arc<MemorySignaling>) {
        let a = Arc::new(Self::endpoint());
        let b = Arc::new(Self::endpoint());
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn endpoint() -> MemorySignaling {
        MemorySignaling {
            open: AtomicBool::new(false),
            peer: Mutex::new(Weak::new()),
            pending: Mutex::new(Vec::new()),
            message_handlers: Mutex::new(Vec::new()),
            open_handlers: Mutex::new(Vec::new()),
        }
    }

    fn deliver(&self, envelope: MessageEnvelope) {
        let handlers = self.message_handlers.lock();
        for handler in handlers.iter() {
            handler(envelope.clone());
        }
    }

    fn flush(&self) {
        let queued: Vec<MessageEnvelope> = self.pending.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        if let Some(peer) = self.peer.lock().upgrade() {
            for envelope in queued {
                peer.deliver(envelope);
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), SignalingError> {
        if !self.open.swap(true, Ordering::SeqCst) {
            let handlers = self.open_handlers.lock();
            for handler in handlers.iter() {
                handler();
            }
        }
        self.flush();
        Ok(())
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send(&self, envelope: MessageEnvelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            self.pending.lock().push(envelope);
            return Ok(());
        }
        match self.peer.lock().upgrade() {
            Some(peer) => {
                peer.deliver(envelope);
                Ok(())
            }
            None => Err(SignalingError::Closed),
        }
    }

    fn on_open(&self, handler: OpenHandler) {
        self.open_handlers.lock().push(handler);
    }

    fn on_message(&self, handler: EnvelopeHandler) {
        self.message_handlers.lock().push(handler);
    }
}
