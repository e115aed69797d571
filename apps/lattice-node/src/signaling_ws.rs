//! Outbound signalling: a WebSocket connection to another node's `/ws`
//! endpoint. Envelopes sent before the socket is up are queued and flushed
//! in order once it opens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use lattice_mesh::envelope;
use lattice_mesh::signaling::{EnvelopeHandler, OpenHandler, SignalingTransport};
use lattice_mesh::{MessageEnvelope, SignalingError};

pub struct WsSignaling {
    url: Url,
    open: Arc<AtomicBool>,
    out_tx: mpsc::UnboundedSender<MessageEnvelope>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageEnvelope>>>,
    message_handlers: Arc<Mutex<Vec<EnvelopeHandler>>>,
    open_handlers: Mutex<Vec<OpenHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignaling {
    pub fn new(url: Url) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Arc::new(WsSignaling {
            url,
            open: Arc::new(AtomicBool::new(false)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            message_handlers: Arc::new(Mutex::new(Vec::new())),
            open_handlers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

fn dispatch(handlers: &Arc<Mutex<Vec<EnvelopeHandler>>>, text: &str) {
    if !envelope::is_envelope(text) {
        debug!("non-envelope signalling frame dropped");
        return;
    }
    match envelope::deserialize(text) {
        Ok(parsed) => {
            let handlers = handlers.lock();
            for handler in handlers.iter() {
                handler(parsed.clone());
            }
        }
        Err(err) => {
            debug!(error = %err, "undecodable signalling frame dropped");
        }
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), SignalingError> {
        if self.is_open() {
            return Ok(());
        }
        let rx = self.out_rx.lock().take();
        let Some(mut rx) = rx else {
            // A previous connect consumed the queue; nothing to redo.
            return Ok(());
        };
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let writer = tokio::spawn(async move {
            while let Some(parsed) = rx.recv().await {
                let text = envelope::serialize(&parsed);
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let handlers = Arc::clone(&self.message_handlers);
        let open = Arc::clone(&self.open);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => dispatch(&handlers, &text),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            dispatch(&handlers, &text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "signalling websocket error");
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
        }
        self.open.store(true, Ordering::SeqCst);
        let open_handlers = self.open_handlers.lock();
        for handler in open_handlers.iter() {
            handler();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn send(&self, parsed: MessageEnvelope) -> Result<(), SignalingError> {
        // The unbounded queue doubles as the pre-open buffer; the writer
        // drains it in order once connected.
        self.out_tx
            .send(parsed)
            .map_err(|_| SignalingError::Closed)
    }

    fn on_open(&self, handler: OpenHandler) {
        self.open_handlers.lock().push(handler);
    }

    fn on_message(&self, handler: EnvelopeHandler) {
        self.message_handlers.lock().push(handler);
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
