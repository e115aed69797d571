//! Inbound signalling: the `/ws` endpoint other peers dial to negotiate
//! channels with this node. Offers go to manager admission; everything else
//! is handed to the transport's subscribers (the channels themselves).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lattice_mesh::envelope::{self, serialize};
use lattice_mesh::signaling::{EnvelopeHandler, OpenHandler, SignalingTransport};
use lattice_mesh::{ChannelManager, MessageEnvelope, Payload, SignalingError};

#[derive(Clone)]
struct SignalingServerState {
    manager: Arc<ChannelManager>,
}

pub async fn serve(port: u16, manager: Arc<ChannelManager>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(SignalingServerState { manager });
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("signalling endpoint listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<ChannelManager>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<MessageEnvelope>();
    let transport = SocketSignaling::new(out_tx);

    let writer = tokio::spawn(async move {
        while let Some(parsed) = out_rx.recv().await {
            if sink.send(Message::Text(serialize(&parsed))).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => route_frame(&manager, &transport, &text).await,
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data) {
                    route_frame(&manager, &transport, &text).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "signalling socket error");
                break;
            }
        }
    }
    transport.mark_closed();
    writer.abort();
    debug!("signalling socket finished");
}

async fn route_frame(manager: &Arc<ChannelManager>, transport: &Arc<SocketSignaling>, text: &str) {
    if !envelope::is_envelope(text) {
        debug!("non-envelope frame dropped");
        return;
    }
    let parsed = match envelope::deserialize(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "undecodable frame dropped");
            return;
        }
    };
    if matches!(parsed.payload, Payload::Offer { .. }) {
        let signaling = Arc::clone(transport) as Arc<dyn SignalingTransport>;
        match manager.handle_inbound_offer(parsed, signaling).await {
            Ok(channel) => {
                info!(signer = %channel.destination_signer(), "inbound offer accepted");
            }
            Err(err) => {
                warn!(error = %err, "inbound offer refused");
            }
        }
    } else {
        transport.dispatch(parsed);
    }
}

/// Server-side transport wrapper for one accepted socket. The socket is
/// already connected, so `connect` is a no-op and `disconnect` merely stops
/// this handle from being used; the socket itself belongs to the accept loop
/// and may carry other channels.
struct SocketSignaling {
    open: AtomicBool,
    out_tx: mpsc::UnboundedSender<MessageEnvelope>,
    message_handlers: Mutex<Vec<EnvelopeHandler>>,
    open_handlers: Mutex<Vec<OpenHandler>>,
}

impl SocketSignaling {
    fn new(out_tx: mpsc::UnboundedSender<MessageEnvelope>) -> Arc<Self> {
        Arc::new(SocketSignaling {
            open: AtomicBool::new(true),
            out_tx,
            message_handlers: Mutex::new(Vec::new()),
            open_handlers: Mutex::new(Vec::new()),
        })
    }

    fn dispatch(&self, parsed: MessageEnvelope) {
        let handlers = self.message_handlers.lock();
        for handler in handlers.iter() {
            handler(parsed.clone());
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for SocketSignaling {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::Closed);
        }
        let handlers = self.open_handlers.lock();
        for handler in handlers.iter() {
            handler();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        // The accept loop owns the socket lifetime.
    }

    async fn send(&self, parsed: MessageEnvelope) -> Result<(), SignalingError> {
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
