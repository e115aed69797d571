//! The per-peer channel: drives WebRTC negotiation over a signalling
//! transport, supervises the `command` and `data` channels, tracks heartbeat
//! latency and audits transport buffers for stalls.
//!
//! Locking model: three separable monitors (connection, heartbeat, audit).
//! State is mutated inside a monitor; events are emitted and I/O awaited only
//! after unlocking.

pub mod heartbeat;
pub mod kind;
pub mod state;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::account::AccountManager;
use crate::address::Address;
use crate::audit::BufferAuditor;
use crate::delay::CancellableDelay;
use crate::envelope::{MessageEnvelope, Payload, SessionDescription};
use crate::error::MeshError;
use crate::signaling::SignalingTransport;

use heartbeat::{HeartbeatState, PongOutcome, TickAction};
pub use kind::ChannelKind;
pub use state::ChannelState;
use state::{advance, Advance};

pub const COMMAND_LABEL: &str = "command";
pub const DATA_LABEL: &str = "data";

const TOKEN_PING: &str = "Ping";
const TOKEN_PONG: &str = "Pong";
const TOKEN_CLOSE: &str = "Close";
const TOKEN_DISPOSE: &str = "Dispose";

pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_AUDIT_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(50);

/// Predicate applied to inbound envelopes before they are surfaced; the
/// host injects real signature verification here.
pub type EnvelopeVerifier = Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

/// Hook for tuning the WebRTC `SettingEngine` (tests route this through a
/// virtual network).
pub type SettingEngineFactory = Arc<dyn Fn() -> SettingEngine + Send + Sync>;

#[derive(Clone)]
pub struct ChannelConfig {
    pub polite: bool,
    pub initiated_by_us: bool,
    /// ICE servers handed to `start_peer_connection` by owners that construct
    /// channels from a template (the manager). At least one STUN server in
    /// production; tests may clear it.
    pub ice_servers: Vec<RTCIceServer>,
    pub signaling_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_latency: Duration,
    pub audit_interval: Duration,
    pub drain_timeout: Duration,
    pub drain_poll: Duration,
    pub verify: EnvelopeVerifier,
    pub setting_engine: Option<SettingEngineFactory>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            polite: true,
            initiated_by_us: false,
            ice_servers: default_ice_servers(),
            signaling_timeout: DEFAULT_SIGNALING_TIMEOUT,
            heartbeat_interval: heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: heartbeat::DEFAULT_HEARTBEAT_TIMEOUT,
            max_latency: heartbeat::DEFAULT_MAX_LATENCY,
            audit_interval: DEFAULT_AUDIT_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            drain_poll: DEFAULT_DRAIN_POLL,
            verify: Arc::new(|_| true),
            setting_engine: None,
        }
    }
}

/// Guarded by the connection monitor.
struct Connection {
    state: ChannelState,
    stable: bool,
    ice_connected: bool,
    /// Remote description applied; candidates arriving earlier are parked in
    /// `pending_candidates`.
    remote_described: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
    pc: Option<Arc<RTCPeerConnection>>,
    command: Option<Arc<RTCDataChannel>>,
    data: Option<Arc<RTCDataChannel>>,
    signaling_timer: Option<Arc<CancellableDelay>>,
}

/// Guarded by the heartbeat monitor.
struct HeartbeatMonitor {
    state: HeartbeatState,
    task: Option<JoinHandle<()>>,
}

/// Guarded by the audit monitor.
struct AuditMonitor {
    task: Option<JoinHandle<()>>,
    command_auditor: Option<Arc<BufferAuditor>>,
    data_auditor: Option<Arc<BufferAuditor>>,
}

#[derive(Default)]
struct EventHandlers {
    open: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    stable: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    state_change: Mutex<Option<Arc<dyn Fn(ChannelState) + Send + Sync>>>,
    message: Mutex<Option<Arc<dyn Fn(MessageEnvelope) + Send + Sync>>>,
    latency: Mutex<Option<Arc<dyn Fn(u64) + Send + Sync>>>,
    high_latency: Mutex<Option<Arc<dyn Fn(u64) + Send + Sync>>>,
    timeout: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    dispose: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("kind", &self.kind).finish()
    }
}

pub struct Channel {
    kind: ChannelKind,
    cfg: ChannelConfig,
    local_signer: Address,
    accounts: Arc<AccountManager>,
    signaling: Arc<dyn SignalingTransport>,
    conn: Mutex<Connection>,
    heartbeat: Mutex<HeartbeatMonitor>,
    audit: Mutex<AuditMonitor>,
    handlers: EventHandlers,
    sequence: AtomicI64,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Build a channel and attach it to its signalling transport. Must be
    /// called from within a tokio runtime.
    pub fn new(
        kind: ChannelKind,
        cfg: ChannelConfig,
        accounts: Arc<AccountManager>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        let channel = Arc::new(Channel {
            local_signer: accounts.address(),
            kind,
            cfg,
            accounts,
            signaling: Arc::clone(&signaling),
            conn: Mutex::new(Connection {
                state: ChannelState::Initiating,
                stable: false,
                ice_connected: false,
                remote_described: false,
                pending_candidates: Vec::new(),
                pc: None,
                command: None,
                data: None,
                signaling_timer: None,
            }),
            heartbeat: Mutex::new(HeartbeatMonitor {
                state: HeartbeatState::new(
                    heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
                    heartbeat::DEFAULT_HEARTBEAT_TIMEOUT,
                    heartbeat::DEFAULT_MAX_LATENCY,
                ),
                task: None,
            }),
            audit: Mutex::new(AuditMonitor {
                task: None,
                command_auditor: None,
                data_auditor: None,
            }),
            handlers: EventHandlers::default(),
            sequence: AtomicI64::new(0),
            signal_task: Mutex::new(None),
        });

        // Signalling envelopes are funneled through a single worker so the
        // channel observes them strictly in arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        signaling.on_message(Box::new(move |envelope| {
            let _ = tx.send(envelope);
        }));
        let weak = Arc::downgrade(&channel);
        let worker = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match weak.upgrade() {
                    Some(channel) => channel.handle_signal(envelope).await,
                    None => break,
                }
            }
        });
        *channel.signal_task.lock() = Some(worker);
        channel
    }

    // ── Observable properties ────────────────────────────────────────────

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.conn.lock().state
    }

    pub fn is_stable(&self) -> bool {
        self.conn.lock().stable
    }

    pub fn is_polite(&self) -> bool {
        self.cfg.polite
    }

    pub fn initiated_by_us(&self) -> bool {
        self.cfg.initiated_by_us
    }

    /// Measured round-trip latency; 0 means "no data".
    pub fn latency_ms(&self) -> u64 {
        self.heartbeat.lock().state.latency_ms()
    }

    pub fn destination_signer(&self) -> Address {
        self.kind.destination_signer().clone()
    }

    pub fn destination_account(&self) -> Option<Address> {
        self.kind.destination_account().cloned()
    }

    // ── Event subscriptions ──────────────────────────────────────────────

    pub fn on_open<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.open.lock() = Some(Arc::new(f));
    }

    pub fn on_stable<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.stable.lock() = Some(Arc::new(f));
    }

    pub fn on_state_change<F: Fn(ChannelState) + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.state_change.lock() = Some(Arc::new(f));
    }

    pub fn on_message<F: Fn(MessageEnvelope) + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.message.lock() = Some(Arc::new(f));
    }

    pub fn on_latency<F: Fn(u64) + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.latency.lock() = Some(Arc::new(f));
    }

    pub fn on_high_latency<F: Fn(u64) + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.high_latency.lock() = Some(Arc::new(f));
    }

    pub fn on_timeout<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.timeout.lock() = Some(Arc::new(f));
    }

    pub fn on_dispose<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.handlers.dispose.lock() = Some(Arc::new(f));
    }

    // ── Peer connection setup ────────────────────────────────────────────

    /// One-shot WebRTC initialization. Fails on a second call.
    pub async fn start_peer_connection(
        self: &Arc<Self>,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<(), MeshError> {
        if self.conn.lock().pc.is_some() {
            return Err(MeshError::Internal(
                "peer connection already initialized".into(),
            ));
        }
        let api = self.build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(channel), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        warn!(error = %err, "local candidate serialization failed");
                        return;
                    }
                };
                channel.forward_local_candidate(init).await;
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |ice_state| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.conn.lock().ice_connected =
                        ice_state == RTCIceConnectionState::Connected;
                    channel.recompute_stability();
                }
            })
        }));

        // Responder side: the initiator's channels arrive by label.
        let weak = Arc::downgrade(self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(channel) = weak.upgrade() else { return };
                match dc.label() {
                    COMMAND_LABEL => channel.adopt_command_channel(dc),
                    DATA_LABEL => channel.adopt_data_channel(dc),
                    other => {
                        warn!(channel = %channel.log_target(), label = other, "unexpected data channel");
                    }
                }
            })
        }));

        self.conn.lock().pc = Some(pc);
        Ok(())
    }

    fn build_api(&self) -> Result<API, MeshError> {
        let setting = match &self.cfg.setting_engine {
            Some(factory) => factory(),
            None => {
                let mut setting = SettingEngine::default();
                setting.set_ice_timeouts(
                    Some(Duration::from_secs(3)),
                    Some(Duration::from_secs(10)),
                    Some(Duration::from_millis(500)),
                );
                setting
            }
        };
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        Ok(APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    // ── Negotiation ──────────────────────────────────────────────────────

    /// Initiator path: create both transports, produce an offer, send it over
    /// signalling. Also the reopen path for a `Closed` channel whose ICE
    /// session is still alive.
    pub async fn open(self: &Arc<Self>) -> Result<(), MeshError> {
        enum Path {
            AlreadyOpen,
            Reopen(Arc<RTCPeerConnection>),
            Fresh,
        }
        let path = {
            let conn = self.conn.lock();
            match conn.state {
                ChannelState::Open => Path::AlreadyOpen,
                ChannelState::Rejected if self.cfg.polite => {
                    return Err(MeshError::InvalidState {
                        op: "open",
                        state: conn.state,
                    });
                }
                ChannelState::Closed if conn.ice_connected => match conn.pc.clone() {
                    Some(pc) => Path::Reopen(pc),
                    None => Path::Fresh,
                },
                _ => Path::Fresh,
            }
        };
        match path {
            Path::AlreadyOpen => {
                info!(channel = %self.log_target(), "open requested on an already open channel");
                Ok(())
            }
            Path::Reopen(pc) => self.reopen(pc).await,
            Path::Fresh => self.open_fresh().await,
        }
    }

    /// Re-create only the data channel on a still-connected peer connection
    /// and wait for the channel to come back to `Open`.
    async fn reopen(self: &Arc<Self>, pc: Arc<RTCPeerConnection>) -> Result<(), MeshError> {
        self.try_advance(ChannelState::Connecting);
        let dc = pc
            .create_data_channel(
                DATA_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.adopt_data_channel(dc);

        let deadline = Instant::now() + self.cfg.signaling_timeout;
        while Instant::now() < deadline {
            if self.state() == ChannelState::Open {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(MeshError::Negotiation(
            "reopened data channel did not come up".into(),
        ))
    }

    async fn open_fresh(self: &Arc<Self>) -> Result<(), MeshError> {
        self.start_signaling_timer();
        match self.try_advance(ChannelState::Connecting) {
            Advance::Moved { .. } => {}
            _ => {
                self.cancel_signaling_timer();
                return Err(MeshError::InvalidState {
                    op: "open",
                    state: self.state(),
                });
            }
        }
        if let Err(err) = self.connect_signaling_half_budget().await {
            self.fail_negotiation();
            return Err(err);
        }
        self.try_advance(ChannelState::Signalling);

        let pc = self.require_pc()?;
        let data = pc
            .create_data_channel(
                DATA_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.adopt_data_channel(data);
        let command = pc
            .create_data_channel(
                COMMAND_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.adopt_command_channel(command);

        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        let envelope = self.make_envelope(Payload::Offer {
            offer: SessionDescription {
                kind: "offer".into(),
                sdp,
            },
        });
        self.signaling.send(envelope).await?;
        debug!(channel = %self.log_target(), "offer sent");
        Ok(())
    }

    /// Responder path: apply the remote offer and answer it.
    pub async fn accept(self: &Arc<Self>, offer: SessionDescription) -> Result<(), MeshError> {
        if self.cfg.initiated_by_us {
            return Err(MeshError::Internal(
                "accept on a channel we initiated".into(),
            ));
        }
        if self.state() != ChannelState::Initiating {
            return Err(MeshError::InvalidState {
                op: "accept",
                state: self.state(),
            });
        }
        self.start_signaling_timer();
        match self.try_advance(ChannelState::Connecting) {
            Advance::Moved { .. } => {}
            _ => {
                self.cancel_signaling_timer();
                return Err(MeshError::InvalidState {
                    op: "accept",
                    state: self.state(),
                });
            }
        }
        if let Err(err) = self.connect_signaling_half_budget().await {
            self.fail_negotiation();
            return Err(err);
        }
        self.try_advance(ChannelState::Signalling);

        let pc = self.require_pc()?;
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|err| MeshError::Negotiation(format!("bad remote offer: {err}")))?;
        pc.set_remote_description(remote).await?;
        self.flush_pending_candidates(&pc).await;
        let answer = pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;
        let envelope = self.make_envelope(Payload::Answer {
            answer: SessionDescription {
                kind: "answer".into(),
                sdp,
            },
        });
        self.signaling.send(envelope).await?;
        debug!(channel = %self.log_target(), "answer sent");
        Ok(())
    }

    /// Decline a remote offer: notify the peer, mark `Rejected`, release the
    /// peer connection.
    pub async fn reject(self: &Arc<Self>, _offer: SessionDescription) -> Result<(), MeshError> {
        if self.state() != ChannelState::Initiating {
            return Err(MeshError::InvalidState {
                op: "reject",
                state: self.state(),
            });
        }
        self.connect_signaling_half_budget().await?;
        let envelope = self.make_envelope(Payload::Rejection);
        self.signaling.send(envelope).await?;
        self.try_advance(ChannelState::Rejected);
        let pc = self.conn.lock().pc.take();
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                warn!(channel = %self.log_target(), error = %err, "peer connection close failed");
            }
        }
        self.signaling.disconnect().await;
        Ok(())
    }

    async fn connect_signaling_half_budget(&self) -> Result<(), MeshError> {
        let budget = self.cfg.signaling_timeout / 2;
        match tokio::time::timeout(budget, self.signaling.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(MeshError::Signaling(
                crate::error::SignalingError::ConnectTimeout,
            )),
        }
    }

    fn fail_negotiation(&self) {
        self.cancel_signaling_timer();
        self.try_advance(ChannelState::Failed);
        self.emit_timeout();
    }

    fn start_signaling_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let on_timeout: crate::delay::DelayCallback = Arc::new(move || {
            let Some(channel) = weak.upgrade() else { return };
            let in_handshake = matches!(
                channel.state(),
                ChannelState::Connecting | ChannelState::Signalling
            );
            if !in_handshake {
                return;
            }
            warn!(channel = %channel.log_target(), "signalling timed out");
            channel.try_advance(ChannelState::Failed);
            channel.emit_timeout();
        });
        let timer = CancellableDelay::new(
            self.cfg.signaling_timeout,
            on_timeout,
            Arc::new(|| {}),
        );
        if timer.start().is_err() {
            warn!(channel = %self.log_target(), "signalling timer double start");
        }
        self.conn.lock().signaling_timer = Some(timer);
    }

    /// Timer cancellations triggered from channel paths are always silent:
    /// the callbacks re-enter the channel.
    fn cancel_signaling_timer(&self) {
        let timer = self.conn.lock().signaling_timer.take();
        if let Some(timer) = timer {
            timer.cancel(true);
        }
    }

    /// Mark the remote description applied and replay candidates that beat
    /// it to the channel.
    async fn flush_pending_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let parked = {
            let mut conn = self.conn.lock();
            conn.remote_described = true;
            std::mem::take(&mut conn.pending_candidates)
        };
        for init in parked {
            if let Err(err) = pc.add_ice_candidate(init).await {
                warn!(channel = %self.log_target(), error = %err, "parked candidate refused");
            }
        }
    }

    fn require_pc(&self) -> Result<Arc<RTCPeerConnection>, MeshError> {
        self.conn
            .lock()
            .pc
            .clone()
            .ok_or_else(|| MeshError::Internal("peer connection not started".into()))
    }

    async fn forward_local_candidate(self: &Arc<Self>, init: RTCIceCandidateInit) {
        // A null mid is put on the wire as "0" for interop with peers that
        // reject null there.
        let envelope = self.make_envelope(Payload::Candidate {
            candidate: init.candidate,
            sdp_mid: Some(init.sdp_mid.unwrap_or_else(|| "0".into())),
            sdp_mline_index: init.sdp_mline_index,
        });
        if let Err(err) = self.signaling.send(envelope).await {
            warn!(channel = %self.log_target(), error = %err, "candidate forward failed");
        }
    }

    // ── Signalling inbound ───────────────────────────────────────────────

    async fn handle_signal(self: &Arc<Self>, envelope: MessageEnvelope) {
        if matches!(envelope.payload, Payload::Offer { .. }) {
            // Offers are demultiplexed by the manager before a channel exists.
            return;
        }
        if let Err(reason) = self.kind.admit(&envelope, &self.local_signer) {
            debug!(channel = %self.log_target(), reason = %reason, "signal envelope refused");
            return;
        }
        if !(self.cfg.verify)(&envelope) {
            debug!(channel = %self.log_target(), "signal envelope failed verification");
            return;
        }
        match envelope.payload {
            Payload::Answer { answer } => {
                if !self.cfg.initiated_by_us {
                    debug!(channel = %self.log_target(), "unexpected answer on responder channel");
                    return;
                }
                let pc = match self.require_pc() {
                    Ok(pc) => pc,
                    Err(err) => {
                        warn!(channel = %self.log_target(), error = %err, "answer without peer connection");
                        return;
                    }
                };
                let remote = match RTCSessionDescription::answer(answer.sdp) {
                    Ok(desc) => desc,
                    Err(err) => {
                        warn!(channel = %self.log_target(), error = %err, "bad remote answer");
                        return;
                    }
                };
                if let Err(err) = pc.set_remote_description(remote).await {
                    warn!(channel = %self.log_target(), error = %err, "remote answer apply failed");
                    self.try_advance(ChannelState::Failed);
                    return;
                }
                self.flush_pending_candidates(&pc).await;
            }
            Payload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let pc = match self.require_pc() {
                    Ok(pc) => pc,
                    Err(_) => return,
                };
                let init = RTCIceCandidateInit {
                    candidate,
                    // "0" is the interop spelling of a null mid.
                    sdp_mid: sdp_mid.filter(|mid| mid != "0"),
                    sdp_mline_index,
                    username_fragment: None,
                };
                // Candidates may trickle in ahead of the description they
                // belong to; park them until it lands.
                let apply_now = {
                    let mut conn = self.conn.lock();
                    if conn.remote_described {
                        true
                    } else {
                        conn.pending_candidates.push(init.clone());
                        false
                    }
                };
                if !apply_now {
                    return;
                }
                if let Err(err) = pc.add_ice_candidate(init).await {
                    warn!(channel = %self.log_target(), error = %err, "remote candidate refused");
                }
            }
            Payload::Rejection => {
                info!(channel = %self.log_target(), "offer rejected by peer");
                self.cancel_signaling_timer();
                self.try_advance(ChannelState::Rejected);
            }
            other => {
                debug!(
                    channel = %self.log_target(),
                    kind = other.kind(),
                    "payload ignored on signalling"
                );
            }
        }
    }

    // ── Transport wiring ─────────────────────────────────────────────────

    fn adopt_command_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let weak = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    debug!(channel = %channel.log_target(), "command channel open");
                    channel.recompute_stability();
                }
            })
        }));
        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_command_frame(&msg.data).await;
                }
            })
        }));
        let weak = Arc::downgrade(self);
        dc.on_error(Box::new(move |err| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    warn!(channel = %channel.log_target(), error = %err, "command channel error");
                    channel.try_advance(ChannelState::Failed);
                    channel.emit_timeout();
                }
            })
        }));
        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    debug!(channel = %channel.log_target(), "command channel closed");
                    channel.recompute_stability();
                }
            })
        }));
        self.conn.lock().command = Some(dc);
    }

    fn adopt_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let weak = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    debug!(channel = %channel.log_target(), "data channel open");
                    channel.recompute_stability();
                }
            })
        }));
        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_data_frame(&msg.data).await;
                }
            })
        }));
        let weak = Arc::downgrade(self);
        dc.on_error(Box::new(move |err| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    warn!(channel = %channel.log_target(), error = %err, "data channel error");
                    channel.try_advance(ChannelState::Failed);
                    channel.emit_timeout();
                }
            })
        }));
        self.conn.lock().data = Some(dc);
    }

    /// Recompute `isStable` and, when warranted, move to `Open`. Invoked on
    /// every transport and ICE event.
    fn recompute_stability(self: &Arc<Self>) {
        let mut transitions: Vec<ChannelState> = Vec::new();
        let (became_stable, timer, opened) = {
            let mut conn = self.conn.lock();
            let command_open = conn
                .command
                .as_ref()
                .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
                .unwrap_or(false);
            let data_open = conn
                .data
                .as_ref()
                .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
                .unwrap_or(false);
            let stable = command_open && conn.ice_connected;
            let became_stable = stable && !conn.stable;
            conn.stable = stable;
            let timer = if became_stable {
                conn.signaling_timer.take()
            } else {
                None
            };
            let mut opened = false;
            if stable && data_open {
                // The peer reopening the data channel pulls a closed channel
                // back up through Connecting.
                if conn.state == ChannelState::Closed {
                    if let Advance::Moved { .. } = advance(&mut conn.state, ChannelState::Connecting)
                    {
                        transitions.push(ChannelState::Connecting);
                    }
                }
                if matches!(
                    conn.state,
                    ChannelState::Connecting | ChannelState::Signalling
                ) {
                    if let Advance::Moved { .. } = advance(&mut conn.state, ChannelState::Open) {
                        transitions.push(ChannelState::Open);
                        opened = true;
                    }
                }
            }
            (became_stable, timer, opened)
        };

        if let Some(timer) = timer {
            timer.cancel(true);
        }
        for state in transitions {
            self.emit_state_change(state);
        }
        if opened {
            self.emit(&self.handlers.open);
        }
        if became_stable {
            self.emit(&self.handlers.stable);
        }
        if opened {
            info!(channel = %self.log_target(), "channel open and stable");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                // Signalling is only needed until stability; drop it before
                // the supervision loops start.
                this.signaling.disconnect().await;
                this.start_heartbeat(None, None);
                this.start_auditor();
            });
        }
    }

    // ── Command protocol ─────────────────────────────────────────────────

    async fn handle_command_frame(self: &Arc<Self>, data: &[u8]) {
        let token = match std::str::from_utf8(data) {
            Ok(token) => token,
            Err(_) => {
                debug!(channel = %self.log_target(), "non-utf8 command frame ignored");
                return;
            }
        };
        match token {
            TOKEN_PING => {
                if let Err(err) = self.send_command(TOKEN_PONG).await {
                    warn!(channel = %self.log_target(), error = %err, "pong send failed");
                }
            }
            TOKEN_PONG => self.complete_heartbeat(),
            TOKEN_CLOSE => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = this.close_inner(false).await {
                        warn!(channel = %this.log_target(), error = %err, "remote close failed");
                    }
                });
            }
            TOKEN_DISPOSE => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.dispose().await;
                });
            }
            other => {
                debug!(channel = %self.log_target(), token = other, "unknown command token ignored");
            }
        }
    }

    /// Send a control token. Reserved for the channel itself.
    async fn send_command(&self, token: &str) -> Result<(), MeshError> {
        let dc = self.conn.lock().command.clone();
        let auditor = self.audit.lock().command_auditor.clone();
        let dc = dc.ok_or_else(|| MeshError::Internal("command channel missing".into()))?;
        let bytes = Bytes::from(token.as_bytes().to_vec());
        if let Some(auditor) = auditor {
            auditor.record(bytes.len());
        }
        dc.send(&bytes).await?;
        Ok(())
    }

    // ── Data protocol ────────────────────────────────────────────────────

    async fn handle_data_frame(self: &Arc<Self>, data: &[u8]) {
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                debug!(channel = %self.log_target(), "non-utf8 data frame ignored");
                return;
            }
        };
        if text.eq_ignore_ascii_case("ping") {
            if let Err(err) = self.send_on_data("pong").await {
                debug!(channel = %self.log_target(), error = %err, "echo pong failed");
            }
            return;
        }
        if let Some(rest) = text.strip_prefix("echo:") {
            if let Err(err) = self.send_on_data(rest.trim_start()).await {
                debug!(channel = %self.log_target(), error = %err, "echo reply failed");
            }
            return;
        }
        let envelope = match crate::envelope::deserialize(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(channel = %self.log_target(), error = %err, "data frame is not an envelope");
                return;
            }
        };
        if let Err(reason) = self.kind.admit(&envelope, &self.local_signer) {
            debug!(channel = %self.log_target(), reason = %reason, "data envelope refused");
            return;
        }
        if !(self.cfg.verify)(&envelope) {
            debug!(channel = %self.log_target(), "data envelope failed verification");
            return;
        }
        // No deliveries once the channel is closing down.
        let delivering = !matches!(
            self.state(),
            ChannelState::Closing
                | ChannelState::Closed
                | ChannelState::Disposing
                | ChannelState::Disposed
        );
        if !delivering {
            return;
        }
        let handler = self.handlers.message.lock().clone();
        if let Some(handler) = handler {
            handler(envelope);
        }
    }

    /// Application send; only legal while `Open`.
    pub async fn send(&self, text: &str) -> Result<(), MeshError> {
        let (state, dc) = {
            let conn = self.conn.lock();
            (conn.state, conn.data.clone())
        };
        let auditor = self.audit.lock().data_auditor.clone();
        if state != ChannelState::Open {
            return Err(MeshError::InvalidState { op: "send", state });
        }
        let dc = dc.ok_or_else(|| MeshError::Internal("data channel missing".into()))?;
        let bytes = Bytes::from(text.as_bytes().to_vec());
        if let Some(auditor) = auditor {
            auditor.record(bytes.len());
        }
        dc.send(&bytes).await?;
        Ok(())
    }

    /// Raw data-channel write used by the echo conveniences.
    async fn send_on_data(&self, text: &str) -> Result<(), MeshError> {
        let dc = self.conn.lock().data.clone();
        let auditor = self.audit.lock().data_auditor.clone();
        let dc = dc.ok_or_else(|| MeshError::Internal("data channel missing".into()))?;
        let bytes = Bytes::from(text.as_bytes().to_vec());
        if let Some(auditor) = auditor {
            auditor.record(bytes.len());
        }
        dc.send(&bytes).await?;
        Ok(())
    }

    // ── Heartbeat ────────────────────────────────────────────────────────

    pub fn start_heartbeat(
        self: &Arc<Self>,
        interval: Option<Duration>,
        timeout: Option<Duration>,
    ) {
        {
            let mut hb = self.heartbeat.lock();
            if let Some(task) = hb.task.take() {
                task.abort();
            }
            hb.state = HeartbeatState::new(
                interval.unwrap_or(self.cfg.heartbeat_interval),
                timeout.unwrap_or(self.cfg.heartbeat_timeout),
                self.cfg.max_latency,
            );
            let weak = Arc::downgrade(self);
            hb.task = Some(tokio::spawn(async move {
                loop {
                    let period = match weak.upgrade() {
                        Some(channel) => channel.heartbeat.lock().state.tick_period(),
                        None => break,
                    };
                    tokio::time::sleep(period).await;
                    match weak.upgrade() {
                        Some(channel) => channel.heartbeat_tick().await,
                        None => break,
                    }
                }
            }));
        }
        debug!(channel = %self.log_target(), "heartbeat started");
    }

    pub fn stop_heartbeat(&self) {
        let mut hb = self.heartbeat.lock();
        if let Some(task) = hb.task.take() {
            task.abort();
        }
        hb.state.reset();
    }

    async fn heartbeat_tick(self: &Arc<Self>) {
        let stable = self.conn.lock().stable;
        let action = self.heartbeat.lock().state.on_tick(Instant::now(), stable);
        match action {
            TickAction::Nothing => {}
            TickAction::SendPing => {
                if let Err(err) = self.send_command(TOKEN_PING).await {
                    warn!(channel = %self.log_target(), error = %err, "ping send failed");
                }
            }
            TickAction::ReportTimeout => {
                warn!(channel = %self.log_target(), "heartbeat timed out");
                self.emit_timeout();
            }
        }
    }

    fn complete_heartbeat(self: &Arc<Self>) {
        let outcome = self.heartbeat.lock().state.on_pong(Instant::now());
        let Some(PongOutcome {
            latency_ms,
            latency_changed,
            high_latency_entered,
        }) = outcome
        else {
            return;
        };
        if latency_changed {
            let handler = self.handlers.latency.lock().clone();
            if let Some(handler) = handler {
                handler(latency_ms);
            }
        }
        if high_latency_entered {
            warn!(channel = %self.log_target(), latency_ms, "latency above threshold");
            let handler = self.handlers.high_latency.lock().clone();
            if let Some(handler) = handler {
                handler(latency_ms);
            }
        }
    }

    // ── Buffer audit loop ────────────────────────────────────────────────

    pub fn start_auditor(self: &Arc<Self>) {
        let mut audit = self.audit.lock();
        if let Some(task) = audit.task.take() {
            task.abort();
        }
        let command_auditor = BufferAuditor::new(COMMAND_LABEL);
        command_auditor.start();
        let data_auditor = BufferAuditor::new(DATA_LABEL);
        data_auditor.start();
        audit.command_auditor = Some(Arc::clone(&command_auditor));
        audit.data_auditor = Some(Arc::clone(&data_auditor));

        let weak = Arc::downgrade(self);
        let interval = self.cfg.audit_interval;
        audit.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(channel) => {
                        if channel.audit_tick().await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }));
    }

    pub fn stop_auditor(&self) {
        let mut audit = self.audit.lock();
        if let Some(task) = audit.task.take() {
            task.abort();
        }
        if let Some(auditor) = audit.command_auditor.take() {
            auditor.stop();
        }
        if let Some(auditor) = audit.data_auditor.take() {
            auditor.stop();
        }
    }

    /// One supervision pass; returns true when the loop should stop.
    async fn audit_tick(self: &Arc<Self>) -> bool {
        let (state, command, data) = {
            let conn = self.conn.lock();
            (conn.state, conn.command.clone(), conn.data.clone())
        };
        if state.is_disposed_or_disposing() {
            return true;
        }
        let (command_auditor, data_auditor) = {
            let audit = self.audit.lock();
            (audit.command_auditor.clone(), audit.data_auditor.clone())
        };

        let command_open = command
            .as_ref()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false);
        if !state.is_terminal() && !command_open {
            warn!(channel = %self.log_target(), "command channel lost; disposing");
            self.dispose().await;
            return true;
        }

        let data_open = data
            .as_ref()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false);
        if state == ChannelState::Open && !data_open {
            warn!(channel = %self.log_target(), "data channel lost; closing");
            if let Err(err) = self.close_inner(true).await {
                warn!(channel = %self.log_target(), error = %err, "close after data loss failed");
            }
            return false;
        }

        if let (Some(dc), Some(auditor)) = (command.as_ref(), command_auditor.as_ref()) {
            if command_open && !auditor.audit(dc.buffered_amount().await) {
                warn!(channel = %self.log_target(), "command buffer stalled; disposing");
                self.dispose().await;
                return true;
            }
        }
        if state == ChannelState::Open {
            if let (Some(dc), Some(auditor)) = (data.as_ref(), data_auditor.as_ref()) {
                if !auditor.audit(dc.buffered_amount().await) {
                    warn!(channel = %self.log_target(), "data buffer stalled; closing");
                    if let Err(err) = self.close_inner(true).await {
                        warn!(channel = %self.log_target(), error = %err, "close after stall failed");
                    }
                }
            }
        }
        false
    }

    // ── Close / dispose ──────────────────────────────────────────────────

    /// Graceful close: the command channel survives so the channel can be
    /// reopened.
    pub async fn close(self: &Arc<Self>) -> Result<(), MeshError> {
        self.close_inner(true).await
    }

    async fn close_inner(self: &Arc<Self>, notify: bool) -> Result<(), MeshError> {
        match self.try_advance(ChannelState::Closing) {
            Advance::Moved { .. } => {}
            _ => {
                warn!(channel = %self.log_target(), state = %self.state(), "close ignored");
                return Ok(());
            }
        }
        self.stop_heartbeat();

        let (command, data) = {
            let mut conn = self.conn.lock();
            (conn.command.clone(), conn.data.take())
        };
        if notify {
            if let Err(err) = self.send_command(TOKEN_CLOSE).await {
                warn!(channel = %self.log_target(), error = %err, "close notification failed");
            }
            if let Some(dc) = command.as_ref() {
                self.drain_buffer(dc).await;
            }
        }
        if let Some(dc) = data {
            if let Err(err) = dc.close().await {
                warn!(channel = %self.log_target(), error = %err, "data channel close failed");
            }
        }
        self.try_advance(ChannelState::Closed);
        info!(channel = %self.log_target(), "channel closed");
        // A peer may have reopened the data channel while we were closing;
        // re-evaluate so the channel follows it back up.
        self.recompute_stability();
        Ok(())
    }

    /// Hard teardown. Idempotent; fires `on_dispose` exactly once.
    pub async fn dispose(self: &Arc<Self>) {
        match self.try_advance(ChannelState::Disposing) {
            Advance::Moved { .. } => {}
            _ => return,
        }
        self.stop_auditor();
        self.stop_heartbeat();
        self.cancel_signaling_timer();

        let (pc, command, data) = {
            let mut conn = self.conn.lock();
            conn.stable = false;
            conn.pending_candidates.clear();
            (conn.pc.take(), conn.command.take(), conn.data.take())
        };

        if let Some(dc) = command.as_ref() {
            if dc.ready_state() == RTCDataChannelState::Open {
                if let Err(err) = self.send_command_on(dc, TOKEN_DISPOSE).await {
                    debug!(channel = %self.log_target(), error = %err, "dispose notification failed");
                }
                self.drain_buffer(dc).await;
            }
        }
        if let Some(dc) = command {
            if let Err(err) = dc.close().await {
                debug!(channel = %self.log_target(), error = %err, "command channel close failed");
            }
        }
        if let Some(dc) = data {
            if let Err(err) = dc.close().await {
                debug!(channel = %self.log_target(), error = %err, "data channel close failed");
            }
        }
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                debug!(channel = %self.log_target(), error = %err, "peer connection close failed");
            }
        }
        self.signaling.disconnect().await;
        if let Some(task) = self.signal_task.lock().take() {
            task.abort();
        }

        self.try_advance(ChannelState::Disposed);
        info!(channel = %self.log_target(), "channel disposed");
        self.emit(&self.handlers.dispose);
    }

    /// `send_command` against an explicit channel reference; used from the
    /// dispose path after the reference has been detached.
    async fn send_command_on(
        &self,
        dc: &Arc<RTCDataChannel>,
        token: &str,
    ) -> Result<(), MeshError> {
        let auditor = self.audit.lock().command_auditor.clone();
        let bytes = Bytes::from(token.as_bytes().to_vec());
        if let Some(auditor) = auditor {
            auditor.record(bytes.len());
        }
        dc.send(&bytes).await?;
        Ok(())
    }

    async fn drain_buffer(&self, dc: &Arc<RTCDataChannel>) {
        let deadline = Instant::now() + self.cfg.drain_timeout;
        while Instant::now() < deadline {
            if dc.buffered_amount().await == 0 {
                return;
            }
            tokio::time::sleep(self.cfg.drain_poll).await;
        }
        debug!(channel = %self.log_target(), "buffer drain timed out");
    }

    // ── Envelope construction ────────────────────────────────────────────

    fn make_envelope(&self, payload: Payload) -> MessageEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut envelope = MessageEnvelope::build(
            self.kind.sender_party(&self.local_signer),
            self.kind.receiver_party(),
            payload,
            sequence,
        );
        match self.accounts.sign(&envelope.signable_bytes()) {
            Ok(signature) => envelope.signature = signature,
            Err(err) => {
                warn!(channel = %self.log_target(), error = %err, "envelope left unsigned");
            }
        }
        envelope
    }

    // ── State / events plumbing ──────────────────────────────────────────

    fn try_advance(&self, next: ChannelState) -> Advance {
        let outcome = {
            let mut conn = self.conn.lock();
            advance(&mut conn.state, next)
        };
        match &outcome {
            Advance::Moved { .. } => {
                debug!(channel = %self.log_target(), state = %next, "state changed");
                self.emit_state_change(next);
            }
            Advance::Illegal { from } => {
                warn!(channel = %self.log_target(), from = %from, to = %next, "illegal state transition");
            }
            Advance::Unchanged => {}
        }
        outcome
    }

    fn emit_state_change(&self, state: ChannelState) {
        let handler = self.handlers.state_change.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn emit_timeout(&self) {
        self.emit(&self.handlers.timeout);
    }

    fn emit(&self, slot: &Mutex<Option<Arc<dyn Fn() + Send + Sync>>>) {
        let handler = slot.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn log_target(&self) -> String {
        match &self.kind {
            ChannelKind::Node { signer } => {
                format!("node/{}->{}", self.local_signer.short(), signer.short())
            }
            ChannelKind::Account { account, signer } => format!(
                "account/{}->{}@{}",
                self.local_signer.short(),
                signer.short(),
                account.short()
            ),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Safety net only: logs and stops timers, releases nothing the owner
        // has not already released.
        let state = self.conn.get_mut().state;
        if state != ChannelState::Disposed {
            warn!(state = %state, "channel dropped without dispose");
        }
        if let Some(task) = self.heartbeat.get_mut().task.take() {
            task.abort();
        }
        let audit = self.audit.get_mut();
        if let Some(task) = audit.task.take() {
            task.abort();
        }
        if let Some(auditor) = audit.command_auditor.take() {
            auditor.stop();
        }
        if let Some(auditor) = audit.data_auditor.take() {
            auditor.stop();
        }
        if let Some(task) = self.signal_task.get_mut().take() {
            task.abort();
        }
    }
}

/// The stock STUN configuration channels are bound to by default.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_owned()],
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::MemorySignaling;

    fn accounts() -> Arc<AccountManager> {
        Arc::new(AccountManager::from_key(b"channel-tests".to_vec()))
    }

    fn peer_signer() -> Address {
        "b".repeat(40).parse().unwrap()
    }

    #[tokio::test]
    async fn send_requires_open_state() {
        let (transport, _peer) = MemorySignaling::pair();
        let channel = Channel::new(
            ChannelKind::node(peer_signer()),
            ChannelConfig::default(),
            accounts(),
            transport,
        );
        let err = channel.send("hello").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::InvalidState {
                op: "send",
                state: ChannelState::Initiating
            }
        ));
        channel.dispose().await;
    }

    #[tokio::test]
    async fn accept_refused_on_initiator_channel() {
        let (transport, _peer) = MemorySignaling::pair();
        let cfg = ChannelConfig {
            initiated_by_us: true,
            ..ChannelConfig::default()
        };
        let channel = Channel::new(ChannelKind::node(peer_signer()), cfg, accounts(), transport);
        let offer = SessionDescription {
            kind: "offer".into(),
            sdp: "v=0\r\n".into(),
        };
        assert!(channel.accept(offer).await.is_err());
        channel.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_fires_once() {
        let (transport, _peer) = MemorySignaling::pair();
        let channel = Channel::new(
            ChannelKind::node(peer_signer()),
            ChannelConfig::default(),
            accounts(),
            transport,
        );
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.dispose().await;
        channel.dispose().await;
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_on_non_open_channel_is_a_logged_no_op() {
        let (transport, _peer) = MemorySignaling::pair();
        let channel = Channel::new(
            ChannelKind::node(peer_signer()),
            ChannelConfig::default(),
            accounts(),
            transport,
        );
        assert!(channel.close().await.is_ok());
        assert_eq!(channel.state(), ChannelState::Initiating);
        channel.dispose().await;
    }

    #[tokio::test]
    async fn double_peer_connection_start_fails() {
        let (transport, _peer) = MemorySignaling::pair();
        let channel = Channel::new(
            ChannelKind::node(peer_signer()),
            ChannelConfig::default(),
            accounts(),
            transport,
        );
        channel
            .start_peer_connection(Vec::new())
            .await
            .expect("first start");
        assert!(channel.start_peer_connection(Vec::new()).await.is_err());
        channel.dispose().await;
    }

    #[tokio::test]
    async fn inbound_rejection_marks_channel_rejected() {
        let (ours, theirs) = MemorySignaling::pair();
        let cfg = ChannelConfig {
            initiated_by_us: true,
            polite: true,
            ..ChannelConfig::default()
        };
        let manager = accounts();
        let local = manager.address();
        let channel = Channel::new(
            ChannelKind::node(peer_signer()),
            cfg,
            manager,
            Arc::clone(&ours) as Arc<dyn SignalingTransport>,
        );
        // Walk the channel into the handshake so Rejected is reachable.
        channel.try_advance(ChannelState::Connecting);
        channel.try_advance(ChannelState::Signalling);

        ours.connect().await.unwrap();
        theirs.connect().await.unwrap();
        let rejection = MessageEnvelope::build(
            crate::envelope::Party::node(peer_signer()),
            crate::envelope::Party::node(local),
            Payload::Rejection,
            1,
        );
        theirs.send(rejection).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.state(), ChannelState::Rejected);

        // A polite channel refuses to reopen after rejection.
        assert!(channel.open().await.is_err());
        channel.dispose().await;
    }
}
