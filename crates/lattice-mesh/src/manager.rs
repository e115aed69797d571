//! Process-wide registry of peer channels: owns their lifecycle, admits
//! inbound offers from signalling, and routes relay/broadcast envelopes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::account::AccountManager;
use crate::address::Address;
use crate::channel::{Channel, ChannelConfig, ChannelKind};
use crate::envelope::{serialize, MessageEnvelope, Payload};
use crate::error::MeshError;
use crate::signaling::SignalingTransport;

/// Out-of-core admission predicates. Real deployments plug discovery and
/// signature verification in here; the defaults admit everything.
#[derive(Clone)]
pub struct Validators {
    pub is_valid_node: Arc<dyn Fn(&Address) -> bool + Send + Sync>,
    pub is_valid_account: Arc<dyn Fn(&Address) -> bool + Send + Sync>,
    pub verify_signature: Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>,
}

impl Default for Validators {
    fn default() -> Self {
        Validators {
            is_valid_node: Arc::new(|_| true),
            is_valid_account: Arc::new(|_| true),
            verify_signature: Arc::new(|_| true),
        }
    }
}

pub struct ChannelManager {
    accounts: Arc<AccountManager>,
    validators: Validators,
    channel_template: ChannelConfig,
    nodes: RwLock<HashMap<Address, Arc<Channel>>>,
    account_channels: RwLock<HashMap<Address, HashMap<Address, Arc<Channel>>>>,
    // Serializes create against create; removals go straight through the
    // registry locks.
    create_guard: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl ChannelManager {
    pub fn new(accounts: Arc<AccountManager>, validators: Validators) -> Arc<Self> {
        Self::with_channel_template(accounts, validators, ChannelConfig::default())
    }

    /// Template applied to every created channel; politeness and initiation
    /// are forced to the manager's conventions.
    pub fn with_channel_template(
        accounts: Arc<AccountManager>,
        validators: Validators,
        channel_template: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new(ChannelManager {
            accounts,
            validators,
            channel_template,
            nodes: RwLock::new(HashMap::new()),
            account_channels: RwLock::new(HashMap::new()),
            create_guard: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn local_signer(&self) -> Address {
        self.accounts.address()
    }

    // ── Registry queries ─────────────────────────────────────────────────

    pub fn is_known_node(&self, signer: &Address) -> bool {
        self.nodes.read().contains_key(signer)
    }

    pub fn get_node_channel(&self, signer: &Address) -> Option<Arc<Channel>> {
        self.nodes.read().get(signer).cloned()
    }

    /// Snapshot copy; mutating it does not touch the registry.
    pub fn get_node_channels(&self) -> HashMap<Address, Arc<Channel>> {
        self.nodes.read().clone()
    }

    pub fn is_known_account(&self, account: &Address) -> bool {
        self.account_channels.read().contains_key(account)
    }

    pub fn is_known_account_signer(&self, account: &Address, signer: &Address) -> bool {
        self.account_channels
            .read()
            .get(account)
            .map(|devices| devices.contains_key(signer))
            .unwrap_or(false)
    }

    pub fn get_account_channel(&self, account: &Address, signer: &Address) -> Option<Arc<Channel>> {
        self.account_channels
            .read()
            .get(account)
            .and_then(|devices| devices.get(signer))
            .cloned()
    }

    /// Snapshot copy, device maps included.
    pub fn get_account_channels(&self) -> HashMap<Address, HashMap<Address, Arc<Channel>>> {
        self.account_channels.read().clone()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn account_channel_count(&self) -> usize {
        self.account_channels
            .read()
            .values()
            .map(|devices| devices.len())
            .sum()
    }

    // ── Creation ─────────────────────────────────────────────────────────

    pub async fn create_node_channel(
        self: &Arc<Self>,
        signer: Address,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Channel>, MeshError> {
        self.ensure_running()?;
        let _guard = self.create_guard.lock().await;
        if let Some(existing) = self.get_node_channel(&signer) {
            return Ok(existing);
        }
        let channel = self
            .build_channel(ChannelKind::node(signer.clone()), signaling)
            .await?;
        self.nodes.write().insert(signer, Arc::clone(&channel));
        Ok(channel)
    }

    pub async fn create_account_channel(
        self: &Arc<Self>,
        account: Address,
        signer: Address,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Channel>, MeshError> {
        self.ensure_running()?;
        let _guard = self.create_guard.lock().await;
        if let Some(existing) = self.get_account_channel(&account, &signer) {
            return Ok(existing);
        }
        let channel = self
            .build_channel(
                ChannelKind::account(account.clone(), signer.clone()),
                signaling,
            )
            .await?;
        self.account_channels
            .write()
            .entry(account)
            .or_default()
            .insert(signer, Arc::clone(&channel));
        Ok(channel)
    }

    /// Outbound path: register an impolite, initiated-by-us channel toward a
    /// known remote signer and start negotiation.
    pub async fn dial_node_channel(
        self: &Arc<Self>,
        signer: Address,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Channel>, MeshError> {
        self.ensure_running()?;
        let channel = {
            let _guard = self.create_guard.lock().await;
            if let Some(existing) = self.get_node_channel(&signer) {
                existing
            } else {
                let channel = self
                    .build_channel_with(ChannelKind::node(signer.clone()), signaling, false, true)
                    .await?;
                self.nodes.write().insert(signer, Arc::clone(&channel));
                channel
            }
        };
        if let Err(err) = channel.open().await {
            self.evict(channel.kind(), true);
            return Err(err);
        }
        Ok(channel)
    }

    async fn build_channel(
        self: &Arc<Self>,
        kind: ChannelKind,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Channel>, MeshError> {
        self.build_channel_with(kind, signaling, true, false).await
    }

    async fn build_channel_with(
        self: &Arc<Self>,
        kind: ChannelKind,
        signaling: Arc<dyn SignalingTransport>,
        polite: bool,
        initiated_by_us: bool,
    ) -> Result<Arc<Channel>, MeshError> {
        let cfg = ChannelConfig {
            polite,
            initiated_by_us,
            verify: self.validators.verify_signature.clone(),
            ..self.channel_template.clone()
        };
        let ice_servers = cfg.ice_servers.clone();
        let channel = Channel::new(kind.clone(), cfg, Arc::clone(&self.accounts), signaling);
        channel.start_peer_connection(ice_servers).await?;

        let manager = Arc::downgrade(self);
        channel.on_message(move |envelope| {
            if let Some(manager) = manager.upgrade() {
                manager.route(envelope);
            }
        });

        let heartbeat_target = Arc::downgrade(&channel);
        channel.on_stable(move || {
            if let Some(channel) = heartbeat_target.upgrade() {
                channel.start_heartbeat(None, None);
            }
        });

        let manager = Arc::downgrade(self);
        let timed_out = kind.clone();
        channel.on_timeout(move || {
            if let Some(manager) = manager.upgrade() {
                manager.evict(&timed_out, true);
            }
        });

        let manager = Arc::downgrade(self);
        let disposed = kind.clone();
        channel.on_dispose(move || {
            if let Some(manager) = manager.upgrade() {
                manager.evict(&disposed, false);
            }
        });

        info!(kind = kind.label(), signer = %kind.destination_signer(), "channel registered");
        Ok(channel)
    }

    /// Drop a channel from the registry; with `dispose` the teardown runs on
    /// a worker so event callbacks never re-enter the channel inline.
    fn evict(self: &Arc<Self>, kind: &ChannelKind, dispose: bool) {
        let removed = match kind {
            ChannelKind::Node { signer } => self.nodes.write().remove(signer),
            ChannelKind::Account { account, signer } => {
                let mut registry = self.account_channels.write();
                let removed = registry
                    .get_mut(account)
                    .and_then(|devices| devices.remove(signer));
                if registry.get(account).map(HashMap::is_empty).unwrap_or(false) {
                    registry.remove(account);
                }
                removed
            }
        };
        if let Some(channel) = removed {
            debug!(kind = kind.label(), signer = %kind.destination_signer(), "channel removed");
            if dispose {
                tokio::spawn(async move {
                    channel.dispose().await;
                });
            }
        }
    }

    // ── Inbound admission ────────────────────────────────────────────────

    /// Host entry point for an `Offer` envelope arriving on signalling:
    /// verify, classify the sender, create the channel, accept.
    pub async fn handle_inbound_offer(
        self: &Arc<Self>,
        envelope: MessageEnvelope,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Channel>, MeshError> {
        self.ensure_running()?;
        if !(self.validators.verify_signature)(&envelope) {
            return Err(MeshError::Admission("signature check failed".into()));
        }
        if envelope.is_expired(Utc::now().timestamp()) {
            return Err(MeshError::Admission("offer envelope expired".into()));
        }
        if !self.accounts.is_signer(&envelope.receiver.signer) {
            return Err(MeshError::Admission(
                "receiver is not the local signer".into(),
            ));
        }
        let Payload::Offer { offer } = envelope.payload.clone() else {
            return Err(MeshError::Admission("payload is not an offer".into()));
        };

        let channel = if envelope.sender.is_node() {
            let signer = envelope.sender.signer.clone();
            if !(self.validators.is_valid_node)(&signer) {
                return Err(MeshError::Admission(format!(
                    "sender {signer} is not a valid node"
                )));
            }
            self.create_node_channel(signer, signaling).await?
        } else {
            let account = envelope.sender.account_address().ok_or_else(|| {
                MeshError::Admission(format!(
                    "sender account {:?} is not an address",
                    envelope.sender.account
                ))
            })?;
            if !(self.validators.is_valid_account)(&account) {
                return Err(MeshError::Admission(format!(
                    "sender account {account} is not registered"
                )));
            }
            self.create_account_channel(account, envelope.sender.signer.clone(), signaling)
                .await?
        };
        channel.accept(offer).await?;
        Ok(channel)
    }

    // ── Routing ──────────────────────────────────────────────────────────

    fn route(self: &Arc<Self>, envelope: MessageEnvelope) {
        match &envelope.payload {
            Payload::Broadcast { .. } => self.broadcast(envelope),
            Payload::Relay { receiver, .. } => {
                // Relay forwarding is a host concern; the mesh only accepts
                // and surfaces it.
                info!(receiver = %receiver, "relay envelope accepted (not forwarded)");
            }
            other => {
                debug!(kind = other.kind(), "unrouted envelope ignored");
            }
        }
    }

    /// Forward a broadcast to every account channel except the sender's own
    /// account. Per-channel failures are logged and do not stop the sweep.
    fn broadcast(self: &Arc<Self>, envelope: MessageEnvelope) {
        let sender_account = envelope.sender.account_address();
        let text = serialize(&envelope);
        let targets: Vec<(Address, Arc<Channel>)> = self
            .account_channels
            .read()
            .iter()
            .filter(|(account, _)| sender_account.as_ref() != Some(*account))
            .flat_map(|(account, devices)| {
                devices
                    .values()
                    .map(|channel| (account.clone(), Arc::clone(channel)))
            })
            .collect();
        for (account, channel) in targets {
            let text = text.clone();
            tokio::spawn(async move {
                if let Err(err) = channel.send(&text).await {
                    warn!(account = %account, error = %err, "broadcast delivery failed");
                }
            });
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<(), MeshError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MeshError::Internal("channel manager disposed".into()));
        }
        Ok(())
    }

    /// Dispose every channel (best effort) and clear the registries.
    pub async fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.create_guard.lock().await;
        let nodes: Vec<Arc<Channel>> = self.nodes.write().drain().map(|(_, ch)| ch).collect();
        let accounts: Vec<Arc<Channel>> = self
            .account_channels
            .write()
            .drain()
            .flat_map(|(_, devices)| devices.into_values())
            .collect();
        for channel in nodes.into_iter().chain(accounts) {
            channel.dispose().await;
        }
        info!("channel manager disposed");
    }
}

/// Weak handle stored inside event callbacks; kept public for hosts that wire
/// their own channels into the registry's routing.
pub type ManagerHandle = Weak<ChannelManager>;
