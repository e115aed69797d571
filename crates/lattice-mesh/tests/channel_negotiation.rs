//! End-to-end negotiation between two channels over an in-memory signalling
//! pair, with the WebRTC stack running on a virtual network so no OS
//! networking access is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout, Instant};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use lattice_mesh::channel::SettingEngineFactory;
use lattice_mesh::envelope::serialize;
use lattice_mesh::signaling::memory::MemorySignaling;
use lattice_mesh::signaling::{EnvelopeHandler, OpenHandler};
use lattice_mesh::{
    AccountManager, Channel, ChannelConfig, ChannelKind, ChannelState, MessageEnvelope, Party,
    Payload, SessionDescription, SignalingError, SignalingTransport,
};

async fn attach_vnet(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) {
    let nic = net.get_nic().expect("vnet nic");
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard.add_net(nic_clone).await.expect("add net");
    }
    let nic_guard = nic.lock().await;
    nic_guard
        .set_router(Arc::clone(router))
        .await
        .expect("set router");
}

async fn build_wan() -> (Arc<AsyncMutex<Router>>, Arc<Net>, Arc<Net>) {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .expect("router"),
    ));
    let net_a = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet(&net_a, &wan).await;
    let net_b = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet(&net_b, &wan).await;
    wan.lock().await.start().await.expect("router start");
    (wan, net_a, net_b)
}

fn vnet_setting(net: Arc<Net>) -> SettingEngineFactory {
    Arc::new(move || {
        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(Arc::clone(&net)));
        setting.set_ice_timeouts(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(1)),
            Some(Duration::from_millis(200)),
        );
        setting
    })
}

async fn wait_for_state(channel: &Arc<Channel>, want: ChannelState, budget: Duration) {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if channel.state() == want {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "channel did not reach {want:?} in time (still {:?})",
        channel.state()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offer_accept_traffic_close_and_reopen() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let initiator_accounts = Arc::new(AccountManager::from_key(b"initiator".to_vec()));
    let responder_accounts = Arc::new(AccountManager::from_key(b"responder".to_vec()));
    let initiator_addr = initiator_accounts.address();
    let responder_addr = responder_accounts.address();

    let (_wan, net_a, net_b) = build_wan().await;
    let (end_a, end_b) = MemorySignaling::pair();

    // The host demultiplexes offers before a responder channel accepts.
    let (offer_tx, mut offer_rx) = mpsc::unbounded_channel::<SessionDescription>();
    end_b.on_message(Box::new(move |envelope| {
        if let Payload::Offer { offer } = envelope.payload {
            let _ = offer_tx.send(offer);
        }
    }));

    let fast_heartbeat = Duration::from_millis(200);
    let initiator = Channel::new(
        ChannelKind::node(responder_addr.clone()),
        ChannelConfig {
            polite: false,
            initiated_by_us: true,
            heartbeat_interval: fast_heartbeat,
            setting_engine: Some(vnet_setting(net_a)),
            ..ChannelConfig::default()
        },
        Arc::clone(&initiator_accounts),
        Arc::clone(&end_a) as Arc<dyn SignalingTransport>,
    );
    let responder = Channel::new(
        ChannelKind::node(initiator_addr.clone()),
        ChannelConfig {
            polite: true,
            initiated_by_us: false,
            heartbeat_interval: fast_heartbeat,
            setting_engine: Some(vnet_setting(net_b)),
            ..ChannelConfig::default()
        },
        Arc::clone(&responder_accounts),
        Arc::clone(&end_b) as Arc<dyn SignalingTransport>,
    );

    initiator
        .start_peer_connection(Vec::new())
        .await
        .expect("initiator peer connection");
    responder
        .start_peer_connection(Vec::new())
        .await
        .expect("responder peer connection");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    responder.on_message(move |envelope| {
        if let Payload::Broadcast { text } = envelope.payload {
            let _ = seen_tx.send(text);
        }
    });

    initiator.open().await.expect("open");
    let offer = timeout(Duration::from_secs(5), offer_rx.recv())
        .await
        .expect("offer in time")
        .expect("offer present");
    responder.accept(offer).await.expect("accept");

    wait_for_state(&initiator, ChannelState::Open, Duration::from_secs(10)).await;
    wait_for_state(&responder, ChannelState::Open, Duration::from_secs(10)).await;
    assert!(initiator.is_stable());
    assert!(responder.is_stable());

    // Application traffic flows initiator -> responder.
    let hello = MessageEnvelope::build(
        Party::node(initiator_addr.clone()),
        Party::node(responder_addr.clone()),
        Payload::Broadcast {
            text: "hello mesh".into(),
        },
        1,
    );
    initiator.send(&serialize(&hello)).await.expect("send");
    let text = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("delivery in time")
        .expect("delivery present");
    assert_eq!(text, "hello mesh");

    // Heartbeat produces a latency measurement on the pinging side.
    let deadline = Instant::now() + Duration::from_secs(5);
    while initiator.latency_ms() == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    assert!(initiator.latency_ms() > 0, "heartbeat never completed");

    // Graceful close: data channel goes away, the command channel survives,
    // and the remote follows to Closed via the Close token.
    initiator.close().await.expect("close");
    assert_eq!(initiator.state(), ChannelState::Closed);
    wait_for_state(&responder, ChannelState::Closed, Duration::from_secs(5)).await;
    assert_eq!(initiator.latency_ms(), 0, "latency resets on close");

    // Reopen without renegotiating ICE.
    initiator.open().await.expect("reopen");
    assert_eq!(initiator.state(), ChannelState::Open);
    wait_for_state(&responder, ChannelState::Open, Duration::from_secs(10)).await;

    let again = MessageEnvelope::build(
        Party::node(initiator_addr.clone()),
        Party::node(responder_addr.clone()),
        Payload::Broadcast {
            text: "after reopen".into(),
        },
        2,
    );
    initiator.send(&serialize(&again)).await.expect("send again");
    let text = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("redelivery in time")
        .expect("redelivery present");
    assert_eq!(text, "after reopen");

    initiator.dispose().await;
    responder.dispose().await;
    assert_eq!(initiator.state(), ChannelState::Disposed);
    assert_eq!(responder.state(), ChannelState::Disposed);
}

/// Signalling that accepts subscriptions but never finishes connecting.
struct HangingSignaling;

#[async_trait]
impl SignalingTransport for HangingSignaling {
    fn is_open(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), SignalingError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn disconnect(&self) {}

    async fn send(&self, _envelope: MessageEnvelope) -> Result<(), SignalingError> {
        Err(SignalingError::Closed)
    }

    fn on_open(&self, _handler: OpenHandler) {}

    fn on_message(&self, _handler: EnvelopeHandler) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signalling_connect_timeout_fails_the_channel() {
    let accounts = Arc::new(AccountManager::from_key(b"timeout-test".to_vec()));
    let peer: lattice_mesh::Address = "b".repeat(40).parse().unwrap();
    let channel = Channel::new(
        ChannelKind::node(peer),
        ChannelConfig {
            initiated_by_us: true,
            signaling_timeout: Duration::from_millis(400),
            ..ChannelConfig::default()
        },
        accounts,
        Arc::new(HangingSignaling),
    );

    let timed_out = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&timed_out);
    channel.on_timeout(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let err = channel.open().await;
    assert!(err.is_err(), "open should fail on signalling timeout");
    assert_eq!(channel.state(), ChannelState::Failed);
    assert_eq!(timed_out.load(std::sync::atomic::Ordering::SeqCst), 1);

    channel.dispose().await;
    assert_eq!(channel.state(), ChannelState::Disposed);
}
