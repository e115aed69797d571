//! Host-side admission: an inbound offer on signalling becomes a registered
//! node channel that negotiates to `Open`, and a remote dispose removes it
//! from the registry again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout, Instant};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use lattice_mesh::channel::SettingEngineFactory;
use lattice_mesh::signaling::memory::MemorySignaling;
use lattice_mesh::{
    AccountManager, Channel, ChannelConfig, ChannelKind, ChannelManager, ChannelState,
    MessageEnvelope, SignalingTransport, Validators,
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

async fn wait_until<F: Fn() -> bool>(what: &str, budget: Duration, check: F) {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inbound_offer_registers_a_channel_and_remote_dispose_evicts_it() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .expect("router"),
    ));
    let net_remote = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet(&net_remote, &wan).await;
    let net_local = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet(&net_local, &wan).await;
    wan.lock().await.start().await.expect("router start");

    let remote_accounts = Arc::new(AccountManager::from_key(b"remote-node".to_vec()));
    let local_accounts = Arc::new(AccountManager::from_key(b"local-node".to_vec()));
    let remote_signer = remote_accounts.address();

    let manager = ChannelManager::with_channel_template(
        Arc::clone(&local_accounts),
        Validators::default(),
        ChannelConfig {
            ice_servers: Vec::new(),
            setting_engine: Some(vnet_setting(Arc::clone(&net_local))),
            ..ChannelConfig::default()
        },
    );

    let (end_remote, end_local) = MemorySignaling::pair();

    // Host behavior: offers arriving on signalling go to manager admission.
    let (offer_tx, mut offer_rx) = mpsc::unbounded_channel::<MessageEnvelope>();
    end_local.on_message(Box::new(move |envelope| {
        if matches!(envelope.payload, lattice_mesh::Payload::Offer { .. }) {
            let _ = offer_tx.send(envelope);
        }
    }));

    let remote = Channel::new(
        ChannelKind::node(local_accounts.address()),
        ChannelConfig {
            polite: false,
            initiated_by_us: true,
            setting_engine: Some(vnet_setting(Arc::clone(&net_remote))),
            ..ChannelConfig::default()
        },
        Arc::clone(&remote_accounts),
        Arc::clone(&end_remote) as Arc<dyn SignalingTransport>,
    );
    remote
        .start_peer_connection(Vec::new())
        .await
        .expect("remote peer connection");

    remote.open().await.expect("remote open");

    let offer_envelope = timeout(Duration::from_secs(5), offer_rx.recv())
        .await
        .expect("offer in time")
        .expect("offer present");
    let accepted = manager
        .handle_inbound_offer(
            offer_envelope,
            Arc::clone(&end_local) as Arc<dyn SignalingTransport>,
        )
        .await
        .expect("offer admitted");

    assert!(manager.is_known_node(&remote_signer));
    assert!(accepted.is_polite());
    assert!(!accepted.initiated_by_us());

    let local_channel = manager
        .get_node_channel(&remote_signer)
        .expect("registered channel");
    let probe = Arc::clone(&local_channel);
    wait_until("local channel open", Duration::from_secs(10), move || {
        probe.state() == ChannelState::Open
    })
    .await;
    let probe = Arc::clone(&remote);
    wait_until("remote channel open", Duration::from_secs(10), move || {
        probe.state() == ChannelState::Open
    })
    .await;
    assert!(local_channel.is_stable());

    // Hard teardown on the remote propagates over the command channel and
    // empties the registry here.
    remote.dispose().await;
    let registry = Arc::clone(&manager);
    let gone_signer = remote_signer.clone();
    wait_until("registry eviction", Duration::from_secs(5), move || {
        !registry.is_known_node(&gone_signer)
    })
    .await;

    manager.dispose().await;
}
