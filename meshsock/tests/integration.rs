//! Scenarios running several managers over loopback UDP and an in-memory relay.

use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use meshsock::{
    Handle, MagicSock, Options, PeerInfo, PublicKey, RecvError, RegionId, RelayMap, SecretKey,
    SendError,
    net_report::{NetReportError, NetReporter, Report},
};
use meshsock_relay::{RelayRegion, test_utils::TestRelay};
use tokio::task::JoinHandle;
use tracing_test::traced_test;

const REGION: RegionId = 1;

/// Reports a working IPv4 network with [`REGION`] as the closest relay.
#[derive(Debug)]
struct LoopbackReporter;

impl NetReporter for LoopbackReporter {
    fn get_report(&self, _relay_map: RelayMap) -> BoxFuture<'static, Result<Report, NetReportError>> {
        Box::pin(async {
            Ok(Report {
                udp: true,
                ipv4: true,
                ipv4_can_send: true,
                preferred_region: Some(REGION),
                ..Default::default()
            })
        })
    }

    fn receive_stun_packet(&self, _packet: &[u8], _src: SocketAddr) {}
}

struct Node {
    handle: Handle,
}

impl Node {
    async fn spawn(relay: &TestRelay, tweak: impl FnOnce(&mut Options)) -> Self {
        let secret_key = SecretKey::generate(&mut rand::rngs::OsRng);
        let mut opts = Options {
            relay_map: [RelayRegion::from_url(
                REGION,
                "https://relay.example.com".parse().unwrap(),
            )]
            .into_iter()
            .collect(),
            relay_dialer: Some(relay.dialer(secret_key.public())),
            net_reporter: Some(Arc::new(LoopbackReporter)),
            secret_key,
            disable_ipv6: true,
            ..Default::default()
        };
        tweak(&mut opts);
        let handle = MagicSock::spawn(opts).await.unwrap();
        Self { handle }
    }

    fn id(&self) -> PublicKey {
        self.handle.node_id()
    }

    fn loopback_addr(&self) -> SocketAddr {
        let port = self.handle.local_addrs()[0].port();
        (Ipv4Addr::LOCALHOST, port).into()
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.id(),
            disco_key: Some(self.handle.disco_public_key()),
            relay_region: Some(REGION),
            direct_addrs: BTreeSet::from([self.loopback_addr()]),
        }
    }

    /// Receives until closed, returns how many packets arrived.
    fn drain(&self) -> JoinHandle<usize> {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let mut count = 0;
            while let Ok(batch) = handle.receive_batch(64).await {
                count += batch.len();
            }
            count
        })
    }
}

async fn wait_until(what: &str, timeout: Duration, mut f: impl AsyncFnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !f().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {what}"));
}

async fn connected_pair(relay: &TestRelay) -> (Node, Node) {
    let a = Node::spawn(relay, |_| {}).await;
    let b = Node::spawn(relay, |_| {}).await;
    a.handle.set_peer_set(vec![b.peer_info()]);
    b.handle.set_peer_set(vec![a.peer_info()]);
    (a, b)
}

async fn upgrade_to_direct(a: &Node, b: &Node) {
    let (a_id, b_id) = (a.id(), b.id());
    wait_until("direct paths", Duration::from_secs(30), async || {
        // traffic drives the path discovery
        a.handle.send(b_id, Bytes::from_static(b"ping a->b")).await.ok();
        b.handle.send(a_id, Bytes::from_static(b"ping b->a")).await.ok();
        let direct = |choice: Option<meshsock::SendChoice>| {
            choice.is_some_and(|c| c.udp_addr.is_some() && c.relay.is_none() && !c.must_ping)
        };
        direct(a.handle.choose_send_addr(&b_id)) && direct(b.handle.choose_send_addr(&a_id))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn direct_upgrade_over_loopback() {
    let relay = TestRelay::new();
    let (a, b) = connected_pair(&relay).await;
    let a_rx = a.drain();
    let b_rx = b.drain();

    upgrade_to_direct(&a, &b).await;

    let choice = a.handle.choose_send_addr(&b.id()).unwrap();
    // loopback or one of b's interface addresses, always b's port
    assert_eq!(choice.udp_addr.map(|a| a.port()), Some(b.loopback_addr().port()));
    assert!(a.handle.metrics().sent_disco_ping.get() > 0);
    assert!(b.handle.metrics().sent_disco_pong.get() > 0);

    let before = b.handle.metrics().recv_data_ipv4.get();
    a.handle
        .send(b.id(), Bytes::from_static(b"direct"))
        .await
        .unwrap();
    wait_until("direct payload", Duration::from_secs(5), async || {
        b.handle.metrics().recv_data_ipv4.get() > before
    })
    .await;

    let info = a
        .handle
        .status()
        .peers
        .into_iter()
        .find(|p| p.node_id == b.id())
        .unwrap();
    assert_eq!(info.best_addr, choice.udp_addr);
    assert!(info.latency.is_some());

    a.handle.close().await;
    b.handle.close().await;
    assert!(a_rx.await.unwrap() > 0);
    assert!(b_rx.await.unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn rebind_invalidates_trust() {
    let relay = TestRelay::new();
    let (a, b) = connected_pair(&relay).await;
    let _a_rx = a.drain();
    let _b_rx = b.drain();
    upgrade_to_direct(&a, &b).await;

    a.handle.rebind().await.unwrap();
    let choice = a.handle.choose_send_addr(&b.id()).unwrap();
    assert!(choice.must_ping);
    assert_eq!(a.handle.metrics().rebinds.get(), 1);
    // the candidates survive
    let info = a
        .handle
        .status()
        .peers
        .into_iter()
        .find(|p| p.node_id == b.id())
        .unwrap();
    assert!(info.addrs.iter().any(|addr| addr.addr == b.loopback_addr()));

    a.handle.close().await;
    b.handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn relay_only_peer_never_pings() {
    let relay = TestRelay::new();
    let a = Node::spawn(&relay, |_| {}).await;
    let b = Node::spawn(&relay, |_| {}).await;
    let (a_id, b_id) = (a.id(), b.id());
    a.handle
        .set_peer_set(vec![PeerInfo::relay_only(b_id, REGION)]);
    b.handle
        .set_peer_set(vec![PeerInfo::relay_only(a_id, REGION)]);
    wait_until("relay sessions", Duration::from_secs(10), async || {
        let connected = relay.connected(REGION);
        connected.contains(&a_id) && connected.contains(&b_id)
    })
    .await;

    for i in 0..10u8 {
        a.handle.send(b_id, Bytes::from(vec![i; 16])).await.unwrap();
    }
    let mut got = Vec::new();
    while got.len() < 10 {
        let batch = tokio::time::timeout(Duration::from_secs(5), b.handle.receive_batch(16))
            .await
            .unwrap()
            .unwrap();
        got.extend(batch);
    }
    // order is kept on a single relay session
    for (i, (from, data)) in got.iter().enumerate() {
        assert_eq!(*from, a_id);
        assert_eq!(data[0], i as u8);
    }

    let choice = a.handle.choose_send_addr(&b_id).unwrap();
    assert_eq!(choice.udp_addr, None);
    assert_eq!(choice.relay, Some(REGION));
    assert_eq!(a.handle.metrics().sent_disco_ping.get(), 0);
    assert_eq!(a.handle.metrics().sent_disco_call_me_maybe.get(), 0);

    a.handle.close().await;
    b.handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn close_unblocks_receive() {
    let relay = TestRelay::new();

    // with direct paths
    let (a, b) = connected_pair(&relay).await;
    let blocked = tokio::spawn({
        let handle = a.handle.clone();
        async move { handle.receive_batch(8).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    tokio::time::timeout(Duration::from_secs(5), a.handle.close())
        .await
        .unwrap();
    let res = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(RecvError::Closed { .. })));
    assert!(a.handle.is_closed());
    b.handle.close().await;

    // relay only, with an unreachable relay
    relay.set_unreachable(REGION, true);
    let c = Node::spawn(&relay, |_| {}).await;
    c.handle
        .set_peer_set(vec![PeerInfo::relay_only(b.id(), REGION)]);
    let blocked = tokio::spawn({
        let handle = c.handle.clone();
        async move { handle.receive_batch(8).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(5), c.handle.close())
        .await
        .unwrap();
    let res = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(RecvError::Closed { .. })));

    let err = c
        .handle
        .send(b.id(), Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Closed { .. }));
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn relay_backpressure_drops() {
    let relay = TestRelay::new();
    relay.set_unreachable(REGION, true);
    let a = Node::spawn(&relay, |opts| opts.relay_queue_len = 2).await;
    let peer = SecretKey::generate(&mut rand::rngs::OsRng).public();
    a.handle
        .set_peer_set(vec![PeerInfo::relay_only(peer, REGION)]);

    let mut sent = 0;
    let mut full = 0;
    for _ in 0..10 {
        match a.handle.send(peer, Bytes::from_static(b"data")).await {
            Ok(()) => sent += 1,
            Err(SendError::QueueFull { region, .. }) => {
                assert_eq!(region, REGION);
                full += 1;
            }
            Err(err) => panic!("unexpected error: {err:#}"),
        }
    }
    // sends never block, the overflow is dropped and counted
    assert!(full > 0);
    assert_eq!(sent + full, 10);
    assert_eq!(a.handle.metrics().send_relay_queue_full.get(), full);

    a.handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn peer_set_changes_drop_state() {
    let relay = TestRelay::new();
    let (a, b) = connected_pair(&relay).await;
    assert!(a.handle.choose_send_addr(&b.id()).is_some());

    a.handle.set_peer_set(Vec::new());
    assert!(a.handle.choose_send_addr(&b.id()).is_none());
    assert!(a.handle.status().peers.is_empty());
    let err = a
        .handle
        .send(b.id(), Bytes::from_static(b"gone"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::UnknownPeer { .. }));

    a.handle.close().await;
    b.handle.close().await;
}
