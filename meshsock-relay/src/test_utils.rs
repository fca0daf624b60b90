//! An in-memory relay for tests.
//!
//! [`TestRelay`] forwards packets between every [`RelayConn`] it handed out for the same
//! region, keyed by the public key each dialer was created for. It can be told to refuse
//! the HTTP upgrade for a region, or to be unreachable, to exercise fallback paths.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use meshsock_base::PublicKey;
use snafu::IntoError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    RegionId, RelayRegion,
    client::{
        ConnClosedSnafu, ConnectError, DialSnafu, ReceivedPacket, RelayConn, RelayDialer,
        RelayError, Transport, UpgradeRefusedSnafu,
    },
};

const CLIENT_QUEUE: usize = 512;

/// A relay hub shared by all test nodes.
#[derive(Debug, Clone, Default)]
pub struct TestRelay {
    inner: Arc<Mutex<Hub>>,
}

#[derive(Debug, Default)]
struct Hub {
    clients: BTreeMap<(RegionId, PublicKey), Client>,
    refuse_http: BTreeSet<RegionId>,
    unreachable: BTreeSet<RegionId>,
    dials: Vec<(RegionId, PublicKey, Transport)>,
    next_conn_id: u64,
}

#[derive(Debug)]
struct Client {
    conn_id: u64,
    tx: mpsc::Sender<ReceivedPacket>,
}

impl TestRelay {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a dialer connecting as `me`.
    pub fn dialer(&self, me: PublicKey) -> Arc<TestDialer> {
        Arc::new(TestDialer {
            hub: self.clone(),
            me,
        })
    }

    /// Makes the HTTP upgrade fail for `region`, forcing WebSocket.
    pub fn refuse_http_upgrade(&self, region: RegionId) {
        self.inner.lock().expect("poisoned").refuse_http.insert(region);
    }

    /// Makes every dial to `region` fail, or succeed again.
    pub fn set_unreachable(&self, region: RegionId, unreachable: bool) {
        let mut hub = self.inner.lock().expect("poisoned");
        if unreachable {
            hub.unreachable.insert(region);
        } else {
            hub.unreachable.remove(&region);
        }
    }

    /// Every dial attempt so far.
    pub fn dials(&self) -> Vec<(RegionId, PublicKey, Transport)> {
        self.inner.lock().expect("poisoned").dials.clone()
    }

    /// The peers currently connected to `region`.
    pub fn connected(&self, region: RegionId) -> Vec<PublicKey> {
        self.inner
            .lock()
            .expect("poisoned")
            .clients
            .keys()
            .filter(|(r, _)| *r == region)
            .map(|(_, k)| *k)
            .collect()
    }

    fn register(&self, region: RegionId, me: PublicKey, transport: Transport) -> TestConn {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let mut hub = self.inner.lock().expect("poisoned");
        hub.next_conn_id += 1;
        let conn_id = hub.next_conn_id;
        hub.clients.insert((region, me), Client { conn_id, tx });
        TestConn {
            hub: self.clone(),
            region,
            me,
            conn_id,
            transport,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    fn forward(&self, region: RegionId, src: PublicKey, dst: PublicKey, data: Bytes) {
        let hub = self.inner.lock().expect("poisoned");
        match hub.clients.get(&(region, dst)) {
            Some(client) => {
                if client.tx.try_send(ReceivedPacket { src, data }).is_err() {
                    debug!(%region, dst = %dst.fmt_short(), "test relay dropped packet");
                }
            }
            None => trace!(%region, dst = %dst.fmt_short(), "no such client"),
        }
    }

    fn unregister(&self, region: RegionId, me: PublicKey, conn_id: u64) {
        let mut hub = self.inner.lock().expect("poisoned");
        if hub
            .clients
            .get(&(region, me))
            .is_some_and(|c| c.conn_id == conn_id)
        {
            hub.clients.remove(&(region, me));
        }
    }
}

/// A [`RelayDialer`] for a [`TestRelay`].
#[derive(Debug)]
pub struct TestDialer {
    hub: TestRelay,
    me: PublicKey,
}

impl RelayDialer for TestDialer {
    fn dial(
        &self,
        region: Arc<RelayRegion>,
        transport: Transport,
    ) -> BoxFuture<'static, Result<Box<dyn RelayConn>, ConnectError>> {
        let hub = self.hub.clone();
        let me = self.me;
        async move {
            let region_id = region.region_id;
            let (unreachable, refused) = {
                let mut inner = hub.inner.lock().expect("poisoned");
                inner.dials.push((region_id, me, transport));
                (
                    inner.unreachable.contains(&region_id),
                    inner.refuse_http.contains(&region_id),
                )
            };
            if unreachable {
                let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable");
                return Err(DialSnafu.into_error(err));
            }
            if refused && transport == Transport::Http {
                return Err(UpgradeRefusedSnafu {
                    reason: "426 upgrade required",
                }
                .build());
            }
            let conn: Box<dyn RelayConn> = Box::new(hub.register(region_id, me, transport));
            Ok(conn)
        }
        .boxed()
    }
}

/// A connection to a [`TestRelay`].
#[derive(Debug)]
pub struct TestConn {
    hub: TestRelay,
    region: RegionId,
    me: PublicKey,
    conn_id: u64,
    transport: Transport,
    rx: tokio::sync::Mutex<mpsc::Receiver<ReceivedPacket>>,
    closed: CancellationToken,
}

impl RelayConn for TestConn {
    fn send(&self, dst: PublicKey, packet: Bytes) -> BoxFuture<'_, Result<(), RelayError>> {
        async move {
            if self.closed.is_cancelled() {
                return ConnClosedSnafu.fail();
            }
            self.hub.forward(self.region, self.me, dst, packet);
            Ok(())
        }
        .boxed()
    }

    fn recv(&self) -> BoxFuture<'_, Result<ReceivedPacket, RelayError>> {
        async move {
            let mut rx = tokio::select! {
                _ = self.closed.cancelled() => return ConnClosedSnafu.fail(),
                rx = self.rx.lock() => rx,
            };
            tokio::select! {
                _ = self.closed.cancelled() => ConnClosedSnafu.fail(),
                msg = rx.recv() => msg.ok_or_else(|| ConnClosedSnafu.build()),
            }
        }
        .boxed()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), RelayError>> {
        async move {
            if self.closed.is_cancelled() {
                return ConnClosedSnafu.fail();
            }
            Ok(())
        }
        .boxed()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn close(&self) {
        self.closed.cancel();
        self.hub.unregister(self.region, self.me, self.conn_id);
    }
}

impl Drop for TestConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use meshsock_base::SecretKey;
    use tracing_test::traced_test;

    use super::*;

    fn region(id: RegionId) -> Arc<RelayRegion> {
        Arc::new(RelayRegion::from_url(
            id,
            "https://relay.example.com".parse().unwrap(),
        ))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_forwarding() {
        let relay = TestRelay::new();
        let a = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let b = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let conn_a = relay.dialer(a).dial(region(1), Transport::Http).await.unwrap();
        let conn_b = relay.dialer(b).dial(region(1), Transport::Http).await.unwrap();

        conn_a.send(b, Bytes::from_static(b"hello")).await.unwrap();
        let pkt = conn_b.recv().await.unwrap();
        assert_eq!(pkt.src, a);
        assert_eq!(&pkt.data[..], b"hello");
    }

    #[tokio::test]
    async fn test_refused_upgrade() {
        let relay = TestRelay::new();
        relay.refuse_http_upgrade(2);
        let a = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let err = relay
            .dialer(a)
            .dial(region(2), Transport::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::UpgradeRefused { .. }));
        let conn = relay
            .dialer(a)
            .dial(region(2), Transport::WebSocket)
            .await
            .unwrap();
        assert_eq!(conn.transport(), Transport::WebSocket);
    }

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let relay = TestRelay::new();
        let a = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let conn = Arc::new(relay.dialer(a).dial(region(1), Transport::Http).await.unwrap());
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.recv().await }
        });
        tokio::task::yield_now().await;
        conn.close();
        let res = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(RelayError::ConnClosed { .. })));
        assert!(relay.connected(1).is_empty());
    }
}
