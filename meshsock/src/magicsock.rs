//! The path manager: sockets, relays and the per-peer path decision.
//!
//! A [`MagicSock`] owns one UDP socket per address family and a pool of relay sessions.
//! Payload handed to [`MagicSock::send`] goes to the best known path of the peer, which
//! starts out as the peer's relay region. In the background the manager finds its own
//! direct addresses, tells its peers about them through call-me-maybe messages sent over
//! the relay, and validates the peers' direct addresses with disco pings. Once a direct
//! path is confirmed, payload stops going through the relay.
//!
//! Everything received on the sockets and relays that is not payload for a known peer is
//! consumed here: STUN replies go to the [`NetReporter`], disco messages update the path
//! state, everything else is dropped and counted in the [`Metrics`].

use std::{
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU16,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
};

use bytes::Bytes;
use data_encoding::HEXLOWER;
use meshsock_base::{DiscoPublicKey, DiscoSecretKey, PublicKey, SecretKey, SharedSecret};
use meshsock_relay::{RegionId, RelayDialer, RelayMap};
use n0_future::time::{Duration, Instant};
use nested_enum_utils::common_fields;
use netwatch::{IpFamily, ip::LocalAddresses};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use self::{
    actor::Actor,
    direct_addrs::{BoundSocket, DirectAddrUpdateState, DiscoveredDirectAddrs},
    node_map::{DiscoOwner, NodeMap, PingAction, PingRole, SendPing},
    relay_actor::{RelayPool, RelayPoolOptions, RelayRecvDatagram, WriteError},
    udp_conn::UdpConn,
};
pub use self::{
    direct_addrs::{DirectAddr, DirectAddrType},
    metrics::Metrics,
    node_map::{
        ConnectionType, ControlMsg, DirectAddrInfo, PeerInfo, PongInfo, RemoteInfo, SendChoice,
        Source,
    },
};
use crate::{
    defaults::{
        DEFAULT_RELAY_QUEUE_LEN, RECV_QUEUE_LEN,
        timeouts::{PING_TIMEOUT, SESSION_ACTIVE_TIMEOUT},
    },
    disco::{self, SendAddr},
    net_report::{NetInfo, NetReporter, Report},
    portmapper::PortMapper,
    stun,
};

mod actor;
mod direct_addrs;
mod endpoint_tracker;
mod metrics;
mod node_map;
mod relay_actor;
mod udp_conn;

/// Called with our new list of direct addresses whenever it changes.
pub type EndpointsFn = Arc<dyn Fn(&[DirectAddr]) + Send + Sync>;
/// Called when the network conditions changed in a way that matters.
pub type NetInfoFn = Arc<dyn Fn(&NetInfo) + Send + Sync>;
/// Called with the region and the reason when a relay region falls back to WebSocket.
pub type ForcedWebsocketFn = Arc<dyn Fn(RegionId, &str) + Send + Sync>;
/// Called when payload arrives from a peer, at most once per
/// [`RECV_ACTIVITY_INTERVAL`](crate::defaults::timeouts::RECV_ACTIVITY_INTERVAL) per peer.
pub type NoteRecvActivityFn = Arc<dyn Fn(PublicKey) + Send + Sync>;
/// Returns how long the tunnel on top of the manager has been idle.
pub type IdleFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// The address a pong to a ping received over a relay reports as the ping's source.
///
/// The port carries the relay region.
const RELAY_MAGIC_IP: Ipv4Addr = Ipv4Addr::new(127, 3, 3, 40);

/// How long [`Handle::close`] waits for the background tasks before aborting them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for creating a [`MagicSock`].
#[derive(derive_more::Debug)]
pub struct Options {
    /// The port to listen on, for both address families.
    ///
    /// Zero picks a random port. If the port is taken a random port is used instead.
    pub port: u16,

    /// Secret key for this node.
    pub secret_key: SecretKey,

    /// The relay regions. Leave empty to not use relays.
    pub relay_map: RelayMap,

    /// Connects to relay servers. Required.
    pub relay_dialer: Option<Arc<dyn RelayDialer>>,

    /// Produces network reports. Required.
    pub net_reporter: Option<Arc<dyn NetReporter>>,

    /// Maps a port on the local router, if set.
    pub port_mapper: Option<Arc<dyn PortMapper>>,

    /// Called when our direct addresses change.
    #[debug("{}", on_endpoints.is_some())]
    pub on_endpoints: Option<EndpointsFn>,

    /// Called when the network info changes.
    #[debug("{}", on_net_info.is_some())]
    pub on_net_info: Option<NetInfoFn>,

    /// Called when a relay region falls back to WebSocket.
    #[debug("{}", on_forced_websocket.is_some())]
    pub on_forced_websocket: Option<ForcedWebsocketFn>,

    /// Called when payload arrives from a peer, rate limited per peer.
    #[debug("{}", on_note_recv_activity.is_some())]
    pub on_note_recv_activity: Option<NoteRecvActivityFn>,

    /// How long the tunnel has been idle, gates the periodic re-STUN.
    #[debug("{}", idle_for.is_some())]
    pub idle_for: Option<IdleFn>,

    /// Keeps re-STUNing periodically even when idle.
    pub force_background_stun: bool,

    /// Idle time after which the periodic re-STUN stops.
    pub session_active_timeout: Duration,

    /// Length of the write queue of each relay session.
    pub relay_queue_len: usize,

    /// Do not bind an IPv6 socket.
    pub disable_ipv6: bool,

    /// The counters of this manager.
    pub metrics: Arc<Metrics>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            port: 0,
            secret_key: SecretKey::generate(&mut rand::rngs::OsRng),
            relay_map: RelayMap::empty(),
            relay_dialer: None,
            net_reporter: None,
            port_mapper: None,
            on_endpoints: None,
            on_net_info: None,
            on_forced_websocket: None,
            on_note_recv_activity: None,
            idle_for: None,
            force_background_stun: false,
            session_active_timeout: SESSION_ACTIVE_TIMEOUT,
            relay_queue_len: DEFAULT_RELAY_QUEUE_LEN,
            disable_ipv6: false,
            metrics: Default::default(),
        }
    }
}

/// Failure to create a [`MagicSock`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum CreateError {
    #[snafu(display("missing required dependency: {name}"))]
    MissingDependency { name: &'static str },
}

/// Failure to send a packet.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("magicsock closed"))]
    Closed {},
    /// The packet was dropped.
    #[snafu(display("relay queue for region {region} is full"))]
    QueueFull { region: RegionId },
    #[snafu(display("network is down"))]
    NetworkDown {},
    #[snafu(display("unknown peer {}", peer.fmt_short()))]
    UnknownPeer { peer: PublicKey },
    #[snafu(display("no route to peer {}", peer.fmt_short()))]
    NoRoute { peer: PublicKey },
    #[snafu(display("socket error"))]
    Io { source: io::Error },
}

/// Failure to receive packets.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum RecvError {
    #[snafu(display("magicsock closed"))]
    Closed {},
}

/// Failure to rebind the sockets.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum RebindError {
    #[snafu(display("magicsock closed"))]
    Closed {},
    /// No IPv4 socket could be bound, the manager keeps running without one.
    #[snafu(display("failed to bind the IPv4 socket"))]
    Bind { source: io::Error },
}

/// Failure of an explicit ping.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum PingError {
    #[snafu(display("magicsock closed"))]
    Closed {},
    #[snafu(display("unknown peer {}", peer.fmt_short()))]
    UnknownPeer { peer: PublicKey },
    /// The peer has no disco key or no path at all.
    #[snafu(display("no path to ping peer {}", peer.fmt_short()))]
    NoPath { peer: PublicKey },
    #[snafu(display("no pong received in time"))]
    Timeout {},
}

/// A snapshot of the state of a [`MagicSock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Our node identity.
    pub node_id: PublicKey,
    /// Our disco key.
    pub disco_key: DiscoPublicKey,
    /// The direct addresses we advertise.
    pub endpoints: Vec<DirectAddr>,
    /// The local addresses of our sockets.
    pub local_addrs: Vec<SocketAddr>,
    /// Our home relay region.
    pub home_region: Option<RegionId>,
    /// Regions with a running relay session.
    pub active_relays: Vec<RegionId>,
    /// The last network info published.
    pub net_info: Option<NetInfo>,
    /// The last network report.
    pub net_report: Option<Report>,
    /// Whether the network is up.
    pub network_up: bool,
    /// Every known peer, sorted by key.
    pub peers: Vec<RemoteInfo>,
}

/// Handle for [`MagicSock`].
///
/// Dereferences to [`MagicSock`], and handles closing.
#[derive(Clone, Debug, derive_more::Deref)]
pub struct Handle {
    #[deref(forward)]
    msock: Arc<MagicSock>,
    // Empty when closed
    actor_tasks: Arc<AsyncMutex<JoinSet<()>>>,
}

/// The path manager.
///
/// This routes packets to peers by their [`PublicKey`], initially over their relay region,
/// while transparently trying to establish and upgrade to a direct UDP path. It keeps
/// looking for better paths as the network of either side changes.
#[derive(derive_more::Debug)]
pub struct MagicSock {
    me: PublicKey,
    #[debug(skip)]
    disco_secret: DiscoSecretKey,
    disco_public: DiscoPublicKey,
    #[debug(skip)]
    disco_secrets: DiscoSecrets,

    pconn4: UdpConn,
    pconn6: UdpConn,
    disable_ipv6: bool,
    /// The port we try to bind, zero for any.
    preferred_port: AtomicU16,
    /// Serializes rebinds.
    rebind_lock: AsyncMutex<()>,

    node_map: NodeMap,
    relay_map: RelayMap,
    relay_pool: RelayPool,
    net_reporter: Arc<dyn NetReporter>,
    port_mapper: Option<Arc<dyn PortMapper>>,

    /// Payload waiting for [`MagicSock::receive_batch`].
    recv_sender: mpsc::Sender<(PublicKey, Bytes)>,
    recv_queue: AsyncMutex<mpsc::Receiver<(PublicKey, Bytes)>>,

    /// Our discovered direct addresses.
    direct_addrs: DiscoveredDirectAddrs,
    /// Tracks the running direct addr update.
    direct_addr_update_state: DirectAddrUpdateState,
    /// Call-me-maybes waiting for fresh direct addresses, by peer.
    pending_call_me_maybes: Mutex<HashMap<PublicKey, RegionId>>,
    /// The last network report, cleared while the network is down.
    net_report: Mutex<Option<Report>>,
    /// The last published network info.
    net_info_last: Mutex<Option<NetInfo>>,
    /// Whether the last network report found working IPv6.
    ipv6_reported: AtomicBool,

    network_up: AtomicBool,
    block_endpoints: AtomicBool,
    /// Close was started.
    closing: AtomicBool,
    /// Close is done.
    closed: AtomicBool,
    cancel_token: CancellationToken,

    #[debug(skip)]
    on_endpoints: Option<EndpointsFn>,
    #[debug(skip)]
    on_net_info: Option<NetInfoFn>,
    #[debug(skip)]
    on_note_recv_activity: Option<NoteRecvActivityFn>,
    #[debug(skip)]
    idle_for: Option<IdleFn>,
    force_background_stun: bool,
    session_active_timeout: Duration,

    metrics: Arc<Metrics>,
}

impl MagicSock {
    /// Creates a magic [`MagicSock`] listening on [`Options::port`].
    pub async fn spawn(opts: Options) -> Result<Handle, CreateError> {
        Handle::new(opts).await
    }

    /// Our node identity.
    pub fn node_id(&self) -> PublicKey {
        self.me
    }

    /// Our disco key, peers need it to talk disco with us.
    pub fn disco_public_key(&self) -> DiscoPublicKey {
        self.disco_public
    }

    /// The counters of this manager.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Whether [`Handle::close`] was called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Whether [`Handle::close`] completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn network_up(&self) -> bool {
        self.network_up.load(Ordering::Relaxed)
    }

    fn block_endpoints(&self) -> bool {
        self.block_endpoints.load(Ordering::Relaxed)
    }

    fn preferred_port(&self) -> u16 {
        self.preferred_port.load(Ordering::Relaxed)
    }

    /// The local addresses of the sockets, IPv4 first.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        [&self.pconn4, &self.pconn6]
            .into_iter()
            .filter_map(|conn| conn.local_addr())
            .collect()
    }

    /// The direct addresses we currently advertise.
    pub fn direct_addrs(&self) -> Vec<DirectAddr> {
        self.direct_addrs.addrs()
    }

    /// Our home relay region.
    pub fn home_region(&self) -> Option<RegionId> {
        self.relay_pool.home()
    }

    fn bound_sockets(&self) -> Vec<BoundSocket> {
        let port = self.preferred_port();
        [&self.pconn4, &self.pconn6]
            .into_iter()
            .filter_map(|conn| {
                let local = conn.local_addr()?;
                Some(BoundSocket {
                    bound: SocketAddr::new(conn.family().unspecified_addr(), port),
                    local,
                })
            })
            .collect()
    }

    /// Sends `data` to `peer` over its best path.
    ///
    /// This never blocks on a relay: when the relay queue is full the packet is dropped and
    /// [`SendError::QueueFull`] returned. Direct sends are best effort.
    pub async fn send(&self, peer: PublicKey, data: Bytes) -> Result<(), SendError> {
        if self.is_closing() {
            return ClosedSnafu.fail();
        }
        if !self.network_up() {
            self.metrics.send_data_network_down.inc();
            return NetworkDownSnafu.fail();
        }
        self.metrics.send_data.inc();

        let have_ipv6 = self.ipv6_reported.load(Ordering::Relaxed);
        let (choice, ping_actions) = self
            .node_map
            .get_send_addrs(&peer, Instant::now(), have_ipv6, &self.metrics)
            .context(UnknownPeerSnafu { peer })?;
        self.send_ping_actions(ping_actions).await;

        let mut sent = false;
        let mut udp_error = None;
        if let Some(addr) = choice.udp_addr {
            match self.send_udp(addr, &data).await {
                Ok(true) => sent = true,
                Ok(false) => {}
                Err(err) => {
                    debug!(%addr, node = %peer.fmt_short(), "failed to send udp: {err:#}");
                    udp_error = Some(err);
                }
            }
        }
        if let Some(region) = choice.relay {
            match self.relay_pool.write_to(region, peer, data) {
                Ok(()) => sent = true,
                Err(WriteError::QueueFull { region }) => {
                    if !sent {
                        return QueueFullSnafu { region }.fail();
                    }
                }
                Err(WriteError::PoolClosed {}) => return ClosedSnafu.fail(),
                Err(err @ WriteError::UnknownRegion { .. }) => {
                    debug!(node = %peer.fmt_short(), "failed to send over relay: {err:#}");
                }
            }
        }

        if sent {
            return Ok(());
        }
        match udp_error {
            Some(err) => Err(err).context(IoSnafu),
            None => NoRouteSnafu { peer }.fail(),
        }
    }

    /// Waits for payload and returns up to `max` packets with the peer each came from.
    ///
    /// Returns [`RecvError::Closed`] once the manager is closed, also when it is closed
    /// while waiting.
    pub async fn receive_batch(&self, max: usize) -> Result<Vec<(PublicKey, Bytes)>, RecvError> {
        if self.is_closing() {
            return recv_error::ClosedSnafu.fail();
        }
        let mut queue = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return recv_error::ClosedSnafu.fail(),
            queue = self.recv_queue.lock() => queue,
        };
        let first = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return recv_error::ClosedSnafu.fail(),
            item = queue.recv() => item.context(recv_error::ClosedSnafu)?,
        };
        let mut batch = vec![first];
        while batch.len() < max {
            match queue.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// Closes and re-binds the UDP sockets, keeping all path state.
    ///
    /// Every peer has to validate its direct path again afterwards. If no IPv4 socket can
    /// be bound, the manager keeps running without it and an error is returned; a later
    /// rebind may recover.
    pub async fn rebind(&self) -> Result<(), RebindError> {
        if self.is_closing() {
            return rebind_error::ClosedSnafu.fail();
        }
        let _guard = self.rebind_lock.lock().await;
        self.metrics.rebinds.inc();
        let port = self.preferred_port();
        debug!(port, "rebinding sockets");

        let res = self.pconn4.rebind(port).await;
        if !self.disable_ipv6 {
            if let Err(err) = self.pconn6.rebind(port).await {
                info!("rebind ignoring IPv6 bind failure: {err:#}");
            }
        }
        if let Some(port_mapper) = &self.port_mapper {
            let port = self.pconn4.local_addr().and_then(|a| NonZeroU16::new(a.port()));
            port_mapper.update_local_port(port);
        }

        self.node_map.note_connectivity_change();
        match tokio::task::spawn_blocking(LocalAddresses::new).await {
            Ok(local) => {
                let ips: Vec<IpAddr> = local.regular.into_iter().chain(local.loopback).collect();
                self.relay_pool.check_connections(ips);
            }
            Err(err) => warn!("failed to list local addresses: {err:#}"),
        }
        self.re_stun("rebind");

        match res {
            Ok(addr) => {
                info!(%addr, "rebound");
                Ok(())
            }
            Err(err) => Err(err).context(rebind_error::BindSnafu),
        }
    }

    /// Triggers an update of our direct addresses.
    ///
    /// If an update is running already, another one runs once it is done.
    pub fn re_stun(&self, why: &'static str) {
        debug!("re_stun: {}", why);
        self.metrics.re_stun_calls.inc();
        self.direct_addr_update_state.schedule_run(why);
    }

    /// Replaces the set of peers.
    ///
    /// Path state of peers no longer in the set is dropped.
    pub fn set_peer_set(&self, peers: Vec<PeerInfo>) {
        debug!(peers = peers.len(), "setting peer set");
        self.node_map.set_peers(peers, Instant::now(), &self.metrics);
        self.disco_secrets.retain(&self.node_map.disco_keys());
    }

    /// Replaces the relay regions.
    pub fn set_relay_map(&self, relay_map: RelayMap) {
        self.relay_map.replace(&relay_map);
        self.re_stun("relay-map-changed");
    }

    /// Tells the manager whether the network is up.
    ///
    /// While down, sends fail with [`SendError::NetworkDown`] and no relay sessions are
    /// kept.
    pub fn set_network_up(&self, up: bool) {
        if self.network_up.swap(up, Ordering::SeqCst) == up {
            return;
        }
        info!(up, "network state changed");
        if up {
            self.relay_pool.set_home(self.relay_pool.home());
            self.re_stun("network-up");
        } else {
            if let Some(port_mapper) = &self.port_mapper {
                port_mapper.deactivate();
            }
            self.relay_pool.close_all();
            *self.net_report.lock().expect("poisoned") = None;
        }
    }

    /// Sets the port to listen on, rebinding if it changed.
    pub async fn set_preferred_port(&self, port: u16) {
        if self.preferred_port.swap(port, Ordering::SeqCst) == port {
            return;
        }
        info!(port, "preferred port changed");
        if let Err(err) = self.rebind().await {
            warn!("rebind for new port failed: {err:#}");
        }
    }

    /// Stops advertising our direct addresses and ignores direct disco while set.
    pub fn set_block_endpoints(&self, block: bool) {
        if self.block_endpoints.swap(block, Ordering::SeqCst) == block {
            return;
        }
        info!(block, "block endpoints changed");
        self.re_stun("block-endpoints-changed");
    }

    /// Time since payload was last received from `peer`.
    ///
    /// `None` if nothing was received yet or the peer is unknown.
    pub fn last_recv_activity(&self, peer: &PublicKey) -> Option<Duration> {
        self.node_map.last_recv_activity(peer, Instant::now())
    }

    /// Where a packet for `peer` would go right now.
    ///
    /// Sends no pings. Timed out pings are expired and the best address may be
    /// re-selected, just as before a real send.
    pub fn choose_send_addr(&self, peer: &PublicKey) -> Option<SendChoice> {
        let have_ipv6 = self.ipv6_reported.load(Ordering::Relaxed);
        self.node_map
            .choose_send_addr(peer, Instant::now(), have_ipv6)
    }

    /// Pings every path of `peer` and waits for the first pong.
    pub async fn ping(&self, peer: PublicKey) -> Result<PongInfo, PingError> {
        if self.is_closing() {
            return ping_error::ClosedSnafu.fail();
        }
        let pings = self
            .node_map
            .ping_all(&peer)
            .context(ping_error::UnknownPeerSnafu { peer })?;
        if pings.is_empty() {
            return ping_error::NoPathSnafu { peer }.fail();
        }
        let (tx, mut rx) = mpsc::channel(pings.len());
        for ping in pings {
            self.send_ping(ping, Some(tx.clone())).await;
        }
        drop(tx);

        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => ping_error::ClosedSnafu.fail(),
            res = time::timeout(PING_TIMEOUT, rx.recv()) => match res {
                Ok(Some(info)) => Ok(info),
                Ok(None) | Err(_) => ping_error::TimeoutSnafu.fail(),
            },
        }
    }

    /// A snapshot of our state.
    pub fn status(&self) -> Status {
        Status {
            node_id: self.me,
            disco_key: self.disco_public,
            endpoints: self.direct_addrs.addrs(),
            local_addrs: self.local_addrs(),
            home_region: self.relay_pool.home(),
            active_relays: self.relay_pool.active_regions(),
            net_info: self.net_info_last.lock().expect("poisoned").clone(),
            net_report: self.net_report.lock().expect("poisoned").clone(),
            network_up: self.network_up(),
            peers: self.node_map.remote_infos(Instant::now()),
        }
    }

    fn set_home(&self, home: Option<RegionId>) {
        let current = self.relay_pool.home();
        if current == home {
            return;
        }
        info!(?current, new = ?home, "home relay region changed");
        self.metrics.relay_home_change.inc();
        self.relay_pool.set_home(home);
    }

    async fn udp_recv_loop(self: Arc<Self>, family: IpFamily) {
        let conn = match family {
            IpFamily::V4 => &self.pconn4,
            IpFamily::V6 => &self.pconn6,
        };
        let mut buf = vec![0u8; u16::MAX as usize];
        while let Some(res) = conn.recv_from(&mut buf).await {
            match res {
                Ok((n, src)) => self.process_udp_datagram(&buf[..n], src).await,
                Err(err) => {
                    debug!("recv failed: {err:#}");
                    time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        debug!("socket closed");
    }

    async fn process_udp_datagram(&self, buf: &[u8], src: SocketAddr) {
        if stun::is(buf) {
            trace!(%src, "received STUN packet");
            self.metrics.recv_stun.inc();
            self.net_reporter.receive_stun_packet(buf, src);
            return;
        }
        if let Some((sender, sealed_box)) = disco::source_and_box(buf) {
            self.handle_disco_message(sender, sealed_box, SendAddr::Udp(src), None)
                .await;
            return;
        }
        match self.node_map.receive_udp(src, Instant::now()) {
            Some((node, note_activity)) => {
                if src.is_ipv4() {
                    self.metrics.recv_data_ipv4.inc();
                } else {
                    self.metrics.recv_data_ipv6.inc();
                }
                if note_activity {
                    self.note_recv_activity(node);
                }
                self.deliver(node, Bytes::copy_from_slice(buf));
            }
            None => {
                trace!(%src, "dropping payload from unknown source");
                self.metrics.recv_data_unknown_src.inc();
            }
        }
    }

    async fn relay_recv_loop(self: Arc<Self>, mut datagrams: mpsc::Receiver<RelayRecvDatagram>) {
        loop {
            let datagram = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                datagram = datagrams.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            self.process_relay_datagram(datagram).await;
        }
        debug!("relay receiver stopped");
    }

    async fn process_relay_datagram(&self, datagram: RelayRecvDatagram) {
        let RelayRecvDatagram { region, src, data } = datagram;
        if let Some((sender, sealed_box)) = disco::source_and_box(&data) {
            self.handle_disco_message(sender, sealed_box, SendAddr::Relay(region), Some(src))
                .await;
            return;
        }
        match self.node_map.receive_relay(region, &src, Instant::now()) {
            Some(note_activity) => {
                self.metrics.recv_data_relay.inc();
                if note_activity {
                    self.note_recv_activity(src);
                }
                self.deliver(src, data);
            }
            None => {
                trace!(%region, src = %src.fmt_short(), "dropping relay payload from unknown node");
                self.metrics.recv_data_unknown_src.inc();
            }
        }
    }

    fn note_recv_activity(&self, node: PublicKey) {
        if let Some(cb) = &self.on_note_recv_activity {
            cb(node);
        }
    }

    fn deliver(&self, node: PublicKey, data: Bytes) {
        if self.recv_sender.try_send((node, data)).is_err() {
            trace!(node = %node.fmt_short(), "receive queue full, dropping packet");
            self.metrics.recv_data_dropped.inc();
        }
    }

    /// Handles a disco message, `relay_src` is the sending node for messages from a relay.
    async fn handle_disco_message(
        &self,
        sender: DiscoPublicKey,
        sealed_box: &[u8],
        src: SendAddr,
        relay_src: Option<PublicKey>,
    ) {
        trace!(sender = %sender.fmt_short(), %src, "handle disco message");
        if self.is_closing() {
            return;
        }
        if !src.is_relay() && self.block_endpoints() {
            trace!(%src, "ignoring direct disco message, endpoints are blocked");
            return;
        }
        let udp_src = udp_addr(src);
        if self.node_map.disco_owner(&sender, relay_src.as_ref(), udp_src) == DiscoOwner::Unknown {
            debug!(sender = %sender.fmt_short(), %src, "disco: ignoring message from unknown disco key");
            self.metrics.recv_disco_unknown_sender.inc();
            return;
        }

        let msg = match self
            .disco_secrets
            .unseal_and_decode(&self.disco_secret, &sender, sealed_box)
        {
            Ok(msg) => msg,
            Err(disco::ParseError::Decryption { .. }) => {
                debug!(sender = %sender.fmt_short(), %src, "disco: failed to open box, wrong key?");
                self.metrics.recv_disco_bad_key.inc();
                return;
            }
            Err(err) => {
                debug!(sender = %sender.fmt_short(), %src, "disco: failed to parse message: {err:#}");
                self.metrics.recv_disco_bad_parse.inc();
                return;
            }
        };

        if src.is_relay() {
            self.metrics.recv_disco_relay.inc();
        } else {
            self.metrics.recv_disco_udp.inc();
        }
        trace!(%msg, %src, "disco: received");

        match msg {
            disco::Message::Ping(ping) => {
                self.metrics.recv_disco_ping.inc();
                self.handle_ping(ping, sender, src, relay_src).await;
            }
            disco::Message::Pong(pong) => {
                self.metrics.recv_disco_pong.inc();
                self.handle_pong(pong, sender, src, relay_src);
            }
            disco::Message::CallMeMaybe(cm) => {
                self.metrics.recv_disco_call_me_maybe.inc();
                self.handle_call_me_maybe(cm, sender, src, relay_src).await;
            }
        }
    }

    async fn handle_ping(
        &self,
        ping: disco::Ping,
        sender: DiscoPublicKey,
        src: SendAddr,
        relay_src: Option<PublicKey>,
    ) {
        let tx = HEXLOWER.encode(&ping.tx_id);
        let pong = disco::Message::Pong(disco::Pong {
            tx_id: ping.tx_id,
            src: ping_observed_addr(src),
        });
        let hint = relay_src.or(ping.node_key);

        let node = match self.node_map.disco_owner(&sender, hint.as_ref(), udp_addr(src)) {
            DiscoOwner::Unique(node) => node,
            DiscoOwner::Ambiguous => {
                debug!(%tx, %src, sender = %sender.fmt_short(), "disco key shared by several nodes, only sending pong");
                match (src, relay_src) {
                    (SendAddr::Udp(addr), _) => {
                        self.send_disco_udp(addr, &sender, &pong).await;
                    }
                    (SendAddr::Relay(region), Some(node)) => {
                        self.send_disco_relay(region, node, &sender, &pong);
                    }
                    (SendAddr::Relay(_), None) => {}
                }
                return;
            }
            DiscoOwner::Unknown => {
                self.metrics.recv_disco_unknown_sender.inc();
                return;
            }
        };

        let Some(handled) = self
            .node_map
            .handle_ping(&node, src, ping.tx_id, Instant::now())
        else {
            return;
        };
        match handled.role {
            PingRole::Duplicate => {
                debug!(%src, %tx, "received ping: path already confirmed, skip");
                return;
            }
            PingRole::LikelyHeartbeat => trace!(%src, %tx, "received ping: heartbeat"),
            PingRole::NewPath => debug!(%src, %tx, "received ping: new path"),
            PingRole::Activate => debug!(%src, %tx, "received ping: path active"),
        }

        trace!(%tx, %src, dst = %node.fmt_short(), "sending pong");
        if !self.send_disco_message(src, node, &sender, &pong).await {
            debug!(%src, "failed to send pong");
        }

        if let Some(ping) = handled.needs_ping_back {
            debug!(%src, dst = %node.fmt_short(), "sending direct ping back");
            self.send_ping(ping, None).await;
        }
    }

    fn handle_pong(
        &self,
        pong: disco::Pong,
        sender: DiscoPublicKey,
        src: SendAddr,
        relay_src: Option<PublicKey>,
    ) {
        match self
            .node_map
            .disco_owner(&sender, relay_src.as_ref(), udp_addr(src))
        {
            DiscoOwner::Unique(node) => {
                if self
                    .node_map
                    .handle_pong(&node, &pong, src, Instant::now())
                    .is_none()
                {
                    self.metrics.recv_disco_pong_stale.inc();
                }
            }
            DiscoOwner::Ambiguous | DiscoOwner::Unknown => {
                debug!(%src, sender = %sender.fmt_short(), "pong from a disco key without a single owner");
                self.metrics.recv_disco_unknown_sender.inc();
            }
        }
    }

    async fn handle_call_me_maybe(
        &self,
        cm: disco::CallMeMaybe,
        sender: DiscoPublicKey,
        src: SendAddr,
        relay_src: Option<PublicKey>,
    ) {
        let (SendAddr::Relay(_), Some(node)) = (src, relay_src) else {
            debug!(%src, "call-me-maybe over a direct path, ignoring");
            self.metrics.recv_disco_call_me_maybe_direct.inc();
            return;
        };
        if self.block_endpoints() {
            trace!("ignoring call-me-maybe, endpoints are blocked");
            return;
        }
        if !self.node_map.has_disco_key(&node, &sender) {
            debug!(node = %node.fmt_short(), sender = %sender.fmt_short(), "call-me-maybe with a disco key not matching the node");
            self.metrics.recv_disco_call_me_maybe_bad_disco.inc();
            return;
        }
        debug!(node = %node.fmt_short(), %cm, "received call-me-maybe");
        let actions = self
            .node_map
            .handle_call_me_maybe(&node, cm, Instant::now());
        self.send_ping_actions(actions).await;
    }

    async fn send_ping_actions(&self, actions: Vec<PingAction>) {
        for action in actions {
            match action {
                PingAction::SendCallMeMaybe { region, dst_node } => {
                    self.send_or_queue_call_me_maybe(region, dst_node);
                }
                PingAction::SendPing(ping) => {
                    self.send_ping(ping, None).await;
                }
            }
        }
    }

    /// Sends a disco ping, `resolver` is notified with the pong.
    async fn send_ping(&self, ping: SendPing, resolver: Option<mpsc::Sender<PongInfo>>) -> bool {
        let SendPing {
            dst,
            dst_node,
            tx_id,
            purpose,
        } = ping;
        let Some(dst_disco) = self.node_map.disco_key(&dst_node) else {
            return false;
        };
        // the pong may race the send on loopback
        self.node_map
            .notify_ping_sent(&dst_node, dst, tx_id, purpose, resolver, Instant::now());
        let msg = disco::Message::Ping(disco::Ping {
            tx_id,
            node_key: Some(self.me),
        });
        self.send_disco_message(dst, dst_node, &dst_disco, &msg)
            .await
    }

    /// Sends a call-me-maybe with our direct addresses, or queues it if they are stale.
    fn send_or_queue_call_me_maybe(&self, region: RegionId, dst_node: PublicKey) {
        match self.direct_addrs.fresh_enough(Instant::now()) {
            Ok(()) => {
                let Some(dst_disco) = self.node_map.disco_key(&dst_node) else {
                    return;
                };
                let msg = disco::Message::CallMeMaybe(disco::CallMeMaybe {
                    my_numbers: self.direct_addrs.sockaddrs(),
                });
                if !self.send_disco_relay(region, dst_node, &dst_disco, &msg) {
                    debug!(dst = %dst_node.fmt_short(), "call-me-maybe not sent");
                }
            }
            Err(last_refresh_ago) => {
                debug!(
                    ?last_refresh_ago,
                    dst = %dst_node.fmt_short(),
                    "want call-me-maybe but direct addrs stale; queuing",
                );
                self.pending_call_me_maybes
                    .lock()
                    .expect("poisoned")
                    .insert(dst_node, region);
                self.re_stun("refresh-for-peering");
            }
        }
    }

    /// Sends the call-me-maybes queued while our direct addresses were stale.
    fn send_queued_call_me_maybes(&self) {
        let pending = std::mem::take(&mut *self.pending_call_me_maybes.lock().expect("poisoned"));
        for (dst_node, region) in pending {
            self.send_or_queue_call_me_maybe(region, dst_node);
        }
    }

    async fn send_disco_message(
        &self,
        dst: SendAddr,
        dst_node: PublicKey,
        dst_disco: &DiscoPublicKey,
        msg: &disco::Message,
    ) -> bool {
        match dst {
            SendAddr::Udp(addr) => self.send_disco_udp(addr, dst_disco, msg).await,
            SendAddr::Relay(region) => self.send_disco_relay(region, dst_node, dst_disco, msg),
        }
    }

    async fn send_disco_udp(&self, dst: SocketAddr, dst_disco: &DiscoPublicKey, msg: &disco::Message) -> bool {
        if self.is_closing() || !self.network_up() {
            return false;
        }
        let pkt = self
            .disco_secrets
            .encode_and_seal(&self.disco_secret, &self.disco_public, dst_disco, msg);
        match self.send_udp(dst, &pkt).await {
            Ok(true) => {
                trace!(%dst, %msg, "sent disco message");
                self.metrics.send_disco_udp.inc();
                disco_message_sent(msg, &self.metrics);
                true
            }
            Ok(false) => {
                trace!(%dst, %msg, "disco message not sent, no socket for the address family");
                false
            }
            Err(err) => {
                debug!(%dst, %msg, "failed to send disco message: {err:#}");
                false
            }
        }
    }

    fn send_disco_relay(
        &self,
        region: RegionId,
        dst_node: PublicKey,
        dst_disco: &DiscoPublicKey,
        msg: &disco::Message,
    ) -> bool {
        if self.is_closing() || !self.network_up() {
            return false;
        }
        let pkt = self
            .disco_secrets
            .encode_and_seal(&self.disco_secret, &self.disco_public, dst_disco, msg);
        match self.relay_pool.write_to(region, dst_node, pkt) {
            Ok(()) => {
                trace!(%region, dst = %dst_node.fmt_short(), %msg, "sent disco message");
                self.metrics.send_disco_relay.inc();
                disco_message_sent(msg, &self.metrics);
                true
            }
            Err(err) => {
                debug!(%region, dst = %dst_node.fmt_short(), %msg, "failed to send disco message: {err:#}");
                false
            }
        }
    }

    /// Sends on the socket of `dst`'s family. `Ok(false)` if there is none.
    async fn send_udp(&self, dst: SocketAddr, buf: &[u8]) -> io::Result<bool> {
        let conn = match dst {
            SocketAddr::V4(_) => &self.pconn4,
            SocketAddr::V6(_) => &self.pconn6,
        };
        let sent = conn.send_to(buf, dst).await?;
        if !sent {
            self.metrics.send_unsupported_family.inc();
        } else if dst.is_ipv4() {
            self.metrics.send_ipv4.inc();
        } else {
            self.metrics.send_ipv6.inc();
        }
        Ok(sent)
    }
}

fn udp_addr(addr: SendAddr) -> Option<SocketAddr> {
    match addr {
        SendAddr::Udp(addr) => Some(addr),
        SendAddr::Relay(_) => None,
    }
}

fn ping_observed_addr(src: SendAddr) -> SocketAddr {
    match src {
        SendAddr::Udp(addr) => addr,
        SendAddr::Relay(region) => SocketAddr::new(RELAY_MAGIC_IP.into(), region),
    }
}

fn disco_message_sent(msg: &disco::Message, metrics: &Metrics) {
    match msg {
        disco::Message::Ping(_) => {
            metrics.sent_disco_ping.inc();
        }
        disco::Message::Pong(_) => {
            metrics.sent_disco_pong.inc();
        }
        disco::Message::CallMeMaybe(_) => {
            metrics.sent_disco_call_me_maybe.inc();
        }
    }
}

impl Handle {
    /// Creates a magic [`MagicSock`] listening on [`Options::port`].
    async fn new(opts: Options) -> Result<Self, CreateError> {
        let Options {
            port,
            secret_key,
            relay_map,
            relay_dialer,
            net_reporter,
            port_mapper,
            on_endpoints,
            on_net_info,
            on_forced_websocket,
            on_note_recv_activity,
            idle_for,
            force_background_stun,
            session_active_timeout,
            relay_queue_len,
            disable_ipv6,
            metrics,
        } = opts;

        let relay_dialer = relay_dialer.context(MissingDependencySnafu {
            name: "relay_dialer",
        })?;
        let net_reporter = net_reporter.context(MissingDependencySnafu {
            name: "net_reporter",
        })?;

        let pconn4 = match UdpConn::bind(IpFamily::V4, port) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("no IPv4 socket could be bound, running blocked: {err:#}");
                UdpConn::blocked(IpFamily::V4)
            }
        };
        let pconn6 = if disable_ipv6 {
            UdpConn::blocked(IpFamily::V6)
        } else {
            match UdpConn::bind(IpFamily::V6, port) {
                Ok(conn) => conn,
                Err(err) => {
                    info!("bind ignoring IPv6 bind failure: {err:#}");
                    UdpConn::blocked(IpFamily::V6)
                }
            }
        };
        if let Some(port_mapper) = &port_mapper {
            match pconn4.local_addr().and_then(|a| NonZeroU16::new(a.port())) {
                Some(port) => port_mapper.update_local_port(Some(port)),
                None => debug!("Skipping port mapping with zero local port"),
            }
        }

        let me = secret_key.public();
        let disco_secret = DiscoSecretKey::generate();
        let disco_public = disco_secret.public();
        let (relay_recv_sender, relay_recv_receiver) = mpsc::channel(RECV_QUEUE_LEN);
        let relay_pool = RelayPool::new(RelayPoolOptions {
            relay_map: relay_map.clone(),
            dialer: relay_dialer,
            queue_len: relay_queue_len,
            relay_datagrams_recv: relay_recv_sender,
            on_forced_websocket,
            metrics: metrics.clone(),
        });
        let (recv_sender, recv_receiver) = mpsc::channel(RECV_QUEUE_LEN);

        let msock = Arc::new(MagicSock {
            me,
            disco_secret,
            disco_public,
            disco_secrets: DiscoSecrets::default(),
            pconn4,
            pconn6,
            disable_ipv6,
            preferred_port: AtomicU16::new(port),
            rebind_lock: AsyncMutex::new(()),
            node_map: NodeMap::default(),
            relay_map,
            relay_pool,
            net_reporter,
            port_mapper,
            recv_sender,
            recv_queue: AsyncMutex::new(recv_receiver),
            direct_addrs: DiscoveredDirectAddrs::default(),
            direct_addr_update_state: DirectAddrUpdateState::new(),
            pending_call_me_maybes: Default::default(),
            net_report: Default::default(),
            net_info_last: Default::default(),
            ipv6_reported: AtomicBool::new(false),
            network_up: AtomicBool::new(true),
            block_endpoints: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            on_endpoints,
            on_net_info,
            on_note_recv_activity,
            idle_for,
            force_background_stun,
            session_active_timeout,
            metrics,
        });
        info!(me = %me.fmt_short(), local_addrs = ?msock.local_addrs(), "magicsock created");

        let mut actor_tasks = JoinSet::default();
        let actor = Actor::new(msock.clone());
        actor_tasks.spawn(
            actor
                .run()
                .instrument(info_span!("magicsock.actor", me = %me.fmt_short())),
        );
        for family in [IpFamily::V4, IpFamily::V6] {
            actor_tasks.spawn(
                msock
                    .clone()
                    .udp_recv_loop(family)
                    .instrument(info_span!("udp-recv", family = ?family)),
            );
        }
        actor_tasks.spawn(
            msock
                .clone()
                .relay_recv_loop(relay_recv_receiver)
                .instrument(info_span!("relay-recv")),
        );

        msock.re_stun("initial");

        Ok(Handle {
            msock,
            actor_tasks: Arc::new(AsyncMutex::new(actor_tasks)),
        })
    }

    /// Closes the connection.
    ///
    /// Only the first close does anything. Any later closes return once the first is done.
    /// Blocked [`MagicSock::receive_batch`] calls return [`RecvError::Closed`], all
    /// background tasks are awaited.
    pub async fn close(&self) {
        trace!("magicsock closing...");
        if !self.msock.closing.swap(true, Ordering::SeqCst) {
            self.msock.cancel_token.cancel();
            self.msock.pconn4.close().await;
            self.msock.pconn6.close().await;
            self.msock.relay_pool.shutdown().await;
        }

        let mut tasks = self.actor_tasks.lock().await;
        // give the tasks a moment to shutdown cleanly
        let tasks_ref = &mut *tasks;
        let shutdown_done = time::timeout(SHUTDOWN_TIMEOUT, async move {
            while let Some(task) = tasks_ref.join_next().await {
                if let Err(err) = task {
                    warn!("unexpected error in task shutdown: {:?}", err);
                }
            }
        })
        .await;
        match shutdown_done {
            Ok(_) => trace!("tasks finished in time, shutdown complete"),
            Err(_elapsed) => {
                warn!("tasks didn't finish in time, aborting");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }
        self.msock.closed.store(true, Ordering::SeqCst);
        trace!("magicsock closed");
    }
}

/// Caches the shared secrets of disco keys.
#[derive(Debug, Default)]
struct DiscoSecrets(Mutex<HashMap<DiscoPublicKey, SharedSecret>>);

impl DiscoSecrets {
    fn get<F, T>(&self, secret: &DiscoSecretKey, other: &DiscoPublicKey, cb: F) -> T
    where
        F: FnOnce(&SharedSecret) -> T,
    {
        let mut inner = self.0.lock().expect("poisoned");
        let shared = inner
            .entry(*other)
            .or_insert_with(|| secret.shared(other));
        cb(shared)
    }

    /// Drops the secrets of disco keys not in `keep`.
    fn retain(&self, keep: &HashSet<DiscoPublicKey>) {
        self.0
            .lock()
            .expect("poisoned")
            .retain(|key, _| keep.contains(key));
    }

    fn encode_and_seal(
        &self,
        secret: &DiscoSecretKey,
        sender: &DiscoPublicKey,
        other: &DiscoPublicKey,
        msg: &disco::Message,
    ) -> Bytes {
        self.get(secret, other, |shared| disco::encode_message(sender, shared, msg))
            .into()
    }

    fn unseal_and_decode(
        &self,
        secret: &DiscoSecretKey,
        other: &DiscoPublicKey,
        sealed_box: &[u8],
    ) -> Result<disco::Message, disco::ParseError> {
        self.get(secret, other, |shared| disco::open_message(shared, sealed_box))
    }
}
