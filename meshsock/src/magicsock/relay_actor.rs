//! The relay session pool.
//!
//! The [`RelayPool`] owns one [`ActiveRelayActor`] per relay region in use. Sessions are
//! started lazily by the first write to a region, and exit on their own after
//! [`RELAY_INACTIVE_CLEANUP_TIME`] without traffic unless they serve the home region.
//!
//! Writes never wait: every session has a bounded queue, and a full queue drops the
//! packet.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    pin::Pin,
    sync::{Arc, Mutex},
};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use meshsock_base::PublicKey;
use meshsock_relay::{
    ConnectError, RegionId, RelayConn, RelayDialer, RelayError, RelayMap, RelayRegion, Transport,
    client::TimeoutSnafu as ConnectTimeoutSnafu,
    defaults::timeouts::{CONNECT_TIMEOUT, PING_TIMEOUT},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::{ForcedWebsocketFn, Metrics};
use crate::defaults::timeouts::{RELAY_INACTIVE_CLEANUP_TIME, UNDELIVERABLE_DATAGRAM_TIMEOUT};

/// How many queued datagrams a connected session sends before looking at its inbox again.
const SEND_DATAGRAM_BATCH_SIZE: usize = 20;

/// How long sessions get to stop on their own before they are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// A datagram received from a relay.
#[derive(Debug, Clone)]
pub(super) struct RelayRecvDatagram {
    pub(super) region: RegionId,
    pub(super) src: PublicKey,
    pub(super) data: Bytes,
}

#[derive(Debug)]
struct RelaySendItem {
    dst: PublicKey,
    data: Bytes,
}

/// Failure to hand a packet to a relay session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub(super) enum WriteError {
    #[snafu(display("relay queue for region {region} is full"))]
    QueueFull { region: RegionId },
    #[snafu(display("unknown relay region {region}"))]
    UnknownRegion { region: RegionId },
    #[snafu(display("relay pool closed"))]
    PoolClosed {},
}

#[derive(Debug)]
enum ActiveRelayMessage {
    /// Sets this region as the home region, or not.
    SetHomeRelay(bool),
    /// Checks the connection is still usable after the local addresses changed.
    ///
    /// A connection from a local IP not in the list is dropped and re-established, all
    /// others are pinged.
    CheckConnection(Vec<IpAddr>),
    #[cfg(test)]
    GetTransport(tokio::sync::oneshot::Sender<Option<Transport>>),
}

/// State shared between the pool and its sessions.
#[derive(Debug, Default)]
struct Shared {
    /// The region each peer was last heard from.
    routes: Mutex<BTreeMap<PublicKey, RegionId>>,
    /// Regions which refused the HTTP upgrade and are dialed over WebSocket.
    websocket: Mutex<BTreeSet<RegionId>>,
}

impl Shared {
    fn note_route(&self, peer: PublicKey, region: RegionId) {
        self.routes.lock().expect("poisoned").insert(peer, region);
    }

    fn forget_region(&self, region: RegionId) {
        self.routes
            .lock()
            .expect("poisoned")
            .retain(|_, r| *r != region);
    }

    fn transport_for(&self, region: &RelayRegion) -> Transport {
        if self
            .websocket
            .lock()
            .expect("poisoned")
            .contains(&region.region_id)
        {
            Transport::WebSocket
        } else {
            region.preferred_transport
        }
    }
}

#[derive(Debug, Snafu)]
enum RunError {
    #[snafu(display("sending to relay failed"))]
    Send { source: RelayError },
    #[snafu(display("receiving from relay failed"))]
    Recv { source: RelayError },
    #[snafu(display("send timeout"))]
    SendTimeout {},
    #[snafu(display("relay ping failed"))]
    Ping {},
    #[snafu(display("local IP no longer valid"))]
    LocalIpInvalid {},
    #[snafu(display("no local address, reconnecting"))]
    LocalAddrMissing {},
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
enum SessionError {
    #[snafu(display("dialing relay failed"))]
    Dial { source: ConnectError },
    #[snafu(display("relay connection lost"))]
    Connection { source: RunError },
}

/// Handles the connection to a single relay region.
///
/// Keeps dialing until connected, with exponential backoff. If the HTTP upgrade is refused
/// the region is dialed over WebSocket from then on.
#[derive(derive_more::Debug)]
struct ActiveRelayActor {
    region: Arc<RelayRegion>,
    transport: Transport,
    dialer: Arc<dyn RelayDialer>,
    inbox: mpsc::Receiver<ActiveRelayMessage>,
    relay_datagrams_send: mpsc::Receiver<RelaySendItem>,
    relay_datagrams_recv: mpsc::Sender<RelayRecvDatagram>,
    is_home_relay: bool,
    inactive_timeout: Pin<Box<time::Sleep>>,
    last_packet_src: Option<PublicKey>,
    stop_token: CancellationToken,
    shared: Arc<Shared>,
    #[debug(skip)]
    on_forced_websocket: Option<ForcedWebsocketFn>,
    metrics: Arc<Metrics>,
}

impl ActiveRelayActor {
    async fn run(mut self) {
        let mut backoff = Self::build_backoff();

        while let Err(err) = self.run_once().await {
            match err {
                SessionError::Dial {
                    source: ConnectError::UpgradeRefused { ref reason, .. },
                    ..
                } if self.transport == Transport::Http => {
                    self.force_websocket(reason);
                }
                SessionError::Dial { .. } => {
                    warn!("{err:#}");
                    let Some(delay) = backoff.next() else {
                        warn!("retries exceeded");
                        break;
                    };
                    debug!("retry in {delay:?}");
                    tokio::select! {
                        _ = self.stop_token.cancelled() => break,
                        _ = time::sleep(delay) => {}
                    }
                }
                SessionError::Connection { .. } => {
                    debug!("connection to relay lost: {err:#}");
                    backoff = Self::build_backoff();
                }
            }
        }
        self.shared.forget_region(self.region.region_id);
        debug!("exiting");
    }

    fn build_backoff() -> impl Backoff {
        ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(16))
            .with_jitter()
            .without_max_times()
            .build()
    }

    fn force_websocket(&mut self, reason: &str) {
        let region = self.region.region_id;
        info!(%region, %reason, "HTTP upgrade refused, falling back to WebSocket");
        self.transport = Transport::WebSocket;
        self.shared
            .websocket
            .lock()
            .expect("poisoned")
            .insert(region);
        self.metrics.relay_websocket_fallback.inc();
        if let Some(cb) = &self.on_forced_websocket {
            cb(region, reason);
        }
    }

    fn reset_inactive_timeout(&mut self) {
        self.inactive_timeout
            .as_mut()
            .reset(Instant::now() + RELAY_INACTIVE_CLEANUP_TIME);
    }

    /// Dials and runs the connection.
    ///
    /// `Ok(())` means the actor should shut down.
    async fn run_once(&mut self) -> Result<(), SessionError> {
        let conn = match self.run_dialing().instrument(info_span!("dialing")).await {
            Some(res) => res.context(DialSnafu)?,
            None => return Ok(()),
        };
        let res = self
            .run_connected(&*conn)
            .instrument(info_span!("connected"))
            .await;
        conn.close();
        res.context(ConnectionSnafu)
    }

    /// Actor loop while connecting.
    ///
    /// Returns `None` if the actor needs to shut down.
    async fn run_dialing(&mut self) -> Option<Result<Box<dyn RelayConn>, ConnectError>> {
        trace!(transport = %self.transport, "connecting to relay");

        // Queued datagrams get stale while we cannot deliver them.
        let mut send_datagram_flush = time::interval(UNDELIVERABLE_DATAGRAM_TIMEOUT);
        send_datagram_flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        send_datagram_flush.reset();

        let dialing_fut = self.dial_relay();
        tokio::pin!(dialing_fut);
        loop {
            tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => {
                    debug!("shutdown");
                    break None;
                }
                res = &mut dialing_fut => break Some(res),
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbox closed, shutdown");
                        break None;
                    };
                    match msg {
                        ActiveRelayMessage::SetHomeRelay(is_home) => self.is_home_relay = is_home,
                        ActiveRelayMessage::CheckConnection(_) => {}
                        #[cfg(test)]
                        ActiveRelayMessage::GetTransport(tx) => {
                            tx.send(None).ok();
                        }
                    }
                }
                _ = send_datagram_flush.tick() => {
                    let mut dropped = 0;
                    while self.relay_datagrams_send.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        debug!(dropped, ?UNDELIVERABLE_DATAGRAM_TIMEOUT, "dropping datagrams to send");
                        self.metrics.send_relay_error.inc_by(dropped);
                    }
                }
                _ = &mut self.inactive_timeout, if !self.is_home_relay => {
                    debug!(?RELAY_INACTIVE_CLEANUP_TIME, "inactive, exiting");
                    break None;
                }
            }
        }
    }

    fn dial_relay(
        &self,
    ) -> impl Future<Output = Result<Box<dyn RelayConn>, ConnectError>> + Send + use<> {
        let dial = self.dialer.dial(self.region.clone(), self.transport);
        async move {
            match time::timeout(CONNECT_TIMEOUT, dial).await {
                Ok(res) => res,
                Err(_) => ConnectTimeoutSnafu.fail(),
            }
        }
    }

    /// Actor loop while connected.
    ///
    /// `Ok` means the actor should shut down, `Err` that the connection was lost.
    async fn run_connected(&mut self, conn: &dyn RelayConn) -> Result<(), RunError> {
        debug!(transport = %conn.transport(), "connected to relay");
        let mut send_datagrams_buf = Vec::with_capacity(SEND_DATAGRAM_BATCH_SIZE);
        let mut recv_fut = conn.recv();

        loop {
            tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => {
                    debug!("shutdown");
                    break Ok(());
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        warn!("inbox closed, shutdown");
                        break Ok(());
                    };
                    match msg {
                        ActiveRelayMessage::SetHomeRelay(is_home) => self.is_home_relay = is_home,
                        ActiveRelayMessage::CheckConnection(local_ips) => {
                            match conn.local_addr() {
                                Some(addr) if local_ips.contains(&addr.ip()) => {
                                    match time::timeout(PING_TIMEOUT, conn.ping()).await {
                                        Ok(Ok(())) => trace!("relay ping ok"),
                                        _ => break Err(PingSnafu.build()),
                                    }
                                }
                                Some(_) => break Err(LocalIpInvalidSnafu.build()),
                                None => break Err(LocalAddrMissingSnafu.build()),
                            }
                        }
                        #[cfg(test)]
                        ActiveRelayMessage::GetTransport(tx) => {
                            tx.send(Some(conn.transport())).ok();
                        }
                    }
                }
                count = self.relay_datagrams_send.recv_many(
                    &mut send_datagrams_buf,
                    SEND_DATAGRAM_BATCH_SIZE,
                ) => {
                    if count == 0 {
                        warn!("datagram inbox closed, shutdown");
                        break Ok(());
                    }
                    self.reset_inactive_timeout();
                    for item in send_datagrams_buf.drain(..) {
                        match time::timeout(PING_TIMEOUT, conn.send(item.dst, item.data)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                self.metrics.send_relay_error.inc();
                                return Err(err).context(SendSnafu);
                            }
                            Err(_) => {
                                self.metrics.send_relay_error.inc();
                                return SendTimeoutSnafu.fail();
                            }
                        }
                    }
                }
                res = &mut recv_fut => {
                    recv_fut = conn.recv();
                    let packet = res.context(RecvSnafu)?;
                    self.reset_inactive_timeout();
                    if self.last_packet_src != Some(packet.src) {
                        // avoids the map lookup for a single busy peer
                        self.last_packet_src = Some(packet.src);
                        self.shared.note_route(packet.src, self.region.region_id);
                    }
                    let datagram = RelayRecvDatagram {
                        region: self.region.region_id,
                        src: packet.src,
                        data: packet.data,
                    };
                    if let Err(err) = self.relay_datagrams_recv.try_send(datagram) {
                        debug!("dropping received relay packet: {err:#}");
                    }
                }
                _ = &mut self.inactive_timeout, if !self.is_home_relay => {
                    debug!(?RELAY_INACTIVE_CLEANUP_TIME, "inactive, exiting");
                    break Ok(());
                }
            }
        }
    }
}

/// Handle to one [`ActiveRelayActor`].
#[derive(Debug, Clone)]
struct ActiveRelayHandle {
    inbox_addr: mpsc::Sender<ActiveRelayMessage>,
    datagrams_send_queue: mpsc::Sender<RelaySendItem>,
    stop_token: CancellationToken,
}

impl ActiveRelayHandle {
    fn is_closed(&self) -> bool {
        self.inbox_addr.is_closed()
    }
}

/// What a [`RelayPool`] needs to run.
#[derive(derive_more::Debug)]
pub(super) struct RelayPoolOptions {
    pub(super) relay_map: RelayMap,
    pub(super) dialer: Arc<dyn RelayDialer>,
    pub(super) queue_len: usize,
    pub(super) relay_datagrams_recv: mpsc::Sender<RelayRecvDatagram>,
    #[debug(skip)]
    pub(super) on_forced_websocket: Option<ForcedWebsocketFn>,
    pub(super) metrics: Arc<Metrics>,
}

#[derive(Debug, Default)]
struct PoolInner {
    sessions: BTreeMap<RegionId, ActiveRelayHandle>,
    tasks: JoinSet<()>,
    home: Option<RegionId>,
    closed: bool,
}

/// All relay sessions of the manager.
#[derive(derive_more::Debug)]
pub(super) struct RelayPool {
    relay_map: RelayMap,
    dialer: Arc<dyn RelayDialer>,
    queue_len: usize,
    relay_datagrams_recv: mpsc::Sender<RelayRecvDatagram>,
    #[debug(skip)]
    on_forced_websocket: Option<ForcedWebsocketFn>,
    metrics: Arc<Metrics>,
    stop_token: CancellationToken,
    shared: Arc<Shared>,
    inner: Mutex<PoolInner>,
}

impl RelayPool {
    pub(super) fn new(opts: RelayPoolOptions) -> Self {
        let RelayPoolOptions {
            relay_map,
            dialer,
            queue_len,
            relay_datagrams_recv,
            on_forced_websocket,
            metrics,
        } = opts;
        Self {
            relay_map,
            dialer,
            queue_len: queue_len.max(1),
            relay_datagrams_recv,
            on_forced_websocket,
            metrics,
            stop_token: CancellationToken::new(),
            shared: Default::default(),
            inner: Default::default(),
        }
    }

    /// Queues `data` for `dst` on the session to `region`, starting the session if needed.
    ///
    /// If there is no session to `region` but `dst` was recently heard on another region,
    /// that session is used instead.
    pub(super) fn write_to(
        &self,
        region: RegionId,
        dst: PublicKey,
        data: Bytes,
    ) -> Result<(), WriteError> {
        let mut item = RelaySendItem { dst, data };
        // a session may exit between lookup and send, in which case one fresh one is started
        for _ in 0..2 {
            let (region, handle) = {
                let mut inner = self.inner.lock().expect("poisoned");
                if inner.closed {
                    return Err(WriteError::PoolClosed {});
                }
                self.session_for_node(&mut inner, region, &dst)?
            };
            match handle.datagrams_send_queue.try_send(item) {
                Ok(()) => {
                    self.metrics.send_relay.inc();
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%region, dst = %dst.fmt_short(), "relay queue full, dropping packet");
                    self.metrics.send_relay_queue_full.inc();
                    return Err(WriteError::QueueFull { region });
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    item = returned;
                    self.reap_active_relays();
                }
            }
        }
        warn!(%region, "dropped datagram: relay session closed");
        self.metrics.send_relay_error.inc();
        Ok(())
    }

    fn session_for_node(
        &self,
        inner: &mut PoolInner,
        region: RegionId,
        dst: &PublicKey,
    ) -> Result<(RegionId, ActiveRelayHandle), WriteError> {
        if let Some(handle) = inner.sessions.get(&region).filter(|h| !h.is_closed()) {
            return Ok((region, handle.clone()));
        }
        let known = self.shared.routes.lock().expect("poisoned").get(dst).copied();
        if let Some(other) = known {
            if let Some(handle) = inner.sessions.get(&other).filter(|h| !h.is_closed()) {
                trace!(%region, %other, dst = %dst.fmt_short(), "using known relay route");
                return Ok((other, handle.clone()));
            }
        }
        let handle = self.active_relay_handle(inner, region)?;
        Ok((region, handle))
    }

    fn active_relay_handle(
        &self,
        inner: &mut PoolInner,
        region: RegionId,
    ) -> Result<ActiveRelayHandle, WriteError> {
        if let Some(handle) = inner.sessions.get(&region).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }
        let relay_region = self
            .relay_map
            .get_region(region)
            .ok_or(WriteError::UnknownRegion { region })?;
        let handle = self.start_active_relay(inner, relay_region);
        inner.sessions.insert(region, handle.clone());
        self.log_active_relay(inner);
        Ok(handle)
    }

    fn start_active_relay(&self, inner: &mut PoolInner, region: Arc<RelayRegion>) -> ActiveRelayHandle {
        let region_id = region.region_id;
        info!(region = %region_id, "adding relay session");
        self.metrics.relay_sessions_added.inc();

        let (send_datagram_tx, send_datagram_rx) = mpsc::channel(self.queue_len);
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let stop_token = self.stop_token.child_token();
        let transport = self.shared.transport_for(&region);
        let actor = ActiveRelayActor {
            region,
            transport,
            dialer: self.dialer.clone(),
            inbox: inbox_rx,
            relay_datagrams_send: send_datagram_rx,
            relay_datagrams_recv: self.relay_datagrams_recv.clone(),
            is_home_relay: inner.home == Some(region_id),
            inactive_timeout: Box::pin(time::sleep(RELAY_INACTIVE_CLEANUP_TIME)),
            last_packet_src: None,
            stop_token: stop_token.clone(),
            shared: self.shared.clone(),
            on_forced_websocket: self.on_forced_websocket.clone(),
            metrics: self.metrics.clone(),
        };
        let span = info_span!("active-relay", region = %region_id);
        inner.tasks.spawn(actor.run().instrument(span));
        ActiveRelayHandle {
            inbox_addr: inbox_tx,
            datagrams_send_queue: send_datagram_tx,
            stop_token,
        }
    }

    /// Sets the home region, connecting to it eagerly.
    pub(super) fn set_home(&self, home: Option<RegionId>) {
        let mut inner = self.inner.lock().expect("poisoned");
        if inner.closed {
            return;
        }
        inner.home = home;
        for (region, handle) in &inner.sessions {
            let is_home = Some(*region) == home;
            if let Err(err) = handle
                .inbox_addr
                .try_send(ActiveRelayMessage::SetHomeRelay(is_home))
            {
                debug!(%region, "could not update home flag: {err:#}");
            }
        }
        if let Some(home) = home {
            if let Err(err) = self.active_relay_handle(&mut inner, home) {
                warn!("home relay session not started: {err:#}");
            }
        }
    }

    pub(super) fn home(&self) -> Option<RegionId> {
        self.inner.lock().expect("poisoned").home
    }

    /// Asks every session to verify its connection after a rebind.
    ///
    /// Sessions from a local IP not in `local_ips` reconnect, all others ping the relay
    /// and reconnect if that fails.
    pub(super) fn check_connections(&self, local_ips: Vec<IpAddr>) {
        let inner = self.inner.lock().expect("poisoned");
        for (region, handle) in &inner.sessions {
            if let Err(err) = handle
                .inbox_addr
                .try_send(ActiveRelayMessage::CheckConnection(local_ips.clone()))
            {
                debug!(%region, "could not check relay connection: {err:#}");
            }
        }
    }

    /// Removes sessions which exited, e.g. because they were idle, and makes sure the home
    /// session is running.
    pub(super) fn reap_active_relays(&self) {
        let mut inner = self.inner.lock().expect("poisoned");
        while let Some(res) = inner.tasks.try_join_next() {
            if let Err(err) = res {
                if !err.is_cancelled() {
                    error!("relay session failed: {err:?}");
                }
            }
        }
        let before = inner.sessions.len();
        inner.sessions.retain(|_, handle| !handle.is_closed());
        let removed = before - inner.sessions.len();
        self.metrics.relay_sessions_removed.inc_by(removed as u64);
        if inner.closed {
            return;
        }
        if let Some(home) = inner.home {
            if let Err(err) = self.active_relay_handle(&mut inner, home) {
                warn!("home relay session not started: {err:#}");
            }
        }
        if removed > 0 {
            self.log_active_relay(&inner);
        }
    }

    /// Closes every session. The pool keeps working, a later write starts a new session.
    pub(super) fn close_all(&self) {
        let mut inner = self.inner.lock().expect("poisoned");
        let sessions = std::mem::take(&mut inner.sessions);
        self.metrics.relay_sessions_removed.inc_by(sessions.len() as u64);
        for handle in sessions.values() {
            handle.stop_token.cancel();
        }
        self.log_active_relay(&inner);
    }

    /// Stops all sessions and waits for them to finish.
    pub(super) async fn shutdown(&self) {
        let mut tasks = {
            let mut inner = self.inner.lock().expect("poisoned");
            inner.closed = true;
            let sessions = std::mem::take(&mut inner.sessions);
            self.metrics.relay_sessions_removed.inc_by(sessions.len() as u64);
            std::mem::take(&mut inner.tasks)
        };
        self.stop_token.cancel();
        if !join_or_abort(&mut tasks, SHUTDOWN_TIMEOUT).await {
            warn!("relay sessions didn't finish in time, aborted");
        }
    }

    /// The regions with a running session, sorted.
    pub(super) fn active_regions(&self) -> Vec<RegionId> {
        let inner = self.inner.lock().expect("poisoned");
        inner
            .sessions
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(r, _)| *r)
            .collect()
    }

    /// The region `peer` was last heard on.
    pub(super) fn known_route(&self, peer: &PublicKey) -> Option<RegionId> {
        self.shared.routes.lock().expect("poisoned").get(peer).copied()
    }

    fn log_active_relay(&self, inner: &PoolInner) {
        debug!("{} active relay sessions{}", inner.sessions.len(), {
            let mut s = String::new();
            if !inner.sessions.is_empty() {
                s += ":";
                for region in inner.sessions.keys() {
                    s += &format!(" region-{region}");
                }
            }
            s
        });
    }

    #[cfg(test)]
    async fn transport(&self, region: RegionId) -> Option<Transport> {
        let handle = self.inner.lock().expect("poisoned").sessions.get(&region).cloned()?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle
            .inbox_addr
            .send(ActiveRelayMessage::GetTransport(tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Waits for all `tasks`, aborting the ones still running after `timeout`.
///
/// Returns once every task is gone. Returns `false` if some had to be aborted.
async fn join_or_abort(tasks: &mut JoinSet<()>, timeout: Duration) -> bool {
    let tasks_ref = &mut *tasks;
    let done = time::timeout(timeout, async move {
        while let Some(res) = tasks_ref.join_next().await {
            if let Err(err) = res {
                warn!("relay session failed: {err:?}");
            }
        }
    })
    .await;
    if done.is_ok() {
        return true;
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meshsock_base::SecretKey;
    use meshsock_relay::test_utils::TestRelay;
    use tracing_test::traced_test;

    use super::*;

    fn relay_map(ids: &[RegionId]) -> RelayMap {
        ids.iter()
            .map(|id| {
                RelayRegion::from_url(
                    *id,
                    format!("https://relay{id}.example.com").parse().unwrap(),
                )
            })
            .collect()
    }

    struct TestPool {
        key: PublicKey,
        pool: RelayPool,
        recv: mpsc::Receiver<RelayRecvDatagram>,
        metrics: Arc<Metrics>,
    }

    fn pool(relay: &TestRelay, map: RelayMap, queue_len: usize) -> TestPool {
        pool_with_cb(relay, map, queue_len, None)
    }

    fn pool_with_cb(
        relay: &TestRelay,
        map: RelayMap,
        queue_len: usize,
        on_forced_websocket: Option<ForcedWebsocketFn>,
    ) -> TestPool {
        let key = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let (tx, recv) = mpsc::channel(64);
        let metrics = Arc::new(Metrics::default());
        let pool = RelayPool::new(RelayPoolOptions {
            relay_map: map,
            dialer: relay.dialer(key),
            queue_len,
            relay_datagrams_recv: tx,
            on_forced_websocket,
            metrics: metrics.clone(),
        });
        TestPool {
            key,
            pool,
            recv,
            metrics,
        }
    }

    async fn wait_connected(relay: &TestRelay, region: RegionId, key: PublicKey) {
        time::timeout(Duration::from_secs(5), async {
            while !relay.connected(region).contains(&key) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("not connected");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_write_to_lazily_connects() {
        let relay = TestRelay::new();
        let map = relay_map(&[1]);
        let a = pool(&relay, map.clone(), 8);
        let mut b = pool(&relay, map, 8);

        assert!(a.pool.active_regions().is_empty());
        // b needs a session to be reachable on region 1
        b.pool.set_home(Some(1));
        wait_connected(&relay, 1, b.key).await;

        a.pool
            .write_to(1, b.key, Bytes::from_static(b"hello"))
            .unwrap();
        assert_eq!(a.pool.active_regions(), vec![1]);

        let got = time::timeout(Duration::from_secs(5), b.recv.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.region, 1);
        assert_eq!(got.src, a.key);
        assert_eq!(&got.data[..], b"hello");
        assert_eq!(b.pool.known_route(&a.key), Some(1));
        assert_eq!(a.metrics.send_relay.get(), 1);
        assert_eq!(a.metrics.relay_sessions_added.get(), 1);

        a.pool.shutdown().await;
        b.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_region() {
        let relay = TestRelay::new();
        let a = pool(&relay, relay_map(&[1]), 8);
        let dst = SecretKey::generate(&mut rand::rngs::OsRng).public();
        let err = a.pool.write_to(9, dst, Bytes::new()).unwrap_err();
        assert!(matches!(err, WriteError::UnknownRegion { region: 9 }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_queue_full_drops() {
        let relay = TestRelay::new();
        relay.set_unreachable(1, true);
        let a = pool(&relay, relay_map(&[1]), 2);
        let dst = SecretKey::generate(&mut rand::rngs::OsRng).public();

        a.pool.write_to(1, dst, Bytes::from_static(b"1")).unwrap();
        a.pool.write_to(1, dst, Bytes::from_static(b"2")).unwrap();
        let err = a
            .pool
            .write_to(1, dst, Bytes::from_static(b"3"))
            .unwrap_err();
        assert!(matches!(err, WriteError::QueueFull { region: 1 }));
        assert_eq!(a.metrics.send_relay_queue_full.get(), 1);

        a.pool.shutdown().await;
        let err = a.pool.write_to(1, dst, Bytes::new()).unwrap_err();
        assert!(matches!(err, WriteError::PoolClosed { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_websocket_fallback() {
        let relay = TestRelay::new();
        relay.refuse_http_upgrade(2);
        let fallbacks = Arc::new(AtomicUsize::new(0));
        let cb: ForcedWebsocketFn = {
            let fallbacks = fallbacks.clone();
            Arc::new(move |region, _reason| {
                assert_eq!(region, 2);
                fallbacks.fetch_add(1, Ordering::SeqCst);
            })
        };
        let a = pool_with_cb(&relay, relay_map(&[2]), 8, Some(cb));
        a.pool.set_home(Some(2));
        wait_connected(&relay, 2, a.key).await;

        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(a.metrics.relay_websocket_fallback.get(), 1);
        assert_eq!(a.pool.transport(2).await, Some(Transport::WebSocket));
        let transports: Vec<_> = relay.dials().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(transports, vec![Transport::Http, Transport::WebSocket]);

        // a new session goes straight to WebSocket
        a.pool.close_all();
        a.pool.reap_active_relays();
        time::timeout(Duration::from_secs(5), async {
            while relay.dials().len() < 3 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(relay.dials()[2].2, Transport::WebSocket);
        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);

        a.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_idle_cleanup_spares_home() {
        let relay = TestRelay::new();
        let a = pool(&relay, relay_map(&[1, 2]), 8);
        let dst = SecretKey::generate(&mut rand::rngs::OsRng).public();

        a.pool.set_home(Some(1));
        a.pool.write_to(2, dst, Bytes::from_static(b"x")).unwrap();
        assert_eq!(a.pool.active_regions(), vec![1, 2]);

        time::sleep(RELAY_INACTIVE_CLEANUP_TIME + Duration::from_secs(1)).await;
        a.pool.reap_active_relays();
        assert_eq!(a.pool.active_regions(), vec![1]);
        assert_eq!(a.metrics.relay_sessions_removed.get(), 1);

        a.pool.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_check_connections_reconnects() {
        let relay = TestRelay::new();
        let a = pool(&relay, relay_map(&[1]), 8);
        a.pool.set_home(Some(1));
        wait_connected(&relay, 1, a.key).await;
        assert_eq!(relay.dials().len(), 1);

        // the test relay connects from localhost, which is still a local address
        a.pool.check_connections(vec![IpAddr::from([127, 0, 0, 1])]);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.dials().len(), 1);

        a.pool.check_connections(vec![IpAddr::from([10, 0, 0, 1])]);
        time::timeout(Duration::from_secs(5), async {
            while relay.dials().len() < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_connected(&relay, 1, a.key).await;

        a.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_or_abort_waits_for_stuck_tasks() {
        struct SetOnDrop(Arc<AtomicUsize>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        tasks.spawn(async {});
        let guard = SetOnDrop(dropped.clone());
        tasks.spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });

        assert!(!join_or_abort(&mut tasks, SHUTDOWN_TIMEOUT).await);
        // the stuck task is gone by the time we return
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(tasks.is_empty());

        tasks.spawn(async {});
        assert!(join_or_abort(&mut tasks, SHUTDOWN_TIMEOUT).await);
    }
}
