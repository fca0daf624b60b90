//! The background actor of a [`MagicSock`]: timers, direct address discovery and the home
//! relay region.

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use netwatch::ip::LocalAddresses;
use n0_future::time::{Duration, Instant};
use rand::{Rng, SeedableRng, seq::SliceRandom};
use tokio::{sync::mpsc, task::JoinSet, time};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::{
    MagicSock,
    direct_addrs::determine_direct_addrs,
    endpoint_tracker::EndpointTracker,
};
use crate::{
    defaults::{
        RE_STUN_MAX_SECS, RE_STUN_MIN_SECS,
        timeouts::{HEARTBEAT_INTERVAL, NET_REPORT_TIMEOUT, RELAY_CLEAN_INTERVAL},
    },
    net_report::{NetInfo, NetReportError, Report, TimeoutSnafu as NetReportTimeoutSnafu},
    portmapper::cached_mapping_or_start_creating_one,
};
use meshsock_relay::RegionId;

#[derive(Debug)]
pub(super) enum ActorMessage {
    /// The result of a net report run, and why it was started.
    NetReport(Result<Option<Report>, NetReportError>, &'static str),
}

#[derive(Debug)]
pub(super) struct Actor {
    msock: Arc<MagicSock>,
    msg_receiver: mpsc::Receiver<ActorMessage>,
    msg_sender: mpsc::Sender<ActorMessage>,
    periodic_re_stun_timer: time::Interval,
    endpoint_tracker: EndpointTracker,
    /// Running net reports.
    tasks: JoinSet<()>,
}

impl Actor {
    pub(super) fn new(msock: Arc<MagicSock>) -> Self {
        let (msg_sender, msg_receiver) = mpsc::channel(256);
        Self {
            msock,
            msg_receiver,
            msg_sender,
            periodic_re_stun_timer: new_re_stun_timer(false),
            endpoint_tracker: Default::default(),
            tasks: JoinSet::new(),
        }
    }

    pub(super) async fn run(mut self) {
        let metrics = self.msock.metrics.clone();
        // Let the the heartbeat only start a couple seconds later
        let mut heartbeat_timer = time::interval_at(
            time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut relay_clean_timer = time::interval_at(
            time::Instant::now() + RELAY_CLEAN_INTERVAL,
            RELAY_CLEAN_INTERVAL,
        );
        let mut direct_addr_update_receiver = self.msock.direct_addr_update_state.subscribe();
        let mut portmap_watcher = self
            .msock
            .port_mapper
            .as_ref()
            .map(|pm| pm.watch_external_address());
        // a run requested before we subscribed
        let pending = *direct_addr_update_receiver.borrow_and_update();
        if let Some(why) = pending {
            self.refresh_direct_addrs(why).await;
        }

        loop {
            metrics.actor_tick_main.inc();
            tokio::select! {
                biased;

                _ = self.msock.cancel_token.cancelled() => {
                    debug!("shutting down");
                    break;
                }
                Some(msg) = self.msg_receiver.recv() => {
                    trace!(?msg, "tick: msg");
                    metrics.actor_tick_msg.inc();
                    self.handle_actor_message(msg).await;
                }
                tick = self.periodic_re_stun_timer.tick() => {
                    trace!("tick: re_stun {:?}", tick);
                    metrics.actor_tick_re_stun.inc();
                    self.periodic_re_stun();
                }
                _ = heartbeat_timer.tick() => {
                    trace!("tick: heartbeat {} nodes", self.msock.node_map.node_count());
                    metrics.actor_tick_heartbeat.inc();
                    let msgs = self.msock.node_map.nodes_stayin_alive(Instant::now());
                    self.msock.send_ping_actions(msgs).await;
                }
                _ = relay_clean_timer.tick() => {
                    trace!("tick: relay clean");
                    metrics.actor_tick_relay_clean.inc();
                    if self.msock.network_up() {
                        self.msock.relay_pool.reap_active_relays();
                    }
                }
                Ok(()) = direct_addr_update_receiver.changed() => {
                    let reason = *direct_addr_update_receiver.borrow_and_update();
                    trace!("tick: direct addr update receiver {:?}", reason);
                    metrics.actor_tick_direct_addr_update_receiver.inc();
                    if let Some(reason) = reason {
                        self.refresh_direct_addrs(reason).await;
                    }
                }
                Ok(()) = watch_changed(&mut portmap_watcher) => {
                    trace!("tick: portmap changed");
                    metrics.actor_tick_portmap_changed.inc();
                    let new_external_address = portmap_watcher.as_mut().and_then(|w| *w.borrow_and_update());
                    debug!("external address updated: {new_external_address:?}");
                    self.msock.re_stun("portmap_updated");
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            warn!("net report task panicked: {err:?}");
                        }
                    }
                }
                else => {
                    trace!("tick: other");
                    metrics.actor_tick_other.inc();
                }
            }
        }

        if let Some(port_mapper) = &self.msock.port_mapper {
            port_mapper.deactivate();
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        debug!("actor stopped");
    }

    async fn handle_actor_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::NetReport(report, why) => {
                self.handle_report(report, why).await;
            }
        }
    }

    /// Starts a periodic re-STUN unless the tunnel has been idle for too long.
    fn periodic_re_stun(&mut self) {
        if !self.msock.network_up() {
            trace!("skipping periodic re-STUN, network down");
            return;
        }
        if self.msock.node_map.node_count() == 0 {
            trace!("skipping periodic re-STUN, no peers");
            return;
        }
        if !self.msock.force_background_stun {
            if let Some(idle_for) = &self.msock.idle_for {
                let idle = idle_for();
                if idle > self.msock.session_active_timeout {
                    debug!(?idle, "skipping periodic re-STUN, idle");
                    return;
                }
            }
        }
        self.msock.re_stun("periodic");
    }

    async fn refresh_direct_addrs(&mut self, why: &'static str) {
        self.msock.metrics.update_direct_addrs.inc();
        debug!("starting direct addr update ({})", why);
        if let Some(port_mapper) = &self.msock.port_mapper {
            port_mapper.procure_mapping();
        }
        self.update_net_info(why).await;
    }

    async fn update_net_info(&mut self, why: &'static str) {
        if self.msock.is_closing() {
            return;
        }
        if !self.msock.network_up() {
            debug!("skipping net report, network down");
            self.handle_report(Ok(None), why).await;
            return;
        }
        if self.msock.relay_map.is_empty() {
            debug!("skipping net report, empty relay map");
            self.handle_report(Ok(None), why).await;
            return;
        }

        debug!("requesting net report");
        let report = self
            .msock
            .net_reporter
            .get_report(self.msock.relay_map.clone());
        let msg_sender = self.msg_sender.clone();
        self.tasks.spawn(
            async move {
                let report = match time::timeout(NET_REPORT_TIMEOUT, report).await {
                    Ok(res) => res.map(Some),
                    Err(_) => Err(NetReportTimeoutSnafu.build()),
                };
                // the handler calls finalize_direct_addrs_update
                msg_sender
                    .send(ActorMessage::NetReport(report, why))
                    .await
                    .ok();
            }
            .instrument(info_span!("net-report")),
        );
    }

    async fn handle_report(&mut self, report: Result<Option<Report>, NetReportError>, why: &'static str) {
        match report {
            Ok(Some(report)) => self.handle_net_report_report(report).await,
            Ok(None) => {
                if self.msock.relay_map.is_empty() {
                    self.msock.set_home(None);
                }
                self.update_direct_addresses(None).await;
            }
            Err(err) => {
                warn!("failed to produce net report: {err:#}");
                self.update_home(None);
                self.update_direct_addresses(None).await;
            }
        }
        self.finalize_direct_addrs_update(why);
    }

    fn finalize_direct_addrs_update(&mut self, why: &'static str) {
        match self.msock.direct_addr_update_state.finish_run() {
            Some(new_why) => debug!(why, new_why, "direct addr update done, another one is due"),
            None => {
                // Every re-STUN pushes the periodic one back.
                self.periodic_re_stun_timer = new_re_stun_timer(true);
            }
        }
    }

    async fn handle_net_report_report(&mut self, report: Report) {
        if !self.msock.network_up() {
            debug!("ignoring net report, network went down");
            return;
        }
        self.msock
            .ipv6_reported
            .store(report.ipv6, Ordering::Relaxed);

        let have_port_map = self
            .msock
            .port_mapper
            .as_ref()
            .is_some_and(|pm| pm.watch_external_address().borrow().is_some());
        let mut ni = NetInfo::from_report(&report, have_port_map);
        ni.preferred_region = self.update_home(report.preferred_region);
        self.call_net_info_callback(ni);

        *self.msock.net_report.lock().expect("poisoned") = Some(report.clone());
        self.update_direct_addresses(Some(&report)).await;
    }

    /// Picks and sets the home relay region, returns it.
    fn update_home(&mut self, preferred: Option<RegionId>) -> Option<RegionId> {
        let home = self.pick_home_region(preferred);
        self.msock.set_home(home);
        home
    }

    /// The preferred region if usable, else the current home, else a region picked by our
    /// node id so the choice is stable across restarts.
    fn pick_home_region(&self, preferred: Option<RegionId>) -> Option<RegionId> {
        let relay_map = &self.msock.relay_map;
        if let Some(region) = preferred.filter(|r| relay_map.contains_region(*r)) {
            return Some(region);
        }
        if let Some(region) = self
            .msock
            .relay_pool
            .home()
            .filter(|r| relay_map.contains_region(*r))
        {
            return Some(region);
        }
        let ids = relay_map.region_ids();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&self.msock.me.as_bytes()[..8]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(u64::from_le_bytes(seed));
        ids.choose(&mut rng).copied()
    }

    /// Publishes `ni` unless it is basically what was published last.
    fn call_net_info_callback(&self, ni: NetInfo) {
        {
            let mut last = self.msock.net_info_last.lock().expect("poisoned");
            if last.as_ref().is_some_and(|last| last.basically_equal(&ni)) {
                return;
            }
            *last = Some(ni.clone());
        }
        debug!(?ni, "net info changed");
        if let Some(cb) = &self.msock.on_net_info {
            cb(&ni);
        }
    }

    /// Marks the published net info as having a port mapping, publishing it if that changed.
    fn set_net_info_have_port_map(&self) {
        let ni = {
            let mut last = self.msock.net_info_last.lock().expect("poisoned");
            match last.as_mut() {
                Some(ni) if !ni.have_port_map => {
                    ni.have_port_map = true;
                    ni.clone()
                }
                // the next report will say so
                _ => return,
            }
        };
        if let Some(cb) = &self.msock.on_net_info {
            cb(&ni);
        }
    }

    /// Recomputes our direct addresses and publishes them if they changed.
    async fn update_direct_addresses(&mut self, report: Option<&Report>) {
        let msock = self.msock.clone();
        let portmapped = match &msock.port_mapper {
            Some(port_mapper) => cached_mapping_or_start_creating_one(port_mapper.as_ref()),
            None => None,
        };
        if portmapped.is_some() {
            self.set_net_info_have_port_map();
        }

        let sockets = msock.bound_sockets();
        let local = if sockets.iter().any(|s| s.bound.ip().is_unspecified()) {
            match tokio::task::spawn_blocking(LocalAddresses::new).await {
                Ok(local) => local,
                Err(err) => {
                    warn!("failed to list local addresses: {err:#}");
                    LocalAddresses {
                        regular: Vec::new(),
                        loopback: Vec::new(),
                    }
                }
            }
        } else {
            LocalAddresses {
                regular: Vec::new(),
                loopback: Vec::new(),
            }
        };

        let addrs = if msock.block_endpoints() {
            trace!("endpoints blocked, advertising none");
            Vec::new()
        } else {
            determine_direct_addrs(
                portmapped.map(SocketAddr::V4),
                report,
                msock.preferred_port(),
                &sockets,
                &mut self.endpoint_tracker,
                Instant::now(),
                move || local,
            )
        };

        if msock.direct_addrs.update(addrs, Instant::now()) {
            let addrs = msock.direct_addrs.addrs();
            info!(
                addrs = ?addrs.iter().map(|a| a.addr).collect::<Vec<_>>(),
                "direct addresses changed"
            );
            if let Some(cb) = &msock.on_endpoints {
                cb(&addrs);
            }
        }
        msock.send_queued_call_me_maybes();
    }
}

/// Waits for a change of an optional watcher, forever if there is none.
async fn watch_changed<T>(
    watcher: &mut Option<tokio::sync::watch::Receiver<T>>,
) -> Result<(), tokio::sync::watch::error::RecvError> {
    match watcher {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}

/// A timer firing at a random interval of 20 to 26 seconds.
///
/// Just under 30s, a common UDP NAT timeout.
fn new_re_stun_timer(initial_delay: bool) -> time::Interval {
    let mut rng = rand::thread_rng();
    let d: Duration = rng.gen_range(
        Duration::from_secs(RE_STUN_MIN_SECS)..=Duration::from_secs(RE_STUN_MAX_SECS),
    );
    if initial_delay {
        trace!("scheduling periodic_stun to run in {}s", d.as_secs());
        time::interval_at(time::Instant::now() + d, d)
    } else {
        trace!(
            "scheduling periodic_stun to run immediately and in {}s",
            d.as_secs()
        );
        time::interval(d)
    }
}

#[cfg(test)]
mod tests {
    use meshsock_base::SecretKey;
    use meshsock_relay::{RelayMap, RelayRegion, test_utils::TestRelay};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        magicsock::{Handle, IdleFn, Options, PeerInfo},
        net_report::tests::StaticNetReporter,
    };

    #[test]
    fn test_re_stun_timer_range() {
        for initial_delay in [true, false] {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let timer = rt.block_on(async { new_re_stun_timer(initial_delay) });
            let period = timer.period();
            assert!(period >= Duration::from_secs(RE_STUN_MIN_SECS));
            assert!(period <= Duration::from_secs(RE_STUN_MAX_SECS));
        }
    }

    async fn spawn(
        idle: Option<Duration>,
        force_background_stun: bool,
    ) -> (Handle, Arc<StaticNetReporter>) {
        let relay = TestRelay::new();
        let secret_key = SecretKey::generate(&mut rand::rngs::OsRng);
        let reporter = Arc::new(StaticNetReporter::new(Report {
            udp: true,
            ipv4: true,
            preferred_region: Some(1),
            ..Default::default()
        }));
        let opts = Options {
            relay_map: [RelayRegion::from_url(1, "https://relay.example.com".parse().unwrap())]
                .into_iter()
                .collect::<RelayMap>(),
            relay_dialer: Some(relay.dialer(secret_key.public())),
            net_reporter: Some(reporter.clone()),
            secret_key,
            disable_ipv6: true,
            idle_for: idle.map(|idle| Arc::new(move || idle) as IdleFn),
            force_background_stun,
            ..Default::default()
        };
        let handle = MagicSock::spawn(opts).await.unwrap();
        (handle, reporter)
    }

    fn peer() -> PeerInfo {
        PeerInfo::relay_only(SecretKey::generate(&mut rand::rngs::OsRng).public(), 1)
    }

    async fn settle(reporter: &StaticNetReporter, handle: &MagicSock) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while reporter.calls.load(Ordering::SeqCst) == 0
                || handle.direct_addr_update_state.is_running()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn test_periodic_re_stun_gate() {
        // no peers
        let (handle, reporter) = spawn(None, false).await;
        settle(&reporter, &handle).await;
        let calls = handle.metrics().re_stun_calls.get();
        let mut actor = Actor::new(handle.msock.clone());
        actor.periodic_re_stun();
        assert_eq!(handle.metrics().re_stun_calls.get(), calls);

        handle.set_peer_set(vec![peer()]);
        actor.periodic_re_stun();
        assert_eq!(handle.metrics().re_stun_calls.get(), calls + 1);
        handle.close().await;

        // idle for longer than the session timeout
        let (handle, reporter) = spawn(Some(Duration::from_secs(3600)), false).await;
        settle(&reporter, &handle).await;
        handle.set_peer_set(vec![peer()]);
        let calls = handle.metrics().re_stun_calls.get();
        let mut actor = Actor::new(handle.msock.clone());
        actor.periodic_re_stun();
        assert_eq!(handle.metrics().re_stun_calls.get(), calls);
        handle.close().await;

        // unless forced
        let (handle, reporter) = spawn(Some(Duration::from_secs(3600)), true).await;
        settle(&reporter, &handle).await;
        handle.set_peer_set(vec![peer()]);
        let calls = handle.metrics().re_stun_calls.get();
        let mut actor = Actor::new(handle.msock.clone());
        actor.periodic_re_stun();
        assert_eq!(handle.metrics().re_stun_calls.get(), calls + 1);
        handle.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn test_pick_home_region() {
        let (handle, reporter) = spawn(None, false).await;
        settle(&reporter, &handle).await;
        let actor = Actor::new(handle.msock.clone());
        handle
            .relay_map
            .insert(RelayRegion::from_url(2, "https://relay2.example.com".parse().unwrap()));

        assert_eq!(actor.pick_home_region(Some(2)), Some(2));
        // unknown regions are not picked
        assert_eq!(actor.pick_home_region(Some(9)), Some(1));
        assert_eq!(handle.home_region(), Some(1));

        handle.relay_map.remove(1);
        let fallback = actor.pick_home_region(None);
        assert_eq!(fallback, Some(2));
        handle.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn test_re_stun_while_running_runs_again() {
        let (handle, reporter) = spawn(None, false).await;
        settle(&reporter, &handle).await;
        let calls = reporter.calls.load(Ordering::SeqCst);
        for _ in 0..5 {
            handle.re_stun("burst");
        }
        tokio::time::timeout(Duration::from_secs(10), async {
            while reporter.calls.load(Ordering::SeqCst) < calls + 2
                || handle.direct_addr_update_state.is_running()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.direct_addr_update_state.is_running());
        handle.close().await;
    }
}
