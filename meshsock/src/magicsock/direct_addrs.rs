//! Our own direct addresses: how they are found and how their discovery is scheduled.

use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
    sync::RwLock,
};

use n0_future::time::{Duration, Instant};
use netwatch::ip::LocalAddresses;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use super::endpoint_tracker::EndpointTracker;
use crate::{defaults::timeouts::ENDPOINTS_FRESH_ENOUGH, net_report::Report};

/// A *direct address* on which this node might be contactable.
///
/// Direct addresses are UDP socket addresses on which a node could potentially be
/// contacted. These can come from various sources depending on the network topology of the
/// node, see [`DirectAddrType`] for the several kinds of sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectAddr {
    /// The address.
    pub addr: SocketAddr,
    /// The origin of this direct address.
    pub typ: DirectAddrType,
}

/// The type of direct address.
///
/// These are the various sources or origins from which a node might have found a
/// possible [`DirectAddr`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub enum DirectAddrType {
    /// Not yet determined..
    #[display("?")]
    Unknown,
    /// A locally bound socket address.
    #[display("local")]
    Local,
    /// Public internet address discovered via STUN.
    ///
    /// This can be different from locally bound addresses when the node is on a local
    /// network which performs NAT or similar.
    #[display("stun")]
    Stun,
    /// An address assigned by the router using port mapping.
    #[display("portmap")]
    Portmapped,
    /// Hard NAT: STUN'ed IPv4 address + local fixed port.
    ///
    /// The router may have been configured to forward the fixed port we are bound to.
    #[display("stun4localport")]
    Stun4LocalPort,
}

/// The local sockets, as input to [`determine_direct_addrs`].
#[derive(Debug, Clone, Copy)]
pub(super) struct BoundSocket {
    /// The address the socket was asked to bind to.
    pub(super) bound: SocketAddr,
    /// The address the socket actually got.
    pub(super) local: SocketAddr,
}

/// Merges all sources of direct addresses into a list without duplicates.
///
/// The list is ordered from the farthest but most reliable to the closest but least
/// reliable address: port mapped, STUN, the ones still cached in the `tracker`, then local
/// interface addresses. Nobody should rely on this order.
///
/// Local addresses are not cached, we see all of them each time. `local_ips` is only
/// called if a socket is bound to the unspecified address.
pub(super) fn determine_direct_addrs(
    portmapped: Option<SocketAddr>,
    report: Option<&Report>,
    preferred_port: u16,
    sockets: &[BoundSocket],
    tracker: &mut EndpointTracker,
    now: Instant,
    local_ips: impl FnOnce() -> LocalAddresses,
) -> Vec<DirectAddr> {
    let mut seen = BTreeSet::new();
    let mut addrs = Vec::new();
    let mut add = |addrs: &mut Vec<DirectAddr>, addr: SocketAddr, typ: DirectAddrType| {
        if seen.insert(addr) {
            addrs.push(DirectAddr { addr, typ });
        }
    };

    if let Some(portmapped) = portmapped {
        add(&mut addrs, portmapped, DirectAddrType::Portmapped);
    }

    if let Some(report) = report {
        if let Some(global_v4) = report.global_v4 {
            add(&mut addrs, global_v4.into(), DirectAddrType::Stun);

            // If they're behind a hard NAT and are using a fixed port locally, assume they
            // might've added a static port mapping on their router to the same explicit
            // port that we are running with. Worst case it's an invalid candidate mapping.
            if report.mapping_varies_by_dest_ip.unwrap_or_default() && preferred_port != 0 {
                let mut addr = global_v4;
                addr.set_port(preferred_port);
                add(&mut addrs, addr.into(), DirectAddrType::Stun4LocalPort);
            }
        }
        if let Some(global_v6) = report.global_v6 {
            add(&mut addrs, global_v6.into(), DirectAddrType::Stun);
        }
    }

    let mut addrs = tracker.update(now, addrs);
    for addr in &addrs {
        seen.insert(addr.addr);
    }
    let mut add = |addrs: &mut Vec<DirectAddr>, addr: SocketAddr| {
        if seen.insert(addr) {
            addrs.push(DirectAddr {
                addr,
                typ: DirectAddrType::Local,
            });
        }
    };

    if sockets.iter().any(|s| s.bound.ip().is_unspecified()) {
        let LocalAddresses {
            regular: mut ips,
            loopback,
        } = local_ips();
        if ips.is_empty() && addrs.is_empty() {
            // Include loopback addresses only if there are no other interfaces or public
            // addresses, this allows testing offline.
            ips = loopback;
        }
        for ip in ips {
            let port = sockets.iter().find_map(|s| match (ip, s.local.ip()) {
                (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                    Some(s.local.port())
                }
                _ => None,
            });
            if let Some(port) = port {
                add(&mut addrs, SocketAddr::new(ip, port));
            }
        }
    }
    for socket in sockets {
        if !socket.bound.ip().is_unspecified() {
            add(&mut addrs, socket.local);
        }
    }

    addrs
}

/// The discovered direct addresses of this node.
///
/// These are all the [`DirectAddr`]s that this node is aware of for itself. They include
/// all locally bound ones as well as those discovered by other mechanisms like STUN.
#[derive(Debug, Default)]
pub(super) struct DiscoveredDirectAddrs {
    /// The last set of discovered direct addresses.
    addrs: RwLock<Vec<DirectAddr>>,
    /// The last time the direct addresses were updated, even if there was no change.
    ///
    /// This is only ever None at startup.
    updated_at: RwLock<Option<Instant>>,
}

impl DiscoveredDirectAddrs {
    /// Updates the direct addresses, returns `true` if they changed, `false` if not.
    ///
    /// Only the set of addresses counts, not their order.
    pub(super) fn update(&self, addrs: Vec<DirectAddr>, now: Instant) -> bool {
        *self.updated_at.write().expect("poisoned") = Some(now);
        let mut current = self.addrs.write().expect("poisoned");
        let old: BTreeSet<&DirectAddr> = current.iter().collect();
        let new: BTreeSet<&DirectAddr> = addrs.iter().collect();
        if old == new {
            return false;
        }
        debug!(?addrs, "direct addresses changed");
        *current = addrs;
        true
    }

    pub(super) fn addrs(&self) -> Vec<DirectAddr> {
        self.addrs.read().expect("poisoned").clone()
    }

    pub(super) fn sockaddrs(&self) -> Vec<SocketAddr> {
        self.addrs
            .read()
            .expect("poisoned")
            .iter()
            .map(|da| da.addr)
            .collect()
    }

    /// Whether the direct addr information is considered "fresh".
    ///
    /// If not fresh you should probably update the direct addresses before using this info.
    ///
    /// Returns `Ok(())` if fresh enough and `Err(elapsed)` if not fresh enough.
    /// `elapsed` is the time elapsed since the direct addresses were last updated.
    ///
    /// If there is no direct address information `Err(Duration::ZERO)` is returned.
    pub(super) fn fresh_enough(&self, now: Instant) -> Result<(), Duration> {
        match *self.updated_at.read().expect("poisoned") {
            None => Err(Duration::ZERO),
            Some(time) => {
                let elapsed = now.saturating_duration_since(time);
                if elapsed <= ENDPOINTS_FRESH_ENOUGH {
                    Ok(())
                } else {
                    Err(elapsed)
                }
            }
        }
    }
}

/// Manages currently running direct addr discovery, aka net_report runs.
///
/// Invariants:
/// - only one direct addr update must be running at a time
/// - if an update is scheduled while another one is running, remember that
///   and start a new one when the current one has finished
#[derive(Debug)]
pub(super) struct DirectAddrUpdateState {
    /// If running, set to the reason for the currently the update.
    running: watch::Sender<Option<&'static str>>,
    /// If set, start a new update as soon as the current one is finished.
    want_update: std::sync::Mutex<Option<&'static str>>,
}

impl DirectAddrUpdateState {
    pub(super) fn new() -> Self {
        let (running, _) = watch::channel(None);
        DirectAddrUpdateState {
            running,
            want_update: Default::default(),
        }
    }

    /// Schedules a new run, either starting it immediately if none is running or
    /// scheduling it for later.
    pub(super) fn schedule_run(&self, why: &'static str) {
        // Holding the lock keeps `finish_run` from ending the run between the check and
        // the insert.
        let mut want_update = self.want_update.lock().expect("poisoned");
        if self.is_running() {
            let _ = want_update.insert(why);
        } else {
            self.run(why);
        }
    }

    /// Returns `true` if an update is currently in progress.
    pub(super) fn is_running(&self) -> bool {
        self.running.borrow().is_some()
    }

    /// Watches for runs being started.
    pub(super) fn subscribe(&self) -> watch::Receiver<Option<&'static str>> {
        self.running.subscribe()
    }

    /// Trigger a new run.
    fn run(&self, why: &'static str) {
        self.running.send_replace(Some(why));
    }

    /// Called when a run is done, starts the run that was asked for meanwhile.
    ///
    /// Returns the reason of the new run, if any.
    pub(super) fn finish_run(&self) -> Option<&'static str> {
        let mut want_update = self.want_update.lock().expect("poisoned");
        match want_update.take() {
            Some(why) => {
                self.run(why);
                Some(why)
            }
            None => {
                self.running.send_replace(None);
                None
            }
        }
    }
}
