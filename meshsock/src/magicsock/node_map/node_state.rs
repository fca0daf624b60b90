use std::{
    collections::{BTreeMap, BTreeSet, HashMap, btree_map::Entry},
    net::{IpAddr, SocketAddr},
};

use meshsock_base::{DiscoPublicKey, PublicKey};
use meshsock_relay::RegionId;
use n0_future::time::{Duration, Instant};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    IpPort,
    best_addr::{self, BestAddr, Candidate, ClearReason},
    path_state::{ControlMsg, PathState, PingRole, PongReply, Source, summarize_node_paths},
};
use crate::{
    defaults::{
        MAX_INACTIVE_DIRECT_ADDRESSES,
        timeouts::{
            ENDPOINT_TRACKER_LIFETIME, GOOD_ENOUGH_LATENCY, HEARTBEAT_INTERVAL, PING_TIMEOUT,
            SESSION_ACTIVE_TIMEOUT, STAYIN_ALIVE_MIN_ELAPSED, UPGRADE_INTERVAL,
        },
    },
    disco::{self, SendAddr},
    magicsock::Metrics,
    stun::TransactionId,
};

/// How long since a path was last alive before it might be pruned.
const LAST_ALIVE_PRUNE_DURATION: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub(in crate::magicsock) enum PingAction {
    SendCallMeMaybe {
        region: RegionId,
        dst_node: PublicKey,
    },
    SendPing(SendPing),
}

#[derive(Debug)]
pub(in crate::magicsock) struct SendPing {
    pub dst: SendAddr,
    pub dst_node: PublicKey,
    pub tx_id: TransactionId,
    pub purpose: DiscoPingPurpose,
}

/// Indicating a [`NodeState`] has handled a ping.
#[derive(Debug)]
pub(in crate::magicsock) struct PingHandled {
    /// What this ping did to the [`NodeState`].
    pub role: PingRole,
    /// Whether the sender path should also be pinged.
    ///
    /// This is the case if the node does not yet have a trusted direct path. We ping right
    /// back to open the direct path in this direction as well.
    pub needs_ping_back: Option<SendPing>,
}

/// Where the next packet for a node goes.
///
/// Both fields are set while a direct path is used but not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendChoice {
    /// The direct address, if any.
    pub udp_addr: Option<SocketAddr>,
    /// The relay region, if any.
    pub relay: Option<RegionId>,
    /// No direct path is trusted right now, the paths need to be validated.
    pub must_ping: bool,
}

/// The answer to one of our pings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongInfo {
    /// Round trip time of the ping.
    pub latency: Duration,
    /// The path the pong came back on.
    pub path: SendAddr,
    /// Our address as seen by the peer.
    pub reflexive_addr: SocketAddr,
}

#[derive(Debug)]
pub(super) struct SentPing {
    pub(super) to: SendAddr,
    pub(super) at: Instant,
    pub(super) purpose: DiscoPingPurpose,
    /// Notified with the pong of an explicit ping.
    pub(super) resolver: Option<mpsc::Sender<PongInfo>>,
}

/// Options for creating a new [`NodeState`].
#[derive(Debug)]
pub(super) struct Options {
    pub(super) node_id: PublicKey,
    pub(super) disco_key: Option<DiscoPublicKey>,
    pub(super) relay_region: Option<RegionId>,
    /// Is this node currently active (sending data)?
    pub(super) active: bool,
}

/// A remote node and all the paths we know to it.
///
/// One of these paths is via the node's home relay region, but as we exchange pings we
/// hopefully discover direct paths.
#[derive(Debug)]
pub(super) struct NodeState {
    node_id: PublicKey,
    /// The key sealing disco messages to this node.
    ///
    /// `None` disables direct paths: the node only ever is reached through the relay.
    disco_key: Option<DiscoPublicKey>,
    /// The last time we pinged all paths.
    last_full_ping: Option<Instant>,
    /// The relay region that we can relay over to communicate.
    relay: Option<(RegionId, PathState)>,
    /// Best non-relay path, i.e. a UDP address.
    best_addr: BestAddr,
    /// State for each of this node's direct paths.
    paths: BTreeMap<IpPort, PathState>,
    /// Pings in flight, expired lazily by [`NodeState::expire_pings`].
    sent_pings: HashMap<TransactionId, SentPing>,
    /// Last time this node was used, sending to or receiving from it.
    last_used: Option<Instant>,
    /// Last time we sent a call-me-maybe.
    ///
    /// We only try and send one per [`HEARTBEAT_INTERVAL`]. The heartbeat triggers new
    /// call-me-maybe messages as backup.
    last_call_me_maybe: Option<Instant>,
    /// The connection type last reported by [`NodeState::get_send_addrs`].
    conn_type: ConnectionType,
}

impl NodeState {
    pub(super) fn new(options: Options, now: Instant) -> Self {
        NodeState {
            node_id: options.node_id,
            disco_key: options.disco_key,
            last_full_ping: None,
            relay: options
                .relay_region
                .map(|region| (region, PathState::new(Source::PeerSet, now))),
            best_addr: Default::default(),
            paths: BTreeMap::new(),
            sent_pings: HashMap::new(),
            last_used: options.active.then_some(now),
            last_call_me_maybe: None,
            conn_type: ConnectionType::None,
        }
    }

    pub(super) fn node_id(&self) -> &PublicKey {
        &self.node_id
    }

    pub(super) fn set_node_id(&mut self, node_id: PublicKey) {
        self.node_id = node_id;
    }

    pub(super) fn disco_key(&self) -> Option<DiscoPublicKey> {
        self.disco_key
    }

    pub(super) fn relay_region(&self) -> Option<RegionId> {
        self.relay.as_ref().map(|(region, _)| *region)
    }

    /// Returns the direct address and relay region the next packet should be sent on.
    ///
    /// When a direct path is trusted only it is used. Otherwise the relay carries the
    /// packet and `must_ping` asks for the paths to be validated.
    pub(in crate::magicsock) fn choose_send_addr(&mut self, now: Instant, have_ipv6: bool) -> SendChoice {
        self.expire_pings(now);
        let relay = self.relay_region();
        if self.disco_key.is_none() {
            trace!("no disco key, relay only");
            return SendChoice {
                udp_addr: None,
                relay,
                must_ping: false,
            };
        }

        if self.best_addr.is_empty() {
            // Update our best addr from candidate addresses, only if we have recent pongs.
            self.update_best_addr(now);
        }
        match self.best_addr.state(now) {
            best_addr::State::Valid(addr) => {
                trace!(addr = %addr.addr, latency = ?addr.latency, "best_addr is set and valid, use best_addr only");
                SendChoice {
                    udp_addr: Some(addr.addr),
                    relay: None,
                    must_ping: false,
                }
            }
            best_addr::State::Outdated(addr) => {
                // Use it, but send via relay at the same time until a pong confirms it.
                trace!(addr = %addr.addr, latency = ?addr.latency, "best_addr is set but outdated, use best_addr and relay");
                SendChoice {
                    udp_addr: Some(addr.addr),
                    relay,
                    must_ping: true,
                }
            }
            best_addr::State::Empty => {
                if relay.is_some() {
                    let relay_needs_ping = self
                        .relay
                        .as_ref()
                        .is_some_and(|(_, state)| state.needs_ping(now));
                    trace!("best_addr is unset, use relay");
                    SendChoice {
                        udp_addr: None,
                        relay,
                        must_ping: !self.paths.is_empty() || relay_needs_ping,
                    }
                } else {
                    // No relay to fall back to, so randomly try one of the candidates.
                    let addr = self
                        .paths
                        .keys()
                        .filter(|ipp| match ipp.ip() {
                            IpAddr::V4(_) => true,
                            IpAddr::V6(_) => have_ipv6,
                        })
                        .choose_stable(&mut rand::thread_rng())
                        .map(|ipp| SocketAddr::from(*ipp));
                    trace!(udp_addr = ?addr, "best_addr is unset and no relay, use candidate addr");
                    SendChoice {
                        udp_addr: addr,
                        relay: None,
                        must_ping: addr.is_some(),
                    }
                }
            }
        }
    }

    /// Runs path selection over all paths with a pong within the trust window of `now`.
    ///
    /// Keeps the current best address when no path has a recent pong.
    fn update_best_addr(&mut self, now: Instant) {
        let candidates: Vec<Candidate> = self
            .paths
            .iter()
            .map(|(ipp, state)| Candidate {
                addr: SocketAddr::from(*ipp),
                latency: state.recent_latency(now),
            })
            .collect();
        let Some(winner) = best_addr::select(&candidates) else {
            return;
        };
        let (Some(latency), Some(pong_at)) = (
            winner.latency,
            self.paths
                .get(&IpPort::from(winner.addr))
                .and_then(|state| state.recent_pong.as_ref())
                .map(|pong| pong.pong_at),
        ) else {
            return;
        };
        self.best_addr.insert_or_reconfirm(winner.addr, latency, pong_at);
    }

    /// Whether we need to send another call-me-maybe to the node.
    ///
    /// Basically we need to send a call-me-maybe if we need to find a better path. Maybe
    /// we only have a relay path, or our path is expired.
    fn want_call_me_maybe(&self, now: Instant) -> bool {
        if self.disco_key.is_none() {
            return false;
        }
        let Some(last_full_ping) = self.last_full_ping else {
            debug!("no previous full ping: need full ping");
            return true;
        };
        match self.best_addr.state(now) {
            best_addr::State::Empty => {
                debug!("best addr not set: need full ping");
                true
            }
            best_addr::State::Outdated(_) => {
                debug!("best addr expired: need full ping");
                true
            }
            best_addr::State::Valid(addr) => {
                if addr.latency > GOOD_ENOUGH_LATENCY && now - last_full_ping >= UPGRADE_INTERVAL {
                    debug!(
                        "full ping interval expired and latency is only {}ms: need full ping",
                        addr.latency.as_millis()
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drops pings that did not get a pong within [`PING_TIMEOUT`].
    ///
    /// A timed out ping to the best address clears it, unless it was confirmed after the
    /// ping was sent.
    pub(super) fn expire_pings(&mut self, now: Instant) {
        let expired: Vec<TransactionId> = self
            .sent_pings
            .iter()
            .filter(|(_, sp)| now.duration_since(sp.at) >= PING_TIMEOUT)
            .map(|(tx_id, _)| *tx_id)
            .collect();
        for tx_id in expired {
            let Some(sp) = self.sent_pings.remove(&tx_id) else {
                continue;
            };
            debug!(tx = %data_encoding::HEXLOWER.encode(&tx_id), addr = %sp.to, "pong not received in timeout");
            match sp.to {
                SendAddr::Udp(addr) => {
                    if let Some(path) = self.paths.get_mut(&addr.into()) {
                        path.ping_timed_out(sp.at);
                    }
                    // If we fail to ping our current best addr, it is not that good anymore.
                    self.best_addr.clear_if_addr_older(
                        addr,
                        sp.at,
                        ClearReason::PongTimeout,
                        self.relay.is_some(),
                    );
                }
                SendAddr::Relay(region) => {
                    if let Some((home, state)) = self.relay.as_mut() {
                        if *home == region {
                            state.last_ping = None;
                        }
                    }
                }
            }
        }
    }

    #[must_use = "pings must be handled"]
    fn start_ping(&self, dst: SendAddr, purpose: DiscoPingPurpose) -> Option<SendPing> {
        if self.disco_key.is_none() {
            return None;
        }
        let tx_id = TransactionId::default();
        trace!(tx = %data_encoding::HEXLOWER.encode(&tx_id), %dst, ?purpose,
               dst_node = %self.node_id.fmt_short(), "start ping");
        Some(SendPing {
            dst,
            dst_node: self.node_id,
            tx_id,
            purpose,
        })
    }

    /// Record the fact that a ping has been sent out.
    pub(super) fn ping_sent(
        &mut self,
        to: SendAddr,
        tx_id: TransactionId,
        purpose: DiscoPingPurpose,
        resolver: Option<mpsc::Sender<PongInfo>>,
        now: Instant,
    ) {
        trace!(%to, tx = %data_encoding::HEXLOWER.encode(&tx_id), ?purpose, "record ping sent");

        let path_found = match to {
            SendAddr::Udp(addr) => match self.paths.get_mut(&addr.into()) {
                Some(st) => {
                    st.last_ping = Some(now);
                    true
                }
                None => false,
            },
            SendAddr::Relay(region) => match self.relay.as_mut() {
                Some((home, state)) if *home == region => {
                    state.last_ping = Some(now);
                    true
                }
                _ => false,
            },
        };
        if !path_found {
            // Shouldn't happen. But don't ping a path that's not live for us.
            warn!(%to, ?purpose, "unexpected attempt to ping no longer live path");
            return;
        }

        self.sent_pings.insert(
            tx_id,
            SentPing {
                to,
                at: now,
                purpose,
                resolver,
            },
        );
    }

    /// Send a DISCO call-me-maybe message to the peer.
    ///
    /// This takes care of sending the needed pings beforehand. This ensures that we open
    /// our firewall's port so that when the receiver sends us DISCO pings in response to
    /// our call-me-maybe they will reach us.
    ///
    /// For [`SendCallMeMaybe::IfNoRecent`], **no** paths will be pinged if there already
    /// was a recent call-me-maybe sent.
    #[must_use = "actions must be handled"]
    fn send_call_me_maybe(&mut self, now: Instant, always: SendCallMeMaybe) -> Vec<PingAction> {
        match always {
            SendCallMeMaybe::Always => (),
            SendCallMeMaybe::IfNoRecent => {
                let had_recent_call_me_maybe = self
                    .last_call_me_maybe
                    .is_some_and(|when| now.duration_since(when) < HEARTBEAT_INTERVAL);
                if had_recent_call_me_maybe {
                    trace!("skipping call-me-maybe, still recent");
                    return Vec::new();
                }
            }
        }

        // We send pings regardless of whether we have a relay region, so that a node we
        // only know direct addresses of learns about us.
        let mut msgs = self.send_pings(now);

        if let Some(region) = self.relay_region() {
            debug!(%region, "queue call-me-maybe");
            msgs.push(PingAction::SendCallMeMaybe {
                region,
                dst_node: self.node_id,
            });
            self.last_call_me_maybe = Some(now);
        } else {
            debug!("can not send call-me-maybe, no relay region");
        }

        msgs
    }

    /// Send DISCO Pings to all the paths of this node which have not been pinged recently.
    #[must_use = "actions must be handled"]
    fn send_pings(&mut self, now: Instant) -> Vec<PingAction> {
        // We allocate +1 in case the caller wants to add a call-me-maybe message.
        let mut ping_msgs = Vec::with_capacity(self.paths.len() + 1);

        if let Some((region, state)) = self.relay.as_ref() {
            if state.needs_ping(now) {
                debug!(%region, "relay path needs ping");
                if let Some(msg) = self.start_ping(SendAddr::Relay(*region), DiscoPingPurpose::Discovery) {
                    ping_msgs.push(PingAction::SendPing(msg))
                }
            }
        }
        let mut ping_dsts = String::from("[");
        self.paths
            .iter()
            .filter_map(|(ipp, state)| state.needs_ping(now).then_some(*ipp))
            .filter_map(|ipp| self.start_ping(SendAddr::Udp(ipp.into()), DiscoPingPurpose::Discovery))
            .for_each(|msg| {
                use std::fmt::Write;
                write!(&mut ping_dsts, " {} ", msg.dst).ok();
                ping_msgs.push(PingAction::SendPing(msg));
            });
        ping_dsts.push(']');
        debug!(
            %ping_dsts,
            dst = %self.node_id.fmt_short(),
            paths = %summarize_node_paths(&self.paths, now),
            "sending pings to node",
        );
        self.last_full_ping = Some(now);
        ping_msgs
    }

    /// Pings every path, relay included, on behalf of an explicit ping.
    #[must_use = "pings must be handled"]
    pub(super) fn ping_all(&self) -> Vec<SendPing> {
        let relay = self.relay_region().map(SendAddr::Relay);
        let direct = self.paths.keys().map(|ipp| SendAddr::Udp((*ipp).into()));
        relay
            .into_iter()
            .chain(direct)
            .filter_map(|dst| self.start_ping(dst, DiscoPingPurpose::Explicit))
            .collect()
    }

    /// Merges what the control plane told us about the node.
    ///
    /// New addresses become candidates. Addresses missing from `new_addrs` are only
    /// dropped once we have not heard from them for [`ENDPOINT_TRACKER_LIFETIME`]. A new
    /// disco key resets all path state, as pongs sealed with the old key prove nothing
    /// about the new one.
    ///
    /// Returns the addresses no longer tracked for this node.
    #[must_use = "removed addresses must be unindexed"]
    pub(in crate::magicsock) fn update_from_external_info(
        &mut self,
        new_disco_key: Option<DiscoPublicKey>,
        new_relay_region: Option<RegionId>,
        new_addrs: &BTreeSet<SocketAddr>,
        now: Instant,
        metrics: &Metrics,
    ) -> Vec<IpPort> {
        if new_disco_key != self.disco_key {
            debug!(
                old = ?self.disco_key.map(|k| k.fmt_short().to_string()),
                new = ?new_disco_key.map(|k| k.fmt_short().to_string()),
                "disco key changed"
            );
            self.disco_key = new_disco_key;
            self.reset();
        }

        if self.best_addr.is_empty() {
            // we do not have a direct connection, so changing the relay information may
            // have an effect on our connection status
            if self.relay.is_none() && new_relay_region.is_some() {
                metrics.num_relay_conns_added.inc();
            } else if self.relay.is_some() && new_relay_region.is_none() {
                metrics.num_relay_conns_removed.inc();
            }
        }

        if new_relay_region != self.relay_region() {
            debug!(
                "changing relay region from {:?} to {:?}",
                self.relay_region(),
                new_relay_region
            );
            self.relay = new_relay_region.map(|region| (region, PathState::new(Source::PeerSet, now)));
        }

        for &addr in new_addrs {
            self.paths
                .entry(addr.into())
                .and_modify(|state| state.add_source(Source::PeerSet, now))
                .or_insert_with(|| PathState::new(Source::PeerSet, now));
        }

        let stale: Vec<IpPort> = self
            .paths
            .iter()
            .filter(|(ipp, _)| !new_addrs.contains(&SocketAddr::from(**ipp)))
            .filter(|(_, state)| {
                state
                    .last_seen()
                    .is_none_or(|seen| now.duration_since(seen) > ENDPOINT_TRACKER_LIFETIME)
            })
            .map(|(ipp, _)| *ipp)
            .collect();
        let mut removed = Vec::new();
        for ipp in stale {
            if self.remove_direct_addr(&ipp, now, "not advertised anymore") {
                removed.push(ipp);
            }
        }
        removed.extend(self.prune_direct_addresses(now));

        debug!(new = ?new_addrs, paths = %summarize_node_paths(&self.paths, now), "updated paths from peer set");
        removed
    }

    /// Clears all the node's p2p state, reverting it to a relay-only node.
    pub(super) fn reset(&mut self) {
        self.last_full_ping = None;
        self.last_call_me_maybe = None;
        self.sent_pings.clear();
        self.best_addr.clear(ClearReason::Reset, self.relay.is_some());
        for state in self.paths.values_mut() {
            state.clear();
        }
        if let Some((_, state)) = self.relay.as_mut() {
            state.clear();
        }
    }

    /// Records `addr` as a candidate path, learnt from a ping with `tx_id`.
    ///
    /// Returns `true` if this ping was already recorded, in which case nothing changed.
    pub(in crate::magicsock) fn add_candidate(&mut self, addr: SocketAddr, tx_id: TransactionId, now: Instant) -> bool {
        matches!(self.handle_udp_ping(addr, tx_id, now), PingRole::Duplicate)
    }

    fn handle_udp_ping(&mut self, addr: SocketAddr, tx_id: TransactionId, now: Instant) -> PingRole {
        match self.paths.entry(addr.into()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().handle_ping(tx_id, now),
            Entry::Vacant(vacant) => {
                info!(%addr, "new direct addr for node");
                vacant.insert(PathState::with_ping(tx_id, now));
                PingRole::NewPath
            }
        }
    }

    /// Handle a received Disco Ping.
    ///
    /// - Ensures the path the ping was received on is a known path for this node.
    ///
    /// - If there is no trusted best_addr for this node yet, sends a ping itself to try
    ///   and establish one.
    ///
    /// This is called once we've already verified that we got a valid discovery message
    /// from this node.
    pub(in crate::magicsock) fn handle_ping(&mut self, path: SendAddr, tx_id: TransactionId, now: Instant) -> PingHandled {
        let role = match path {
            SendAddr::Udp(addr) => self.handle_udp_ping(addr, tx_id, now),
            SendAddr::Relay(region) => match self.relay.as_mut() {
                Some((home, state)) if *home == region => state.handle_ping(tx_id, now),
                _ => {
                    // either the node changed relays or we didn't have a relay region for
                    // the node. In both cases, trust the new confirmed region.
                    info!(%region, "new relay region for node");
                    self.relay = Some((region, PathState::with_ping(tx_id, now)));
                    PingRole::NewPath
                }
            },
        };

        let needs_ping_back = if matches!(path, SendAddr::Udp(_))
            && !matches!(role, PingRole::Duplicate)
            && matches!(
                self.best_addr.state(now),
                best_addr::State::Empty | best_addr::State::Outdated(_)
            ) {
            // We also need to send a ping to make this path available to us as well. This
            // is always sent together with a pong. Once both sides have received one pong
            // they both have a best_addr and this ping will stop being sent.
            self.start_ping(path, DiscoPingPurpose::PingBack)
        } else {
            None
        };

        debug!(
            ?role,
            needs_ping_back = ?needs_ping_back.is_some(),
            paths = %summarize_node_paths(&self.paths, now),
            "node handled ping",
        );
        PingHandled {
            role,
            needs_ping_back,
        }
    }

    /// Removes a direct address for this node.
    ///
    /// If this is also the best address, it will be cleared as well.
    pub(super) fn remove_direct_addr(&mut self, ip_port: &IpPort, now: Instant, why: &'static str) -> bool {
        let Some(state) = self.paths.remove(ip_port) else {
            return false;
        };
        match state.last_alive().map(|instant| now.duration_since(instant)) {
            Some(last_alive) => debug!(%ip_port, ?last_alive, why, "pruning address"),
            None => debug!(%ip_port, last_seen=%"never", why, "pruning address"),
        }
        self.best_addr
            .clear_if_equals((*ip_port).into(), ClearReason::Inactive, self.relay.is_some());
        true
    }

    /// Prune inactive paths.
    ///
    /// This trims the list of inactive paths for a node. At most
    /// [`MAX_INACTIVE_DIRECT_ADDRESSES`] are kept. Returns the removed paths.
    pub(super) fn prune_direct_addresses(&mut self, now: Instant) -> Vec<IpPort> {
        // prune candidates are addresses that are not active
        let mut prune_candidates: Vec<_> = self
            .paths
            .iter()
            .filter(|(_ip_port, state)| !state.is_active(now))
            .map(|(ip_port, state)| (*ip_port, state.last_alive()))
            .filter(|(_ipp, last_alive)| match last_alive {
                Some(last_seen) => now.duration_since(*last_seen) > LAST_ALIVE_PRUNE_DURATION,
                None => true,
            })
            .collect();
        let prune_count = prune_candidates
            .len()
            .saturating_sub(MAX_INACTIVE_DIRECT_ADDRESSES);
        if prune_count == 0 {
            // nothing to do, within limits
            return Vec::new();
        }

        // sort leaving the worst addresses first (never contacted) and better ones (most recently
        // used ones) last
        prune_candidates.sort_unstable_by_key(|(_ip_port, last_alive)| *last_alive);
        prune_candidates.truncate(prune_count);
        let mut removed = Vec::with_capacity(prune_count);
        for (ip_port, _last_alive) in prune_candidates {
            if self.remove_direct_addr(&ip_port, now, "inactive") {
                removed.push(ip_port);
            }
        }
        debug!(
            paths = %summarize_node_paths(&self.paths, now),
            "prune addresses: {prune_count} pruned",
        );
        removed
    }

    /// Called when connectivity changes enough that we should question our earlier
    /// assumptions about which paths work.
    ///
    /// The latency history is kept, only the proof that paths currently work is dropped.
    #[instrument("disco", skip_all, fields(node = %self.node_id.fmt_short()))]
    pub(in crate::magicsock) fn note_connectivity_change(&mut self) {
        self.best_addr.clear_trust("connectivity changed");
        for state in self.paths.values_mut() {
            state.clear();
        }
        if let Some((_, state)) = self.relay.as_mut() {
            state.last_ping = None;
        }
    }

    /// Handles a Pong message (a reply to an earlier ping).
    ///
    /// Returns `None` if the pong matches no ping in flight.
    pub(in crate::magicsock) fn handle_pong(&mut self, m: &disco::Pong, src: SendAddr, now: Instant) -> Option<PongInfo> {
        self.expire_pings(now);
        let Some(sent) = self.sent_pings.get(&m.tx_id) else {
            // This is not a pong for a ping we sent, or it came back too late.
            debug!(tx = %data_encoding::HEXLOWER.encode(&m.tx_id), "received pong with unknown transaction id");
            return None;
        };
        let latency = now.duration_since(sent.at);
        let sent = self.record_pong_inner(m.tx_id, src, latency, Some(m.src), now)?;

        debug!(
            tx = %data_encoding::HEXLOWER.encode(&m.tx_id),
            src = %src,
            reported_ping_src = %m.src,
            ping_dst = %sent.to,
            latency = %latency.as_millis(),
            purpose = ?sent.purpose,
            "received pong",
        );
        let info = PongInfo {
            latency,
            path: src,
            reflexive_addr: m.src,
        };
        if let Some(resolver) = sent.resolver {
            resolver.try_send(info.clone()).ok();
        }
        Some(info)
    }

    /// Closes out the ping `tx_id`, adding `rtt` to the samples of the path it was sent on.
    ///
    /// The path may become the new best address. Returns `false` if no such ping was in
    /// flight.
    pub(in crate::magicsock) fn record_pong(
        &mut self,
        tx_id: TransactionId,
        addr: SendAddr,
        rtt: Duration,
        now: Instant,
    ) -> bool {
        self.record_pong_inner(tx_id, addr, rtt, None, now).is_some()
    }

    fn record_pong_inner(
        &mut self,
        tx_id: TransactionId,
        from: SendAddr,
        latency: Duration,
        pong_src: Option<SocketAddr>,
        now: Instant,
    ) -> Option<SentPing> {
        let sp = self.sent_pings.remove(&tx_id)?;
        if from != sp.to {
            debug!(%from, to = %sp.to, "pong from a different path than pinged");
        }
        let reply = PongReply {
            latency,
            pong_at: now,
            from,
            pong_src,
        };
        match sp.to {
            SendAddr::Udp(addr) => match self.paths.get_mut(&addr.into()) {
                None => {
                    // This is no longer a path we care about.
                    debug!(%addr, "ignoring pong: no state for path");
                }
                Some(st) => {
                    st.add_pong_reply(reply);
                    self.update_best_addr(now);
                }
            },
            SendAddr::Relay(region) => match self.relay.as_mut() {
                Some((home, state)) if *home == region => state.add_pong_reply(reply),
                other => {
                    // The region changed while waiting for the response.
                    debug!(stored = ?other.map(|(r, _)| *r), received = %region, "ignoring pong via different relay region");
                }
            },
        }
        Some(sp)
    }

    /// Handles a DISCO CallMeMaybe discovery message.
    ///
    /// The contract for use of this message is that the node has already pinged to us via
    /// UDP, so their stateful firewall should be open. Now we can Ping back and make it
    /// through.
    #[must_use = "actions must be handled"]
    pub(in crate::magicsock) fn handle_call_me_maybe(&mut self, m: disco::CallMeMaybe, now: Instant) -> Vec<PingAction> {
        let mut call_me_maybe_ipps = BTreeSet::new();

        for peer_sockaddr in &m.my_numbers {
            if let IpAddr::V6(ip) = peer_sockaddr.ip() {
                if netwatch::ip::is_unicast_link_local(ip) {
                    // We send these out, but ignore them for now.
                    continue;
                }
            }
            let ipp = IpPort::from(*peer_sockaddr);
            call_me_maybe_ipps.insert(ipp);
            let state = self
                .paths
                .entry(ipp)
                .or_insert_with(|| PathState::new(Source::CallMeMaybe, now));
            state.add_source(Source::CallMeMaybe, now);
            state.call_me_maybe_time = Some(now);
        }

        // Zero out all the last_ping times to force send_pings to send new ones, even if
        // it's been less than 5 seconds ago. Also clear pongs for paths not included in
        // the updated set.
        for (ipp, st) in self.paths.iter_mut() {
            st.last_ping = None;
            if !call_me_maybe_ipps.contains(ipp) && st.recent_pong.is_some() {
                debug!(path = %ipp, "clearing recent pong");
                st.recent_pong = None;
            }
        }
        // Clear trust on our best_addr if it is not included in the updated set.
        if let Some(addr) = self.best_addr.addr() {
            if !call_me_maybe_ipps.contains(&IpPort::from(addr)) {
                self.best_addr.clear_trust("best_addr not in new call-me-maybe");
                self.last_call_me_maybe = None;
            }
        }
        debug!(
            paths = %summarize_node_paths(&self.paths, now),
            "updated node paths from call-me-maybe",
        );
        self.send_pings(now)
    }

    /// Marks this node as having received a UDP payload message.
    pub(super) fn receive_udp(&mut self, addr: IpPort, now: Instant) {
        let Some(state) = self.paths.get_mut(&addr) else {
            // The path was pruned while the packet was dispatched.
            trace!(%addr, "payload on removed path");
            self.last_used = Some(now);
            return;
        };
        state.last_payload_msg = Some(now);
        self.last_used = Some(now);
    }

    /// Marks this node as having received a payload via `region`.
    ///
    /// A node we had no region for learns it from this.
    pub(super) fn receive_relay(&mut self, region: RegionId, now: Instant) {
        match self.relay.as_mut() {
            Some((home, state)) if *home == region => {
                state.last_payload_msg = Some(now);
            }
            Some(_) => {
                // we have a different region. we only update on ping, not on receive.
            }
            None => {
                info!(%region, "learnt relay region for node");
                self.relay = Some((region, PathState::with_last_payload(now)));
            }
        }
        self.last_used = Some(now);
    }

    pub(super) fn last_ping(&self, addr: &SendAddr) -> Option<Instant> {
        match addr {
            SendAddr::Udp(addr) => self.paths.get(&(*addr).into()).and_then(|ep| ep.last_ping),
            SendAddr::Relay(region) => self
                .relay
                .as_ref()
                .filter(|(home, _state)| home == region)
                .and_then(|(_home, state)| state.last_ping),
        }
    }

    /// Checks if this node is currently actively being used.
    pub(super) fn is_active(&self, now: Instant) -> bool {
        self.last_used
            .is_some_and(|last_active| now.duration_since(last_active) <= SESSION_ACTIVE_TIMEOUT)
    }

    /// Send a heartbeat to the node to keep the connection alive, or trigger a full ping
    /// if necessary.
    #[instrument("stayin_alive", skip_all, fields(node = %self.node_id.fmt_short()))]
    pub(super) fn stayin_alive(&mut self, now: Instant) -> Vec<PingAction> {
        self.expire_pings(now);
        if !self.is_active(now) {
            trace!("skipping stayin alive: session is inactive");
            return Vec::new();
        }

        // If we do not have an optimal addr, send pings to all known places.
        if self.want_call_me_maybe(now) {
            debug!("sending a call-me-maybe");
            return self.send_call_me_maybe(now, SendCallMeMaybe::Always);
        }

        // Send heartbeat ping to keep the current addr going as long as we need it.
        if let Some(udp_addr) = self.best_addr.addr() {
            let elapsed = self.last_ping(&SendAddr::Udp(udp_addr)).map(|l| now - l);
            // Send a ping if the last ping is older than 2 seconds and the trust is about
            // to run out.
            let needs_ping = match elapsed {
                Some(e) => {
                    e >= STAYIN_ALIVE_MIN_ELAPSED
                        && self
                            .best_addr
                            .trust_expires_within(now, STAYIN_ALIVE_MIN_ELAPSED)
                }
                None => false,
            };

            if needs_ping {
                debug!(
                    dst = %udp_addr,
                    since_last_ping = ?elapsed,
                    "send stayin alive ping",
                );
                if let Some(msg) = self.start_ping(SendAddr::Udp(udp_addr), DiscoPingPurpose::StayinAlive) {
                    return vec![PingAction::SendPing(msg)];
                }
            }
        }

        Vec::new()
    }

    /// Returns the addresses on which a payload should be sent right now, together with
    /// the disco messages needed to improve on them.
    ///
    /// This is in the hot path of sending.
    pub(in crate::magicsock) fn get_send_addrs(
        &mut self,
        now: Instant,
        have_ipv6: bool,
        metrics: &Metrics,
    ) -> (SendChoice, Vec<PingAction>) {
        self.last_used = Some(now);
        let choice = self.choose_send_addr(now, have_ipv6);
        self.set_conn_type(&choice, metrics);

        let ping_msgs = if self.want_call_me_maybe(now) {
            self.send_call_me_maybe(now, SendCallMeMaybe::IfNoRecent)
        } else {
            Vec::new()
        };
        trace!(
            udp_addr = ?choice.udp_addr,
            relay = ?choice.relay,
            must_ping = choice.must_ping,
            pings = %ping_msgs.len(),
            "found send address",
        );
        (choice, ping_msgs)
    }

    fn set_conn_type(&mut self, choice: &SendChoice, metrics: &Metrics) {
        let typ = match (choice.udp_addr, choice.relay) {
            (Some(addr), Some(region)) => ConnectionType::Mixed(addr, region),
            (Some(addr), None) => ConnectionType::Direct(addr),
            (None, Some(region)) => ConnectionType::Relay(region),
            (None, None) => ConnectionType::None,
        };
        if typ == self.conn_type {
            return;
        }
        let prev = std::mem::replace(&mut self.conn_type, typ);
        info!(node = %self.node_id.fmt_short(), %prev, new = %self.conn_type, "new connection type");
        match (prev, &self.conn_type) {
            (ConnectionType::Relay(_) | ConnectionType::Mixed(..), ConnectionType::Direct(_)) => {
                metrics.num_direct_conns_added.inc();
                metrics.num_relay_conns_removed.inc();
            }
            (ConnectionType::Direct(_), ConnectionType::Relay(_) | ConnectionType::Mixed(..)) => {
                metrics.num_direct_conns_removed.inc();
                metrics.num_relay_conns_added.inc();
            }
            (ConnectionType::None, ConnectionType::Direct(_)) => {
                metrics.num_direct_conns_added.inc();
            }
            (ConnectionType::Direct(_), ConnectionType::None) => {
                metrics.num_direct_conns_removed.inc();
            }
            (ConnectionType::None, ConnectionType::Relay(_) | ConnectionType::Mixed(..)) => {
                metrics.num_relay_conns_added.inc();
            }
            (ConnectionType::Relay(_) | ConnectionType::Mixed(..), ConnectionType::None) => {
                metrics.num_relay_conns_removed.inc();
            }
            _ => (),
        }
    }

    /// Get the direct addresses for this node.
    pub(super) fn direct_addresses(&self) -> impl Iterator<Item = IpPort> + '_ {
        self.paths.keys().copied()
    }

    /// Returns info about this node.
    pub(super) fn info(&self, now: Instant) -> RemoteInfo {
        use best_addr::State::*;
        let (conn_type, latency) = match (self.best_addr.state(now), self.relay.as_ref()) {
            (Valid(addr), _) | (Outdated(addr), None) => {
                (ConnectionType::Direct(addr.addr), Some(addr.latency))
            }
            (Outdated(addr), Some((region, relay_state))) => {
                let latency = relay_state
                    .latency()
                    .map(|l| l.min(addr.latency))
                    .unwrap_or(addr.latency);
                (ConnectionType::Mixed(addr.addr, *region), Some(latency))
            }
            (Empty, Some((region, relay_state))) => {
                (ConnectionType::Relay(*region), relay_state.latency())
            }
            (Empty, None) => (ConnectionType::None, None),
        };
        let addrs = self
            .paths
            .iter()
            .map(|(addr, state)| DirectAddrInfo {
                addr: SocketAddr::from(*addr),
                latency: state.latency(),
                last_pong: state
                    .recent_pong
                    .as_ref()
                    .map(|pong| now.duration_since(pong.pong_at)),
                last_control: state.last_control_msg(now),
                last_payload: state
                    .last_payload_msg
                    .map(|instant| now.duration_since(instant)),
                sources: {
                    let mut sources: Vec<_> = state
                        .sources
                        .iter()
                        .map(|(source, instant)| (*source, now.duration_since(*instant)))
                        .collect();
                    sources.sort();
                    sources
                },
            })
            .collect();

        RemoteInfo {
            node_id: self.node_id,
            disco_key: self.disco_key,
            relay_region: self.relay_region(),
            best_addr: self.best_addr.addr(),
            addrs,
            conn_type,
            latency,
            last_used: self.last_used.map(|instant| now.duration_since(instant)),
            last_received: None,
        }
    }
}

/// Whether to send a call-me-maybe message after sending pings to all known paths.
///
/// `IfNoRecent` will only send a call-me-maybe if no previous one was sent in the last
/// [`HEARTBEAT_INTERVAL`].
#[derive(Debug)]
enum SendCallMeMaybe {
    Always,
    IfNoRecent,
}

/// The reason why a discovery ping message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoPingPurpose {
    /// The purpose of a ping was to see if a path was valid.
    Discovery,
    /// Ping to ensure the current route is still valid.
    StayinAlive,
    /// A ping was received and no direct connection exists yet.
    PingBack,
    /// Requested through [`MagicSock::ping`](crate::magicsock::MagicSock::ping).
    Explicit,
}

/// Information about a direct address of a remote node.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectAddrInfo {
    /// The UDP address.
    pub addr: SocketAddr,
    /// The latency used for path selection, if the path has a recent pong.
    pub latency: Option<Duration>,
    /// Elapsed time since the last pong on this path.
    pub last_pong: Option<Duration>,
    /// Last control message received about this address, and how long ago.
    pub last_control: Option<(Duration, ControlMsg)>,
    /// Elapsed time since the last payload message was received on this path.
    pub last_payload: Option<Duration>,
    /// How we learned about this address, and how long ago, sorted by source.
    pub sources: Vec<(Source, Duration)>,
}

/// Details about a remote node known to the manager.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// The identity of the node.
    pub node_id: PublicKey,
    /// The disco key of the node, `None` for relay only nodes.
    pub disco_key: Option<DiscoPublicKey>,
    /// The relay region of the node, if known.
    pub relay_region: Option<RegionId>,
    /// The direct address currently preferred for sending, trusted or not.
    pub best_addr: Option<SocketAddr>,
    /// The direct addresses at which this node might be reachable.
    pub addrs: Vec<DirectAddrInfo>,
    /// The type of connection we have to the node, either direct or over relay.
    pub conn_type: ConnectionType,
    /// The latency of `conn_type`.
    pub latency: Option<Duration>,
    /// Elapsed time since we last sent to or received from the node.
    pub last_used: Option<Duration>,
    /// Elapsed time since we last received payload from the node.
    pub last_received: Option<Duration>,
}

/// The type of connection we have to the node.
#[derive(derive_more::Display, Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Direct UDP connection
    #[display("direct({_0})")]
    Direct(SocketAddr),
    /// Relay connection over relay
    #[display("relay({_0})")]
    Relay(RegionId),
    /// Both a UDP and a relay connection are used.
    ///
    /// This is the case if we do have a UDP address, but are missing a recent confirmation that
    /// the address works.
    #[display("mixed(udp: {_0}, relay: {_1})")]
    Mixed(SocketAddr, RegionId),
    /// We have no verified connection to this node
    #[default]
    #[display("none")]
    None,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use meshsock_base::{DiscoSecretKey, SecretKey};
    use proptest::prelude::*;

    use super::*;
    use crate::defaults::timeouts::TRUST_UDP_ADDR_DURATION;

    fn node_id() -> PublicKey {
        SecretKey::generate(&mut rand::rngs::OsRng).public()
    }

    fn new_node(relay_region: Option<RegionId>, disco: bool, now: Instant) -> NodeState {
        NodeState::new(
            Options {
                node_id: node_id(),
                disco_key: disco.then(|| DiscoSecretKey::generate().public()),
                relay_region,
                active: true,
            },
            now,
        )
    }

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, last)), port)
    }

    /// Adds `addr` as a path and sends a ping to it, returning the transaction id.
    fn ping(state: &mut NodeState, addr: SocketAddr, now: Instant) -> TransactionId {
        state.paths.entry(addr.into()).or_insert_with(|| PathState::new(Source::PeerSet, now));
        let tx_id = TransactionId::default();
        state.ping_sent(SendAddr::Udp(addr), tx_id, DiscoPingPurpose::Discovery, None, now);
        tx_id
    }

    #[test]
    fn test_relay_only_never_pings() {
        let now = Instant::now();
        let metrics = Metrics::default();
        let mut state = new_node(Some(1), false, now);
        let _removed = state.update_from_external_info(
            None,
            Some(1),
            &BTreeSet::from([addr(1, 1000)]),
            now,
            &metrics,
        );

        let (choice, pings) = state.get_send_addrs(now, true, &metrics);
        assert_eq!(
            choice,
            SendChoice {
                udp_addr: None,
                relay: Some(1),
                must_ping: false
            }
        );
        assert!(pings.is_empty());
        assert!(state.stayin_alive(now).is_empty());
        assert!(state.ping_all().is_empty());
    }

    #[test]
    fn test_add_candidate_dedup() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = TransactionId::default();

        assert!(!state.add_candidate(a, tx, now));
        let info = state.info(now);
        assert!(state.add_candidate(a, tx, now + Duration::from_millis(1)));
        assert_eq!(state.info(now), info);
        assert_eq!(state.paths.len(), 1);

        assert!(!state.add_candidate(a, TransactionId::default(), now));
    }

    #[test]
    fn test_pong_makes_direct() {
        let now = Instant::now();
        let metrics = Metrics::default();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);

        let (choice, _) = state.get_send_addrs(now, true, &metrics);
        assert_eq!(choice.udp_addr, None);
        assert_eq!(choice.relay, Some(1));
        assert!(choice.must_ping);

        let later = now + Duration::from_millis(20);
        let pong = disco::Pong {
            tx_id: tx,
            src: "1.2.3.4:5".parse().unwrap(),
        };
        let info = state.handle_pong(&pong, SendAddr::Udp(a), later).unwrap();
        assert_eq!(info.latency, Duration::from_millis(20));
        assert_eq!(info.reflexive_addr, pong.src);
        // A second delivery of the same pong is stale.
        assert!(state.handle_pong(&pong, SendAddr::Udp(a), later).is_none());

        let (choice, _) = state.get_send_addrs(later, true, &metrics);
        assert_eq!(
            choice,
            SendChoice {
                udp_addr: Some(a),
                relay: None,
                must_ping: false
            }
        );
        assert_eq!(metrics.num_direct_conns_added.get(), 1);

        // Trust runs out without new pongs.
        let (choice, _) = state.get_send_addrs(later + TRUST_UDP_ADDR_DURATION, true, &metrics);
        assert_eq!(choice.udp_addr, Some(a));
        assert_eq!(choice.relay, Some(1));
        assert!(choice.must_ping);
    }

    #[test]
    fn test_connectivity_change_keeps_history() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(10), now));
        assert!(!state.choose_send_addr(now, true).must_ping);

        state.note_connectivity_change();
        let choice = state.choose_send_addr(now, true);
        assert!(choice.must_ping);
        assert_eq!(choice.udp_addr, Some(a));
        assert_eq!(state.paths[&IpPort::from(a)].num_samples(), 1);
    }

    #[test]
    fn test_ping_timeout_clears_best_addr() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(10), now));
        assert_eq!(state.best_addr.addr(), Some(a));

        let later = now + Duration::from_secs(1);
        let _lost = ping(&mut state, a, later);
        state.expire_pings(later + PING_TIMEOUT - Duration::from_millis(1));
        assert_eq!(state.best_addr.addr(), Some(a));
        state.expire_pings(later + PING_TIMEOUT);
        assert!(state.best_addr.is_empty());
        assert!(state.sent_pings.is_empty());
        assert!(state.paths[&IpPort::from(a)].needs_ping(later + PING_TIMEOUT));
    }

    #[test]
    fn test_stale_path_gives_way_to_fresh_one() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let stale = addr(1, 1000);
        let fresh = addr(2, 2000);
        let tx = ping(&mut state, stale, now);
        assert!(state.record_pong(tx, SendAddr::Udp(stale), Duration::from_millis(2), now));
        assert_eq!(state.best_addr.addr(), Some(stale));

        // much later only the slower path answers
        let later = now + Duration::from_secs(60);
        let tx = ping(&mut state, fresh, later);
        assert!(state.record_pong(tx, SendAddr::Udp(fresh), Duration::from_millis(20), later));
        assert_eq!(
            state.choose_send_addr(later, true),
            SendChoice {
                udp_addr: Some(fresh),
                relay: None,
                must_ping: false
            }
        );
    }

    #[test]
    fn test_ping_timeout_does_not_reinstall_path() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(2), now));

        let later = now + Duration::from_secs(1);
        let _lost = ping(&mut state, a, later);
        let choice = state.choose_send_addr(later + PING_TIMEOUT, true);
        assert!(state.best_addr.is_empty());
        assert_eq!(choice.udp_addr, None);
        assert_eq!(choice.relay, Some(1));
        assert!(choice.must_ping);
    }

    #[test]
    fn test_call_me_maybe() {
        let now = Instant::now();
        let mut state = new_node(Some(7), true, now);
        let a = addr(1, 1000);
        let link_local: SocketAddr = "[fe80::1]:1000".parse().unwrap();
        let actions = state.handle_call_me_maybe(
            disco::CallMeMaybe {
                my_numbers: vec![a, link_local],
            },
            now,
        );
        assert_eq!(state.direct_addresses().collect::<Vec<_>>(), vec![IpPort::from(a)]);
        // relay and the new path get pinged
        let dsts: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                PingAction::SendPing(p) => Some(p.dst),
                PingAction::SendCallMeMaybe { .. } => None,
            })
            .collect();
        assert_eq!(dsts, vec![SendAddr::Relay(7), SendAddr::Udp(a)]);
    }

    #[test]
    fn test_update_from_external_info() {
        let now = Instant::now();
        let metrics = Metrics::default();
        let mut state = new_node(None, true, now);
        let a = addr(1, 1000);
        let b = addr(2, 1000);

        let removed = state.update_from_external_info(state.disco_key(), Some(3), &BTreeSet::from([a, b]), now, &metrics);
        assert!(removed.is_empty());
        assert_eq!(state.relay_region(), Some(3));

        // b is no longer advertised, but recently seen: kept.
        let removed = state.update_from_external_info(state.disco_key(), Some(3), &BTreeSet::from([a]), now, &metrics);
        assert!(removed.is_empty());
        assert_eq!(state.paths.len(), 2);

        let later = now + ENDPOINT_TRACKER_LIFETIME + Duration::from_secs(1);
        let removed = state.update_from_external_info(state.disco_key(), Some(3), &BTreeSet::from([a]), later, &metrics);
        assert_eq!(removed, vec![IpPort::from(b)]);

        // A new disco key forgets what we learnt with the old one.
        let tx = ping(&mut state, a, later);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(10), later));
        let new_key = Some(DiscoSecretKey::generate().public());
        let _removed = state.update_from_external_info(new_key, Some(3), &BTreeSet::from([a]), later, &metrics);
        assert!(state.best_addr.is_empty());
        assert_eq!(state.disco_key(), new_key);
    }

    #[test]
    fn test_prune_direct_addresses() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        for i in 0..(MAX_INACTIVE_DIRECT_ADDRESSES as u16 + 5) {
            state
                .paths
                .insert(addr(1, 1000 + i).into(), PathState::new(Source::PeerSet, now));
        }
        // an active one is never pruned
        let active = addr(9, 9);
        state
            .paths
            .insert(active.into(), PathState::with_last_payload(now));

        let removed = state.prune_direct_addresses(now);
        assert_eq!(removed.len(), 5);
        assert_eq!(state.paths.len(), MAX_INACTIVE_DIRECT_ADDRESSES + 1);
        assert!(state.paths.contains_key(&IpPort::from(active)));
    }

    #[test]
    fn test_stayin_alive() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(1), now));
        state.last_full_ping = Some(now);

        assert!(state.stayin_alive(now).is_empty());
        // still plenty of trust left
        assert!(state.stayin_alive(now + STAYIN_ALIVE_MIN_ELAPSED).is_empty());
        let later = now + TRUST_UDP_ADDR_DURATION - Duration::from_secs(1);
        let actions = state.stayin_alive(later);
        assert!(matches!(
            &actions[..],
            [PingAction::SendPing(SendPing { dst: SendAddr::Udp(dst), purpose: DiscoPingPurpose::StayinAlive, .. })] if *dst == a
        ));

        // inactive nodes are left alone
        let much_later = now + SESSION_ACTIVE_TIMEOUT + Duration::from_secs(1);
        assert!(state.stayin_alive(much_later).is_empty());
    }

    #[test]
    fn test_info() {
        let now = Instant::now();
        let mut state = new_node(Some(1), true, now);
        let a = addr(1, 1000);
        let tx = ping(&mut state, a, now);
        assert!(state.record_pong(tx, SendAddr::Udp(a), Duration::from_millis(10), now));

        let later = now + Duration::from_secs(3);
        let info = state.info(later);
        assert_eq!(info.conn_type, ConnectionType::Direct(a));
        assert_eq!(info.latency, Some(Duration::from_millis(10)));
        assert_eq!(info.best_addr, Some(a));
        assert_eq!(info.addrs.len(), 1);
        assert_eq!(info.addrs[0].last_pong, Some(Duration::from_secs(3)));
        assert_eq!(
            info.addrs[0].last_control,
            Some((Duration::from_secs(3), ControlMsg::Pong))
        );

        let json = serde_json::to_string(&info).unwrap();
        let back: RemoteInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);

        state.best_addr = BestAddr::from_parts(a, Duration::from_millis(10), now, now);
        assert_eq!(state.info(later).conn_type, ConnectionType::Mixed(a, 1));
    }

    fn arb_samples() -> impl Strategy<Value = Vec<(usize, u64)>> {
        // (candidate index, latency in ms), at most a history's worth per candidate
        proptest::collection::vec((0usize..4, 1u64..120), 1..16).prop_filter(
            "history per path is bounded",
            |samples| {
                (0..4).all(|i| samples.iter().filter(|(c, _)| *c == i).count() <= crate::defaults::PONG_HISTORY)
            },
        )
    }

    proptest! {
        /// Feeding the same round trip samples in any order ends with the same best address.
        #[test]
        fn best_addr_ignores_sample_order(samples in arb_samples(), seed in any::<u64>()) {
            use rand::{SeedableRng, seq::SliceRandom};

            let addrs = [
                addr(1, 1000),
                "10.0.0.1:1000".parse().unwrap(),
                "[2001:db8::1]:1000".parse().unwrap(),
                "192.168.0.1:1000".parse().unwrap(),
            ];
            let run = |samples: &[(usize, u64)]| {
                let now = Instant::now();
                let mut state = new_node(Some(1), true, now);
                let txs: Vec<_> = samples.iter().map(|(c, _)| ping(&mut state, addrs[*c], now)).collect();
                for ((c, ms), tx) in samples.iter().zip(txs) {
                    assert!(state.record_pong(tx, SendAddr::Udp(addrs[*c]), Duration::from_millis(*ms), now));
                }
                state.best_addr.addr()
            };

            let want = run(&samples);
            prop_assert!(want.is_some());
            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
            let mut shuffled = samples.clone();
            shuffled.shuffle(&mut rng);
            prop_assert_eq!(run(&shuffled), want);
        }
    }
}
