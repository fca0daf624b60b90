use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use meshsock_base::{DiscoPublicKey, PublicKey};
use meshsock_relay::RegionId;
use n0_future::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use self::node_state::{NodeState, Options, PingHandled};
use super::metrics::Metrics;
use crate::{
    defaults::timeouts::RECV_ACTIVITY_INTERVAL,
    disco::{CallMeMaybe, Pong, SendAddr},
    stun::TransactionId,
};

mod best_addr;
mod node_state;
mod path_state;

pub use node_state::{ConnectionType, DirectAddrInfo, PongInfo, RemoteInfo, SendChoice};
pub(super) use node_state::{DiscoPingPurpose, PingAction, SendPing};
pub(super) use path_state::PingRole;
pub use path_state::{ControlMsg, Source};

/// Map of the [`NodeState`] information for all the known nodes.
///
/// The nodes can be looked up by:
///
/// - The node's public key, aka `PublicKey` or "node_key".
///
/// - A public socket address on which they are reachable on the internet, known as ip-port.
///   These come and go as the node moves around on the internet. Each ip-port belongs to
///   exactly one node.
///
/// - The node's disco key. During key rotation several nodes may share one.
///
/// All three indices are only changed while holding the map lock. Changing the set of
/// direct addresses of a node also requires this lock, so the ip-port index always matches
/// the paths of the nodes. Once a [`NodeEntry`] is looked up, operations that leave the
/// addresses alone only lock that node, so independent nodes do not contend.
///
/// Lock order is map, then a single node. Two node locks are never held at once.
#[derive(Default, Debug)]
pub(super) struct NodeMap {
    inner: Mutex<NodeMapInner>,
}

#[derive(Default, Debug)]
struct NodeMapInner {
    by_node_key: HashMap<PublicKey, Arc<NodeEntry>>,
    by_ip_port: HashMap<IpPort, Arc<NodeEntry>>,
    by_disco_key: HashMap<DiscoPublicKey, BTreeSet<PublicKey>>,
}

/// A node in the [`NodeMap`].
#[derive(Debug)]
pub(super) struct NodeEntry {
    state: Mutex<NodeState>,
    created: Instant,
    /// Millis since `created` plus one of the last received payload, `0` for never.
    last_recv: AtomicU64,
    /// Same encoding, the last time the recv activity callback fired.
    last_activity_note: AtomicU64,
}

/// What the control plane tells us about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The identity of the peer.
    pub node_id: PublicKey,
    /// The peer's disco key, `None` makes the peer relay only.
    pub disco_key: Option<DiscoPublicKey>,
    /// The peer's home relay region.
    pub relay_region: Option<RegionId>,
    /// Direct addresses the peer can probably be reached at.
    pub direct_addrs: BTreeSet<SocketAddr>,
}

impl PeerInfo {
    /// A peer that is only reachable through `relay_region`.
    pub fn relay_only(node_id: PublicKey, relay_region: RegionId) -> Self {
        Self {
            node_id,
            disco_key: None,
            relay_region: Some(relay_region),
            direct_addrs: Default::default(),
        }
    }
}

/// The nodes owning a disco key, as far as we can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DiscoOwner {
    Unique(PublicKey),
    /// Several nodes share the key and nothing tells them apart.
    Ambiguous,
    Unknown,
}

impl NodeEntry {
    fn new(state: NodeState, now: Instant) -> Self {
        Self {
            state: Mutex::new(state),
            created: now,
            last_recv: AtomicU64::new(0),
            last_activity_note: AtomicU64::new(0),
        }
    }

    fn encode(&self, now: Instant) -> u64 {
        let ms = now.saturating_duration_since(self.created).as_millis();
        u64::try_from(ms).unwrap_or(u64::MAX - 1) + 1
    }

    /// Records payload from this node. Returns `true` if the recv activity callback is due.
    ///
    /// This does not take any lock.
    fn note_recv(&self, now: Instant) -> bool {
        let now_ms = self.encode(now);
        self.last_recv.fetch_max(now_ms, Ordering::Relaxed);

        let interval = RECV_ACTIVITY_INTERVAL.as_millis() as u64;
        let prev = self.last_activity_note.load(Ordering::Relaxed);
        if prev != 0 && now_ms.saturating_sub(prev) < interval {
            return false;
        }
        self.last_activity_note
            .compare_exchange(prev, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn last_recv(&self, now: Instant) -> Option<Duration> {
        match self.last_recv.load(Ordering::Relaxed) {
            0 => None,
            ms => {
                let at = self.created + Duration::from_millis(ms - 1);
                Some(now.saturating_duration_since(at))
            }
        }
    }
}

impl NodeMap {
    pub(super) fn node_count(&self) -> usize {
        self.inner.lock().expect("poisoned").by_node_key.len()
    }

    pub(super) fn contains(&self, node_id: &PublicKey) -> bool {
        self.inner
            .lock()
            .expect("poisoned")
            .by_node_key
            .contains_key(node_id)
    }

    /// Inserts a node, or merges `peer` into the node we already have.
    pub(super) fn upsert(&self, peer: PeerInfo, now: Instant, metrics: &Metrics) {
        self.inner.lock().expect("poisoned").upsert(peer, now, metrics)
    }

    /// Removes a node and all its index entries.
    pub(super) fn delete(&self, node_id: &PublicKey) -> bool {
        self.inner.lock().expect("poisoned").delete(node_id)
    }

    /// Moves the node `old` to the key `new`, keeping all its path state.
    pub(super) fn rename(&self, old: &PublicKey, new: PublicKey) -> bool {
        self.inner.lock().expect("poisoned").rename(old, new)
    }

    /// Replaces the set of known nodes.
    ///
    /// A removed node whose disco key is shared by exactly one added node is taken to have
    /// rotated its node key, and keeps its paths under the new key.
    pub(super) fn set_peers(&self, peers: Vec<PeerInfo>, now: Instant, metrics: &Metrics) {
        let mut inner = self.inner.lock().expect("poisoned");
        let wanted: BTreeSet<PublicKey> = peers.iter().map(|p| p.node_id).collect();
        let mut removed: Vec<PublicKey> = inner
            .by_node_key
            .keys()
            .filter(|k| !wanted.contains(*k))
            .copied()
            .collect();

        for peer in &peers {
            if inner.by_node_key.contains_key(&peer.node_id) {
                continue;
            }
            let Some(disco_key) = peer.disco_key else {
                continue;
            };
            let same_disco: Vec<PublicKey> = removed
                .iter()
                .filter(|k| {
                    inner
                        .by_disco_key
                        .get(&disco_key)
                        .is_some_and(|set| set.contains(*k))
                })
                .copied()
                .collect();
            if let [old] = same_disco[..] {
                info!(old = %old.fmt_short(), new = %peer.node_id.fmt_short(), "node key rotated");
                inner.rename(&old, peer.node_id);
                removed.retain(|k| *k != old);
            }
        }

        for node_id in removed {
            inner.delete(&node_id);
        }
        for peer in peers {
            inner.upsert(peer, now, metrics);
        }
    }

    pub(super) fn get(&self, node_id: &PublicKey) -> Option<Arc<NodeEntry>> {
        self.inner
            .lock()
            .expect("poisoned")
            .by_node_key
            .get(node_id)
            .cloned()
    }

    /// The disco keys of all known nodes.
    pub(super) fn disco_keys(&self) -> HashSet<DiscoPublicKey> {
        let inner = self.inner.lock().expect("poisoned");
        inner.by_disco_key.keys().copied().collect()
    }

    /// Finds the node owning the disco key `disco`.
    ///
    /// `node_key` is the key a ping claims to come from, `udp_src` the address a disco
    /// message arrived from. Either picks one node out of several sharing a disco key.
    pub(super) fn disco_owner(
        &self,
        disco: &DiscoPublicKey,
        node_key: Option<&PublicKey>,
        udp_src: Option<SocketAddr>,
    ) -> DiscoOwner {
        let inner = self.inner.lock().expect("poisoned");
        let Some(owners) = inner.by_disco_key.get(disco) else {
            return DiscoOwner::Unknown;
        };
        if let Some(node_key) = node_key {
            if owners.contains(node_key) {
                return DiscoOwner::Unique(*node_key);
            }
        }
        if let [owner] = owners.iter().collect::<Vec<_>>()[..] {
            return DiscoOwner::Unique(*owner);
        }
        if let Some(entry) = udp_src.and_then(|src| inner.by_ip_port.get(&IpPort::from(src))) {
            let node_id = *entry.state.lock().expect("poisoned").node_id();
            if owners.contains(&node_id) {
                return DiscoOwner::Unique(node_id);
            }
        }
        DiscoOwner::Ambiguous
    }

    /// The disco key of `node_id`, `None` for unknown or relay only nodes.
    pub(super) fn disco_key(&self, node_id: &PublicKey) -> Option<DiscoPublicKey> {
        self.get(node_id)?.state.lock().expect("poisoned").disco_key()
    }

    /// Whether `node_id` is known and uses the disco key `disco`.
    pub(super) fn has_disco_key(&self, node_id: &PublicKey, disco: &DiscoPublicKey) -> bool {
        self.inner
            .lock()
            .expect("poisoned")
            .by_disco_key
            .get(disco)
            .is_some_and(|owners| owners.contains(node_id))
    }

    /// Attributes a payload received from `src` to its node.
    ///
    /// Returns the node and whether the recv activity callback is due.
    pub(super) fn receive_udp(&self, src: SocketAddr, now: Instant) -> Option<(PublicKey, bool)> {
        let ipp = IpPort::from(src);
        let entry = self
            .inner
            .lock()
            .expect("poisoned")
            .by_ip_port
            .get(&ipp)
            .cloned()?;
        let note_activity = entry.note_recv(now);
        let mut state = entry.state.lock().expect("poisoned");
        state.receive_udp(ipp, now);
        Some((*state.node_id(), note_activity))
    }

    /// Marks a payload received from `src` over the relay `region`.
    ///
    /// Returns whether the recv activity callback is due, `None` for unknown nodes.
    pub(super) fn receive_relay(&self, region: RegionId, src: &PublicKey, now: Instant) -> Option<bool> {
        let entry = self.get(src)?;
        let note_activity = entry.note_recv(now);
        entry
            .state
            .lock()
            .expect("poisoned")
            .receive_relay(region, now);
        Some(note_activity)
    }

    pub(super) fn handle_ping(
        &self,
        node_id: &PublicKey,
        path: SendAddr,
        tx_id: TransactionId,
        now: Instant,
    ) -> Option<PingHandled> {
        let mut inner = self.inner.lock().expect("poisoned");
        let entry = inner.by_node_key.get(node_id).cloned()?;
        let handled = entry
            .state
            .lock()
            .expect("poisoned")
            .handle_ping(path, tx_id, now);
        if let SendAddr::Udp(addr) = path {
            inner.index_addr(IpPort::from(addr), &entry, now);
        }
        Some(handled)
    }

    pub(super) fn handle_pong(
        &self,
        node_id: &PublicKey,
        pong: &Pong,
        src: SendAddr,
        now: Instant,
    ) -> Option<PongInfo> {
        let entry = self.get(node_id)?;
        let mut state = entry.state.lock().expect("poisoned");
        state.handle_pong(pong, src, now)
    }

    pub(super) fn handle_call_me_maybe(
        &self,
        node_id: &PublicKey,
        cm: CallMeMaybe,
        now: Instant,
    ) -> Vec<PingAction> {
        let mut inner = self.inner.lock().expect("poisoned");
        let Some(entry) = inner.by_node_key.get(node_id).cloned() else {
            debug!(node = %node_id.fmt_short(), "received call-me-maybe from unknown node");
            return Vec::new();
        };
        let (actions, addrs) = {
            let mut state = entry.state.lock().expect("poisoned");
            let actions = state.handle_call_me_maybe(cm, now);
            (actions, state.direct_addresses().collect::<Vec<_>>())
        };
        for ipp in addrs {
            inner.index_addr(ipp, &entry, now);
        }
        actions
    }

    /// Picks the addresses for a payload to `node_id`.
    ///
    /// This is the hot path of sending, only the node itself is locked for the decision.
    pub(super) fn get_send_addrs(
        &self,
        node_id: &PublicKey,
        now: Instant,
        have_ipv6: bool,
        metrics: &Metrics,
    ) -> Option<(SendChoice, Vec<PingAction>)> {
        let entry = self.get(node_id)?;
        let mut state = entry.state.lock().expect("poisoned");
        Some(state.get_send_addrs(now, have_ipv6, metrics))
    }

    /// The send decision for `node_id`.
    ///
    /// Sends no pings, but expires timed out ones and may re-select the best address.
    pub(super) fn choose_send_addr(
        &self,
        node_id: &PublicKey,
        now: Instant,
        have_ipv6: bool,
    ) -> Option<SendChoice> {
        let entry = self.get(node_id)?;
        let mut state = entry.state.lock().expect("poisoned");
        Some(state.choose_send_addr(now, have_ipv6))
    }

    pub(super) fn notify_ping_sent(
        &self,
        node_id: &PublicKey,
        dst: SendAddr,
        tx_id: TransactionId,
        purpose: DiscoPingPurpose,
        resolver: Option<mpsc::Sender<PongInfo>>,
        now: Instant,
    ) {
        if let Some(entry) = self.get(node_id) {
            let mut state = entry.state.lock().expect("poisoned");
            state.ping_sent(dst, tx_id, purpose, resolver, now);
        }
    }

    /// Pings for every path of `node_id`, `None` if the node is unknown.
    pub(super) fn ping_all(&self, node_id: &PublicKey) -> Option<Vec<SendPing>> {
        let entry = self.get(node_id)?;
        let state = entry.state.lock().expect("poisoned");
        Some(state.ping_all())
    }

    /// Drops the trust in all direct paths, see [`NodeState::note_connectivity_change`].
    pub(super) fn note_connectivity_change(&self) {
        let entries: Vec<_> = self
            .inner
            .lock()
            .expect("poisoned")
            .by_node_key
            .values()
            .cloned()
            .collect();
        for entry in entries {
            entry
                .state
                .lock()
                .expect("poisoned")
                .note_connectivity_change();
        }
    }

    /// Runs the heartbeat of all nodes, pruning their inactive direct addresses.
    pub(super) fn nodes_stayin_alive(&self, now: Instant) -> Vec<PingAction> {
        let mut inner = self.inner.lock().expect("poisoned");
        let entries: Vec<_> = inner.by_node_key.values().cloned().collect();
        let mut msgs = Vec::new();
        for entry in entries {
            let pruned = {
                let mut state = entry.state.lock().expect("poisoned");
                msgs.extend(state.stayin_alive(now));
                state.prune_direct_addresses(now)
            };
            for ipp in pruned {
                inner.unindex_addr(&ipp, &entry);
            }
        }
        msgs
    }

    pub(super) fn remote_infos(&self, now: Instant) -> Vec<RemoteInfo> {
        let entries: Vec<_> = self
            .inner
            .lock()
            .expect("poisoned")
            .by_node_key
            .values()
            .cloned()
            .collect();
        let mut infos: Vec<RemoteInfo> = entries
            .iter()
            .map(|entry| {
                let mut info = entry.state.lock().expect("poisoned").info(now);
                info.last_received = entry.last_recv(now);
                info
            })
            .collect();
        infos.sort_by_key(|info| info.node_id);
        infos
    }

    pub(super) fn last_recv_activity(&self, node_id: &PublicKey, now: Instant) -> Option<Duration> {
        self.get(node_id)?.last_recv(now)
    }

    /// Checks that the three indices agree with each other and with the nodes' paths.
    #[cfg(test)]
    pub(super) fn validate(&self) -> Result<(), String> {
        self.inner.lock().expect("poisoned").validate()
    }
}

impl NodeMapInner {
    fn upsert(&mut self, peer: PeerInfo, now: Instant, metrics: &Metrics) {
        let entry = match self.by_node_key.get(&peer.node_id) {
            Some(entry) => entry.clone(),
            None => {
                debug!(node = %peer.node_id.fmt_short(), relay_region = ?peer.relay_region, "inserting new node");
                let state = NodeState::new(
                    Options {
                        node_id: peer.node_id,
                        disco_key: peer.disco_key,
                        relay_region: peer.relay_region,
                        active: false,
                    },
                    now,
                );
                let entry = Arc::new(NodeEntry::new(state, now));
                self.by_node_key.insert(peer.node_id, entry.clone());
                if let Some(disco_key) = peer.disco_key {
                    self.by_disco_key
                        .entry(disco_key)
                        .or_default()
                        .insert(peer.node_id);
                }
                entry
            }
        };

        let (old_disco, removed, addrs) = {
            let mut state = entry.state.lock().expect("poisoned");
            let old_disco = state.disco_key();
            let removed = state.update_from_external_info(
                peer.disco_key,
                peer.relay_region,
                &peer.direct_addrs,
                now,
                metrics,
            );
            (old_disco, removed, state.direct_addresses().collect::<Vec<_>>())
        };

        for ipp in removed {
            self.unindex_addr(&ipp, &entry);
        }
        for ipp in addrs {
            self.index_addr(ipp, &entry, now);
        }
        if old_disco != peer.disco_key {
            if let Some(old) = old_disco {
                self.remove_disco_owner(&old, &peer.node_id);
            }
            if let Some(new) = peer.disco_key {
                self.by_disco_key.entry(new).or_default().insert(peer.node_id);
            }
        }
    }

    fn delete(&mut self, node_id: &PublicKey) -> bool {
        let Some(entry) = self.by_node_key.remove(node_id) else {
            return false;
        };
        debug!(node = %node_id.fmt_short(), "removing node");
        let (disco_key, addrs) = {
            let state = entry.state.lock().expect("poisoned");
            (state.disco_key(), state.direct_addresses().collect::<Vec<_>>())
        };
        for ipp in addrs {
            if self
                .by_ip_port
                .get(&ipp)
                .is_some_and(|owner| Arc::ptr_eq(owner, &entry))
            {
                self.by_ip_port.remove(&ipp);
            }
        }
        if let Some(disco_key) = disco_key {
            self.remove_disco_owner(&disco_key, node_id);
        }
        true
    }

    fn rename(&mut self, old: &PublicKey, new: PublicKey) -> bool {
        if self.by_node_key.contains_key(&new) {
            return false;
        }
        let Some(entry) = self.by_node_key.remove(old) else {
            return false;
        };
        let disco_key = {
            let mut state = entry.state.lock().expect("poisoned");
            state.set_node_id(new);
            state.disco_key()
        };
        if let Some(disco_key) = disco_key {
            self.remove_disco_owner(&disco_key, old);
            self.by_disco_key.entry(disco_key).or_default().insert(new);
        }
        self.by_node_key.insert(new, entry);
        true
    }

    fn remove_disco_owner(&mut self, disco_key: &DiscoPublicKey, node_id: &PublicKey) {
        if let Some(owners) = self.by_disco_key.get_mut(disco_key) {
            owners.remove(node_id);
            if owners.is_empty() {
                self.by_disco_key.remove(disco_key);
            }
        }
    }

    /// Points `ipp` at `entry`, taking the address away from its previous owner.
    ///
    /// The node lock of `entry` must not be held.
    fn index_addr(&mut self, ipp: IpPort, entry: &Arc<NodeEntry>, now: Instant) {
        match self.by_ip_port.insert(ipp, entry.clone()) {
            Some(prev) if !Arc::ptr_eq(&prev, entry) => {
                let mut state = prev.state.lock().expect("poisoned");
                debug!(addr = %ipp, prev = %state.node_id().fmt_short(), "direct address moved to other node");
                state.remove_direct_addr(&ipp, now, "moved to other node");
            }
            _ => (),
        }
    }

    fn unindex_addr(&mut self, ipp: &IpPort, entry: &Arc<NodeEntry>) {
        if self
            .by_ip_port
            .get(ipp)
            .is_some_and(|owner| Arc::ptr_eq(owner, entry))
        {
            trace!(addr = %ipp, "unindexing direct address");
            self.by_ip_port.remove(ipp);
        }
    }

    #[cfg(test)]
    fn validate(&self) -> Result<(), String> {
        for (node_id, entry) in &self.by_node_key {
            let state = entry.state.lock().expect("poisoned");
            if state.node_id() != node_id {
                return Err(format!("{} indexed under {}", state.node_id().fmt_short(), node_id.fmt_short()));
            }
            for ipp in state.direct_addresses() {
                match self.by_ip_port.get(&ipp) {
                    Some(owner) if Arc::ptr_eq(owner, entry) => (),
                    _ => return Err(format!("{ipp} of {} not indexed", node_id.fmt_short())),
                }
            }
            if let Some(disco_key) = state.disco_key() {
                if !self
                    .by_disco_key
                    .get(&disco_key)
                    .is_some_and(|owners| owners.contains(node_id))
                {
                    return Err(format!("disco key of {} not indexed", node_id.fmt_short()));
                }
            }
        }
        for (ipp, entry) in &self.by_ip_port {
            let state = entry.state.lock().expect("poisoned");
            match self.by_node_key.get(state.node_id()) {
                Some(owner) if Arc::ptr_eq(owner, entry) => (),
                _ => return Err(format!("{ipp} points at a node that is gone")),
            }
            if !state.direct_addresses().any(|a| a == *ipp) {
                return Err(format!("{ipp} is not a path of {}", state.node_id().fmt_short()));
            }
        }
        for (disco_key, owners) in &self.by_disco_key {
            if owners.is_empty() {
                return Err(format!("no owners for {}", disco_key.fmt_short()));
            }
            for node_id in owners {
                let Some(entry) = self.by_node_key.get(node_id) else {
                    return Err(format!("disco key owner {} is gone", node_id.fmt_short()));
                };
                if entry.state.lock().expect("poisoned").disco_key() != Some(*disco_key) {
                    return Err(format!("{} does not use {}", node_id.fmt_short(), disco_key.fmt_short()));
                }
            }
        }
        Ok(())
    }
}

/// An (Ip, Port) pair.
///
/// NOTE: storing an [`IpPort`] is safer than storing a [`SocketAddr`] because for IPv6 socket
/// addresses include fields that can't be assumed consistent even within a single connection.
#[derive(Debug, derive_more::Display, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[display("{}", SocketAddr::from(*self))]
pub struct IpPort {
    ip: IpAddr,
    port: u16,
}

impl From<SocketAddr> for IpPort {
    fn from(socket_addr: SocketAddr) -> Self {
        Self {
            ip: socket_addr.ip(),
            port: socket_addr.port(),
        }
    }
}

impl From<IpPort> for SocketAddr {
    fn from(ip_port: IpPort) -> Self {
        let IpPort { ip, port } = ip_port;
        (ip, port).into()
    }
}

impl IpPort {
    pub fn ip(&self) -> &IpAddr {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use meshsock_base::{DiscoSecretKey, SecretKey};
    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;

    fn keys(n: usize) -> Vec<PublicKey> {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        (0..n).map(|_| SecretKey::generate(&mut rng).public()).collect()
    }

    fn disco_keys(n: usize) -> Vec<DiscoPublicKey> {
        (0..n).map(|_| DiscoSecretKey::generate().public()).collect()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn peer(node_id: PublicKey, disco_key: Option<DiscoPublicKey>, ports: &[u16]) -> PeerInfo {
        PeerInfo {
            node_id,
            disco_key,
            relay_region: Some(1),
            direct_addrs: ports.iter().map(|p| addr(*p)).collect(),
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let [a, b] = keys(2)[..] else { unreachable!() };
        let [da, db] = disco_keys(2)[..] else { unreachable!() };

        map.upsert(peer(a, Some(da), &[1, 2]), now, &metrics);
        map.upsert(peer(b, Some(db), &[3]), now, &metrics);
        map.validate().unwrap();
        assert_eq!(map.node_count(), 2);

        assert_eq!(map.receive_udp(addr(2), now).map(|(k, _)| k), Some(a));
        assert_eq!(map.receive_udp(addr(3), now).map(|(k, _)| k), Some(b));
        assert_eq!(map.receive_udp(addr(4), now), None);
        assert_eq!(map.disco_owner(&da, None, None), DiscoOwner::Unique(a));

        // The address moves from a to b.
        map.upsert(peer(b, Some(db), &[2, 3]), now, &metrics);
        map.validate().unwrap();
        assert_eq!(map.receive_udp(addr(2), now).map(|(k, _)| k), Some(b));

        assert!(map.delete(&a));
        assert!(!map.delete(&a));
        map.validate().unwrap();
        assert_eq!(map.disco_owner(&da, None, None), DiscoOwner::Unknown);
    }

    #[test]
    fn test_shared_disco_key() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let [a, b] = keys(2)[..] else { unreachable!() };
        let d = DiscoSecretKey::generate().public();

        map.upsert(peer(a, Some(d), &[1]), now, &metrics);
        map.upsert(peer(b, Some(d), &[2]), now, &metrics);
        map.validate().unwrap();

        assert_eq!(map.disco_owner(&d, None, None), DiscoOwner::Ambiguous);
        assert_eq!(map.disco_owner(&d, Some(&b), None), DiscoOwner::Unique(b));
        assert_eq!(map.disco_owner(&d, None, Some(addr(1))), DiscoOwner::Unique(a));
        assert_eq!(map.disco_owner(&d, None, Some(addr(9))), DiscoOwner::Ambiguous);
        assert!(map.has_disco_key(&a, &d));
    }

    #[test]
    fn test_set_peers_relinks_rotated_key() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let [a, b, c] = keys(3)[..] else { unreachable!() };
        let [da, dc] = disco_keys(2)[..] else { unreachable!() };

        map.upsert(peer(a, Some(da), &[1]), now, &metrics);
        map.upsert(peer(c, Some(dc), &[3]), now, &metrics);
        let before = map.get(&a).unwrap();

        // a rotates its node key to b, c leaves.
        map.set_peers(vec![peer(b, Some(da), &[1])], now, &metrics);
        map.validate().unwrap();
        assert_eq!(map.node_count(), 1);
        assert!(Arc::ptr_eq(&before, &map.get(&b).unwrap()));
        assert!(map.get(&a).is_none());
        assert_eq!(map.receive_udp(addr(3), now), None);
        assert_eq!(map.disco_owner(&dc, None, None), DiscoOwner::Unknown);
    }

    #[test]
    fn test_set_peers_new_key_new_disco_is_fresh() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let [a, b] = keys(2)[..] else { unreachable!() };
        let [da, db] = disco_keys(2)[..] else { unreachable!() };

        map.upsert(peer(a, Some(da), &[1]), now, &metrics);
        let before = map.get(&a).unwrap();
        map.set_peers(vec![peer(b, Some(db), &[1])], now, &metrics);
        map.validate().unwrap();
        assert!(!Arc::ptr_eq(&before, &map.get(&b).unwrap()));
    }

    #[test]
    fn test_recv_activity() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let a = keys(1)[0];
        map.upsert(peer(a, Some(DiscoSecretKey::generate().public()), &[1]), now, &metrics);

        assert_eq!(map.last_recv_activity(&a, now), None);
        assert_eq!(map.receive_udp(addr(1), now), Some((a, true)));
        assert_eq!(map.receive_relay(1, &a, now + Duration::from_secs(1)), Some(false));
        let later = now + RECV_ACTIVITY_INTERVAL;
        assert_eq!(map.receive_udp(addr(1), later), Some((a, true)));
        assert_eq!(
            map.last_recv_activity(&a, later + Duration::from_secs(2)),
            Some(Duration::from_secs(2))
        );

        let unknown = keys(2)[1];
        assert_eq!(map.receive_relay(1, &unknown, now), None);
    }

    #[test]
    fn test_ping_indexes_new_path() {
        let map = NodeMap::default();
        let metrics = Metrics::default();
        let now = Instant::now();
        let [a, b] = keys(2)[..] else { unreachable!() };
        let [da, db] = disco_keys(2)[..] else { unreachable!() };
        map.upsert(peer(a, Some(da), &[1]), now, &metrics);
        map.upsert(peer(b, Some(db), &[]), now, &metrics);

        let handled = map
            .handle_ping(&b, SendAddr::Udp(addr(1)), TransactionId::default(), now)
            .unwrap();
        assert!(handled.needs_ping_back.is_some());
        map.validate().unwrap();
        assert_eq!(map.receive_udp(addr(1), now).map(|(k, _)| k), Some(b));

        let actions = map.handle_call_me_maybe(
            &a,
            CallMeMaybe {
                my_numbers: vec![addr(5)],
            },
            now,
        );
        assert!(!actions.is_empty());
        map.validate().unwrap();
        assert_eq!(map.receive_udp(addr(5), now).map(|(k, _)| k), Some(a));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Upsert { node: usize, disco: Option<usize>, ports: Vec<u16> },
        Delete(usize),
        Rename(usize, usize),
        SetPeers(Vec<(usize, Option<usize>, Vec<u16>)>),
        Ping { node: usize, port: u16 },
    }

    fn arb_ports() -> impl Strategy<Value = Vec<u16>> {
        proptest::collection::vec(1u16..8, 0..4)
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6, proptest::option::of(0usize..3), arb_ports())
                .prop_map(|(node, disco, ports)| Op::Upsert { node, disco, ports }),
            (0usize..6).prop_map(Op::Delete),
            (0usize..6, 0usize..6).prop_map(|(a, b)| Op::Rename(a, b)),
            proptest::collection::vec((0usize..6, proptest::option::of(0usize..3), arb_ports()), 0..4)
                .prop_map(Op::SetPeers),
            (0usize..6, 1u16..8).prop_map(|(node, port)| Op::Ping { node, port }),
        ]
    }

    proptest! {
        #[test]
        fn node_map_indices_stay_consistent(ops in proptest::collection::vec(arb_op(), 1..40)) {
            let nodes = keys(6);
            let discos = disco_keys(3);
            let map = NodeMap::default();
            let metrics = Metrics::default();
            let now = Instant::now();
            let info = |node: usize, disco: Option<usize>, ports: &[u16]| {
                peer(nodes[node], disco.map(|d| discos[d]), ports)
            };

            for op in ops {
                match op {
                    Op::Upsert { node, disco, ports } => map.upsert(info(node, disco, &ports), now, &metrics),
                    Op::Delete(node) => {
                        map.delete(&nodes[node]);
                    }
                    Op::Rename(a, b) => {
                        map.rename(&nodes[a], nodes[b]);
                    }
                    Op::SetPeers(peers) => {
                        let mut seen = BTreeSet::new();
                        let peers = peers
                            .into_iter()
                            .filter(|(node, _, _)| seen.insert(*node))
                            .map(|(node, disco, ports)| info(node, disco, &ports))
                            .collect();
                        map.set_peers(peers, now, &metrics);
                    }
                    Op::Ping { node, port } => {
                        map.handle_ping(&nodes[node], SendAddr::Udp(addr(port)), TransactionId::default(), now);
                    }
                }
                prop_assert_eq!(map.validate(), Ok(()));
            }
        }
    }
}
