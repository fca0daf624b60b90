//! The state kept for each network path to a remote node.

use std::collections::{BTreeMap, HashMap, VecDeque};

use n0_future::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

use super::IpPort;
use crate::{
    defaults::{
        PONG_HISTORY,
        timeouts::{
            DISCO_PING_INTERVAL, HEARTBEAT_PING_WINDOW, SESSION_ACTIVE_TIMEOUT,
            TRUST_UDP_ADDR_DURATION,
        },
    },
    disco::SendAddr,
    stun::TransactionId,
};

/// How we learned about a path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub enum Source {
    /// The peer set handed to us by the control plane.
    #[display("peer-set")]
    PeerSet,
    /// The peer advertised it in a call-me-maybe.
    #[display("call-me-maybe")]
    CallMeMaybe,
    /// We received a disco ping from this address.
    #[display("ping")]
    Ping,
    /// We received data from this relay region.
    #[display("relay")]
    Relay,
}

/// What a received ping meant to the path it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingRole {
    /// We already saw a ping with this transaction id.
    Duplicate,
    /// The ping arrived on a path we did not know.
    NewPath,
    /// Another ping from the same source within [`HEARTBEAT_PING_WINDOW`].
    LikelyHeartbeat,
    /// A ping on a known path that was quiet for a while.
    Activate,
}

/// A pong we received on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct PongReply {
    pub(super) latency: Duration,
    /// When we received the pong.
    pub(super) pong_at: Instant,
    /// The pong's src (usually same as the path key).
    pub(super) from: SendAddr,
    /// What they reported they heard, if known.
    pub(super) pong_src: Option<std::net::SocketAddr>,
}

/// State about a particular path to a remote node.
///
/// This state is used for both the relay path and any direct UDP paths.
#[derive(Debug, Clone, Default)]
pub(super) struct PathState {
    /// The last (outgoing) ping time.
    pub(super) last_ping: Option<Instant>,
    /// When we last received a ping on this path, and its transaction id.
    ///
    /// The transaction id de-duplicates pings that reach us over more than one code path.
    last_got_ping: Option<(Instant, TransactionId)>,
    /// The last time this path was advertised in a call-me-maybe.
    pub(super) call_me_maybe_time: Option<Instant>,
    /// The pong that currently makes this path usable.
    ///
    /// Cleared when connectivity changes, while the history below is kept.
    pub(super) recent_pong: Option<PongReply>,
    /// Round trip samples, newest last.
    pongs: VecDeque<PongReply>,
    /// When this path last carried payload data.
    pub(super) last_payload_msg: Option<Instant>,
    /// Latest time each source told us about this path.
    pub(super) sources: HashMap<Source, Instant>,
}

impl PathState {
    pub(super) fn new(source: Source, now: Instant) -> Self {
        let mut sources = HashMap::new();
        sources.insert(source, now);
        Self {
            sources,
            ..Default::default()
        }
    }

    pub(super) fn with_last_payload(now: Instant) -> Self {
        Self {
            last_payload_msg: Some(now),
            ..Self::new(Source::Relay, now)
        }
    }

    pub(super) fn with_ping(tx_id: TransactionId, now: Instant) -> Self {
        Self {
            last_got_ping: Some((now, tx_id)),
            ..Self::new(Source::Ping, now)
        }
    }

    pub(super) fn add_source(&mut self, source: Source, now: Instant) {
        self.sources.insert(source, now);
    }

    pub(super) fn add_pong_reply(&mut self, r: PongReply) {
        if self.pongs.len() == PONG_HISTORY {
            self.pongs.pop_front();
        }
        self.pongs.push_back(r.clone());
        self.recent_pong = Some(r);
    }

    /// The latency reported for this path.
    ///
    /// Only paths with a pong since the last connectivity change have one. It is the lowest
    /// sample still in the history, which keeps single slow replies from moving traffic
    /// around.
    pub(super) fn latency(&self) -> Option<Duration> {
        self.recent_pong.as_ref()?;
        self.pongs.iter().map(|p| p.latency).min()
    }

    /// The latency used for path selection at `now`.
    ///
    /// Like [`Self::latency`], but `None` once the last pong is older than
    /// [`TRUST_UDP_ADDR_DURATION`].
    pub(super) fn recent_latency(&self, now: Instant) -> Option<Duration> {
        let pong = self.recent_pong.as_ref()?;
        if now.saturating_duration_since(pong.pong_at) >= TRUST_UDP_ADDR_DURATION {
            return None;
        }
        self.latency()
    }

    /// A ping sent at `sent_at` timed out: a pong received before it proves nothing anymore.
    pub(super) fn ping_timed_out(&mut self, sent_at: Instant) {
        self.last_ping = None;
        if self
            .recent_pong
            .as_ref()
            .is_some_and(|pong| pong.pong_at < sent_at)
        {
            self.recent_pong = None;
        }
    }

    /// The number of round trip samples kept.
    pub(super) fn num_samples(&self) -> usize {
        self.pongs.len()
    }

    /// Check whether this path is considered active.
    ///
    /// Active means the path has received payload messages within the last
    /// [`SESSION_ACTIVE_TIMEOUT`].
    pub(super) fn is_active(&self, now: Instant) -> bool {
        self.last_payload_msg
            .is_some_and(|instant| now.duration_since(instant) <= SESSION_ACTIVE_TIMEOUT)
    }

    /// Reports the last instant this path was considered alive.
    ///
    /// This is the most recent of: the last pong, the last call-me-maybe mentioning it,
    /// the last payload and the last ping from the remote.
    pub(super) fn last_alive(&self) -> Option<Instant> {
        self.recent_pong
            .as_ref()
            .map(|pong| pong.pong_at)
            .into_iter()
            .chain(self.last_payload_msg)
            .chain(self.call_me_maybe_time)
            .chain(self.last_got_ping.map(|(at, _)| at))
            .max()
    }

    /// Like [`Self::last_alive`], but also counts being told about the path.
    pub(super) fn last_seen(&self) -> Option<Instant> {
        self.last_alive()
            .into_iter()
            .chain(self.sources.values().copied())
            .max()
    }

    pub(super) fn last_control_msg(&self, now: Instant) -> Option<(Duration, ControlMsg)> {
        let last_pong = self
            .recent_pong
            .as_ref()
            .map(|pong| (pong.pong_at, ControlMsg::Pong));
        let last_call_me_maybe = self
            .call_me_maybe_time
            .map(|call_me| (call_me, ControlMsg::CallMeMaybe));
        let last_ping = self.last_got_ping.map(|(at, _)| (at, ControlMsg::Ping));

        last_pong
            .into_iter()
            .chain(last_call_me_maybe)
            .chain(last_ping)
            .max_by_key(|(instant, _kind)| *instant)
            .map(|(instant, kind)| (now.duration_since(instant), kind))
    }

    pub(super) fn needs_ping(&self, now: Instant) -> bool {
        match self.last_ping {
            None => true,
            Some(last_ping) => now.duration_since(last_ping) > DISCO_PING_INTERVAL,
        }
    }

    /// Records a ping received on this path.
    pub(super) fn handle_ping(&mut self, tx_id: TransactionId, now: Instant) -> PingRole {
        match self.last_got_ping {
            Some((_, last_tx)) if last_tx == tx_id => PingRole::Duplicate,
            prev => {
                self.last_got_ping = Some((now, tx_id));
                self.add_source(Source::Ping, now);
                match prev {
                    Some((last, _)) if now.duration_since(last) <= HEARTBEAT_PING_WINDOW => {
                        PingRole::LikelyHeartbeat
                    }
                    _ => PingRole::Activate,
                }
            }
        }
    }

    /// Forgets everything that proves this path works, keeping the latency history.
    pub(super) fn clear(&mut self) {
        self.last_ping = None;
        self.last_got_ping = None;
        self.call_me_maybe_time = None;
        self.recent_pong = None;
    }

    fn summary(&self, now: Instant, mut w: impl std::fmt::Write) -> std::fmt::Result {
        write!(w, "{{ ")?;
        if self.is_active(now) {
            write!(w, "active ")?;
        }
        if let Some(ref pong) = self.recent_pong {
            write!(w, "pong-received({:?} ago) ", now.duration_since(pong.pong_at))?;
        }
        if let Some((when, _)) = self.last_got_ping {
            write!(w, "ping-received({:?} ago) ", now.duration_since(when))?;
        }
        if let Some(when) = self.last_ping {
            write!(w, "ping-sent({:?} ago) ", now.duration_since(when))?;
        }
        write!(w, "}}")
    }
}

pub(super) fn summarize_node_paths(paths: &BTreeMap<IpPort, PathState>, now: Instant) -> String {
    use std::fmt::Write;

    let mut w = String::new();
    write!(&mut w, "[").ok();
    for (i, (ipp, state)) in paths.iter().enumerate() {
        if i > 0 {
            write!(&mut w, ", ").ok();
        }
        write!(&mut w, "{ipp}").ok();
        state.summary(now, &mut w).ok();
    }
    write!(&mut w, "]").ok();
    w
}

/// The type of control message we have received.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, derive_more::Display)]
pub enum ControlMsg {
    /// We received a Ping from the node.
    #[display("ping←")]
    Ping,
    /// We received a Pong from the node.
    #[display("pong←")]
    Pong,
    /// We received a CallMeMaybe.
    #[display("call me")]
    CallMeMaybe,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(latency_ms: u64, at: Instant) -> PongReply {
        PongReply {
            latency: Duration::from_millis(latency_ms),
            pong_at: at,
            from: SendAddr::Udp("1.1.1.1:1".parse().unwrap()),
            pong_src: None,
        }
    }

    #[test]
    fn test_ping_roles() {
        let now = Instant::now();
        let tx = TransactionId::default();
        let mut state = PathState::with_ping(tx, now);
        assert_eq!(state.handle_ping(tx, now), PingRole::Duplicate);

        let tx2 = TransactionId::default();
        let soon = now + Duration::from_secs(1);
        assert_eq!(state.handle_ping(tx2, soon), PingRole::LikelyHeartbeat);

        let later = soon + HEARTBEAT_PING_WINDOW + Duration::from_millis(1);
        assert_eq!(
            state.handle_ping(TransactionId::default(), later),
            PingRole::Activate
        );
    }

    #[test]
    fn test_latency_is_min_of_history() {
        let now = Instant::now();
        let mut state = PathState::new(Source::PeerSet, now);
        assert_eq!(state.latency(), None);

        state.add_pong_reply(pong(30, now));
        state.add_pong_reply(pong(10, now));
        state.add_pong_reply(pong(20, now));
        assert_eq!(state.latency(), Some(Duration::from_millis(10)));

        // Push the 10ms sample out of the history.
        for _ in 0..PONG_HISTORY {
            state.add_pong_reply(pong(40, now));
        }
        assert_eq!(state.num_samples(), PONG_HISTORY);
        assert_eq!(state.latency(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_clear_keeps_history() {
        let now = Instant::now();
        let mut state = PathState::new(Source::PeerSet, now);
        state.add_pong_reply(pong(10, now));
        state.last_ping = Some(now);
        state.clear();

        assert!(state.recent_pong.is_none());
        assert!(state.needs_ping(now));
        assert_eq!(state.latency(), None);
        assert_eq!(state.num_samples(), 1);

        state.add_pong_reply(pong(15, now));
        assert_eq!(state.latency(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_recent_latency_ages_out() {
        let now = Instant::now();
        let mut state = PathState::new(Source::PeerSet, now);
        state.add_pong_reply(pong(10, now));
        assert_eq!(state.recent_latency(now), Some(Duration::from_millis(10)));
        let late = now + TRUST_UDP_ADDR_DURATION;
        assert_eq!(state.recent_latency(late), None);
        // still reported
        assert_eq!(state.latency(), Some(Duration::from_millis(10)));

        state.add_pong_reply(pong(30, late));
        assert_eq!(state.recent_latency(late), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_ping_timeout_drops_older_pong() {
        let now = Instant::now();
        let mut state = PathState::new(Source::PeerSet, now);
        state.add_pong_reply(pong(10, now));
        let sent = now + Duration::from_secs(1);
        state.last_ping = Some(sent);

        // a pong that arrived after the lost ping still counts
        state.ping_timed_out(now);
        assert!(state.recent_pong.is_some());
        state.ping_timed_out(sent);
        assert!(state.recent_pong.is_none());
        assert!(state.last_ping.is_none());
        assert_eq!(state.num_samples(), 1);
    }

    #[test]
    fn test_last_control_msg() {
        let now = Instant::now();
        let mut state = PathState::new(Source::PeerSet, now);
        assert_eq!(state.last_control_msg(now), None);

        state.call_me_maybe_time = Some(now);
        state.add_pong_reply(pong(10, now + Duration::from_secs(1)));
        let later = now + Duration::from_secs(3);
        assert_eq!(
            state.last_control_msg(later),
            Some((Duration::from_secs(2), ControlMsg::Pong))
        );
    }
}
