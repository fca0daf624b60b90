//! Default values used by the path manager.

/// Timeouts and intervals driving the discovery protocol.
pub mod timeouts {
    use n0_future::time::Duration;

    /// How long we wait for a pong reply before assuming it's never coming.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

    /// The minimum time between pings to a path.
    ///
    /// A call-me-maybe resets this, as the first pings likely didn't make it through the
    /// firewall.
    pub const DISCO_PING_INTERVAL: Duration = Duration::from_secs(5);

    /// A ping from the same source within this window is a heartbeat.
    pub const HEARTBEAT_PING_WINDOW: Duration = Duration::from_secs(5);

    /// How often the per-peer heartbeat runs.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

    /// How long we trust a direct path without having heard a pong on it.
    pub const TRUST_UDP_ADDR_DURATION: Duration = Duration::from_millis(6500);

    /// The latency at or under which we don't try to upgrade to a better path.
    pub const GOOD_ENOUGH_LATENCY: Duration = Duration::from_millis(5);

    /// How long since the last activity we try to keep a peering alive.
    ///
    /// It's also the idle time at which we stop doing STUN queries to keep NAT mappings
    /// alive.
    pub const SESSION_ACTIVE_TIMEOUT: Duration = Duration::from_secs(45);

    /// How often we try to upgrade to a better path even if we have a direct path that works.
    pub const UPGRADE_INTERVAL: Duration = Duration::from_secs(60);

    /// How long until we send a stayin alive ping.
    pub const STAYIN_ALIVE_MIN_ELAPSED: Duration = Duration::from_secs(2);

    /// How old our own endpoints may be before a call-me-maybe needs a fresh discovery run.
    pub const ENDPOINTS_FRESH_ENOUGH: Duration = Duration::from_secs(27);

    /// How long an endpoint we saw once for ourselves is still advertised.
    ///
    /// Slightly longer than the five minute discovery cadence of the control plane.
    pub const ENDPOINT_TRACKER_LIFETIME: Duration = Duration::from_secs(5 * 60 + 10);

    /// How long a relay session to a non-home region may be unused before it is closed.
    pub const RELAY_INACTIVE_CLEANUP_TIME: Duration = Duration::from_secs(60);

    /// How often idle relay sessions are looked for.
    pub const RELAY_CLEAN_INTERVAL: Duration = Duration::from_secs(15);

    /// How long a network report may take.
    pub const NET_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Minimum time between two receive-activity callbacks for the same peer.
    pub const RECV_ACTIVITY_INTERVAL: Duration = Duration::from_secs(10);

    /// Time after which queued relay datagrams are dropped while the session is dialing.
    pub const UNDELIVERABLE_DATAGRAM_TIMEOUT: Duration = Duration::from_millis(400);
}

/// Lower bound of the randomized re-STUN period, in seconds.
pub const RE_STUN_MIN_SECS: u64 = 20;

/// Upper bound of the randomized re-STUN period, in seconds.
///
/// Just under 30s, a common UDP NAT mapping timeout.
pub const RE_STUN_MAX_SECS: u64 = 26;

/// Number of candidate addresses per peer that are not in use which we keep around.
pub const MAX_INACTIVE_DIRECT_ADDRESSES: usize = 20;

/// Number of round trip samples kept per candidate.
pub const PONG_HISTORY: usize = 8;

/// Default depth of the per-region relay write queue.
pub const DEFAULT_RELAY_QUEUE_LEN: usize = 32;

/// Depth of the queue of received payload datagrams waiting for [`receive_batch`].
///
/// [`receive_batch`]: crate::magicsock::MagicSock::receive_batch
pub const RECV_QUEUE_LEN: usize = 512;
