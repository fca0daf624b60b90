use iroh_metrics::{Counter, MetricsGroup};
use serde::{Deserialize, Serialize};

/// Counters of the path manager.
///
/// One instance is owned by each manager and passed in through
/// [`Options::metrics`](super::Options::metrics), so several managers in one process do not
/// share counters.
#[allow(missing_docs)]
#[derive(Debug, Default, Serialize, Deserialize, MetricsGroup)]
#[non_exhaustive]
#[metrics(name = "magicsock")]
pub struct Metrics {
    pub re_stun_calls: Counter,
    pub update_direct_addrs: Counter,
    pub rebinds: Counter,

    // Sends (data or disco)
    pub send_ipv4: Counter,
    pub send_ipv6: Counter,
    /// Packets not sent because no socket for the address family is bound.
    pub send_unsupported_family: Counter,
    pub send_relay: Counter,
    pub send_relay_error: Counter,
    /// Packets dropped because a relay write queue was full.
    pub send_relay_queue_full: Counter,

    // Data packets (non-disco)
    pub send_data: Counter,
    pub send_data_network_down: Counter,
    pub recv_data_relay: Counter,
    pub recv_data_ipv4: Counter,
    pub recv_data_ipv6: Counter,
    /// Payload packets from a source address no peer is known at.
    pub recv_data_unknown_src: Counter,
    /// Payload packets dropped because the receive queue was full.
    pub recv_data_dropped: Counter,
    pub recv_stun: Counter,

    // Disco packets
    pub send_disco_udp: Counter,
    pub send_disco_relay: Counter,
    pub sent_disco_ping: Counter,
    pub sent_disco_pong: Counter,
    pub sent_disco_call_me_maybe: Counter,
    pub recv_disco_bad_key: Counter,
    pub recv_disco_bad_parse: Counter,
    pub recv_disco_unknown_sender: Counter,
    pub recv_disco_udp: Counter,
    pub recv_disco_relay: Counter,
    pub recv_disco_ping: Counter,
    pub recv_disco_pong: Counter,
    pub recv_disco_pong_stale: Counter,
    pub recv_disco_call_me_maybe: Counter,
    pub recv_disco_call_me_maybe_direct: Counter,
    pub recv_disco_call_me_maybe_bad_disco: Counter,

    // How many times our home relay region has changed from one region to another.
    pub relay_home_change: Counter,
    pub relay_sessions_added: Counter,
    pub relay_sessions_removed: Counter,
    /// Relay sessions that had to fall back to WebSocket.
    pub relay_websocket_fallback: Counter,

    /*
     * Connection Metrics
     */
    /// The number of direct connections we have made to peers.
    pub num_direct_conns_added: Counter,
    /// The number of direct connections we have lost to peers.
    pub num_direct_conns_removed: Counter,
    /// The number of connections to peers we have added over relay.
    pub num_relay_conns_added: Counter,
    /// The number of connections to peers we have removed over relay.
    pub num_relay_conns_removed: Counter,

    pub actor_tick_main: Counter,
    pub actor_tick_msg: Counter,
    pub actor_tick_re_stun: Counter,
    pub actor_tick_heartbeat: Counter,
    pub actor_tick_relay_clean: Counter,
    pub actor_tick_direct_addr_update_receiver: Counter,
    pub actor_tick_portmap_changed: Counter,
    pub actor_tick_other: Counter,
}
