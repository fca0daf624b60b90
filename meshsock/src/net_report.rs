//! The network report consumed by the path manager.
//!
//! Producing a report means sending STUN probes to the relay regions and interpreting the
//! answers. That is done by an implementation of [`NetReporter`] supplied by the host, the
//! manager only asks for reports and forwards the STUN packets it receives on its sockets.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};

use futures_util::future::BoxFuture;
use meshsock_relay::{RegionId, RelayMap};
use n0_future::time::Duration;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

/// A point in time view of the network we are on.
#[derive(Default, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Report {
    /// A UDP STUN round trip completed.
    pub udp: bool,
    /// An IPv6 round trip completed.
    pub ipv6: bool,
    /// An IPv4 round trip completed.
    pub ipv4: bool,
    /// An IPv4 packet was able to be sent.
    pub ipv4_can_send: bool,
    /// Could bind a socket to ::1.
    pub os_has_ipv6: bool,
    /// Whether STUN results depend on which STUN server you're talking to (on IPv4).
    pub mapping_varies_by_dest_ip: Option<bool>,
    /// Whether the router hairpins traffic. `None` for unknown.
    pub hair_pinning: Option<bool>,
    /// The relay region with the lowest latency, `None` for unknown.
    pub preferred_region: Option<RegionId>,
    /// Latency to each region's STUN server over IPv4.
    pub region_v4_latency: BTreeMap<RegionId, Duration>,
    /// Latency to each region's STUN server over IPv6.
    pub region_v6_latency: BTreeMap<RegionId, Duration>,
    /// ip:port of global IPv4
    pub global_v4: Option<SocketAddrV4>,
    /// `[ip]:port` of global IPv6
    pub global_v6: Option<SocketAddrV6>,
}

/// Produces [`Report`]s.
pub trait NetReporter: Debug + Send + Sync + 'static {
    /// Runs the probes against the regions of `relay_map`.
    ///
    /// The manager gives up on a report after
    /// [`NET_REPORT_TIMEOUT`](crate::defaults::timeouts::NET_REPORT_TIMEOUT).
    fn get_report(&self, relay_map: RelayMap) -> BoxFuture<'static, Result<Report, NetReportError>>;

    /// Hands over a STUN packet that arrived on one of the manager's sockets.
    fn receive_stun_packet(&self, packet: &[u8], src: SocketAddr);
}

/// Failure producing a [`Report`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum NetReportError {
    #[snafu(display("net report failed: {message}"))]
    Failed { message: String },
    #[snafu(display("net report timed out"))]
    Timeout {},
}

/// Contains information about the host's network state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    /// Says whether the host's NAT mappings vary based on the destination IP.
    pub mapping_varies_by_dest_ip: Option<bool>,
    /// If their router does hairpinning. It reports true even if there's no NAT involved.
    pub hair_pinning: Option<bool>,
    /// Whether the host has IPv6 internet connectivity.
    pub working_ipv6: Option<bool>,
    /// Whether the OS supports IPv6 at all, regardless of whether IPv6 internet
    /// connectivity is available.
    pub os_has_ipv6: Option<bool>,
    /// Whether the host has UDP internet connectivity.
    pub working_udp: Option<bool>,
    /// Whether we have an existing portmap open (UPnP, PMP, or PCP).
    pub have_port_map: bool,
    /// This node's home relay region.
    pub preferred_region: Option<RegionId>,
    /// The fastest recent time to reach each region's STUN server, in seconds.
    ///
    /// Keyed by `<region>-v4` and `<region>-v6`.
    pub relay_latency: BTreeMap<String, f64>,
}

impl NetInfo {
    pub(crate) fn from_report(report: &Report, have_port_map: bool) -> Self {
        let mut relay_latency = BTreeMap::new();
        for (region, d) in &report.region_v4_latency {
            relay_latency.insert(format!("{region}-v4"), d.as_secs_f64());
        }
        for (region, d) in &report.region_v6_latency {
            relay_latency.insert(format!("{region}-v6"), d.as_secs_f64());
        }
        NetInfo {
            mapping_varies_by_dest_ip: report.mapping_varies_by_dest_ip,
            hair_pinning: report.hair_pinning,
            working_ipv6: Some(report.ipv6),
            os_has_ipv6: Some(report.os_has_ipv6),
            working_udp: Some(report.udp),
            have_port_map,
            preferred_region: report.preferred_region,
            relay_latency,
        }
    }

    /// Checks if this is probably still the same network as *other*.
    ///
    /// This tries to compare the network situation, without taking into account things
    /// expected to change a little like e.g. latency to the relay server.
    pub fn basically_equal(&self, other: &Self) -> bool {
        self.mapping_varies_by_dest_ip == other.mapping_varies_by_dest_ip
            && self.hair_pinning == other.hair_pinning
            && self.working_ipv6 == other.working_ipv6
            && self.os_has_ipv6 == other.os_has_ipv6
            && self.working_udp == other.working_udp
            && self.have_port_map == other.have_port_map
            && self.preferred_region == other.preferred_region
    }
}
