//! The relay client abstraction.
//!
//! A [`RelayDialer`] opens connections to a relay region, a [`RelayConn`] is one such
//! connection. The manager only needs to send packets to a peer, receive packets from
//! peers and learn when a region had to fall back to a different transport.

use std::{fmt::Debug, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use meshsock_base::PublicKey;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

use crate::relay_map::RelayRegion;

/// How a relay connection is carried.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// An HTTP connection upgraded to the relay protocol.
    #[default]
    Http,
    /// A WebSocket connection, used when the HTTP upgrade is refused on the path.
    #[serde(alias = "websocket")]
    WebSocket,
}

/// A packet received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// The peer that sent the packet.
    pub src: PublicKey,
    /// The packet contents.
    pub data: Bytes,
}

/// Opens connections to relay regions.
pub trait RelayDialer: Debug + Send + Sync + 'static {
    /// Connects to `region` using `transport`.
    ///
    /// Returning [`ConnectError::UpgradeRefused`] for [`Transport::Http`] makes the caller
    /// retry with [`Transport::WebSocket`].
    fn dial(
        &self,
        region: Arc<RelayRegion>,
        transport: Transport,
    ) -> BoxFuture<'static, Result<Box<dyn RelayConn>, ConnectError>>;
}

/// An established connection to a relay region.
///
/// All methods take `&self` so sending and receiving can be polled concurrently. `recv`
/// must be cancel safe.
pub trait RelayConn: Debug + Send + Sync + 'static {
    /// Sends `packet` to `dst` through the relay.
    fn send(&self, dst: PublicKey, packet: Bytes) -> BoxFuture<'_, Result<(), RelayError>>;

    /// Receives the next packet.
    fn recv(&self) -> BoxFuture<'_, Result<ReceivedPacket, RelayError>>;

    /// Pings the relay server, resolving once it answered.
    fn ping(&self) -> BoxFuture<'_, Result<(), RelayError>>;

    /// The local address of the underlying connection, if known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// The transport this connection uses.
    fn transport(&self) -> Transport;

    /// Closes the connection. Pending and future `recv` calls fail.
    fn close(&self);
}

/// Errors when connecting to a relay.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum ConnectError {
    /// The HTTP upgrade to the relay protocol was refused somewhere on the path.
    #[snafu(display("relay upgrade refused: {reason}"))]
    UpgradeRefused { reason: String },
    /// Dialing failed.
    #[snafu(display("dialing relay failed"))]
    Dial { source: std::io::Error },
    /// Connecting took too long.
    #[snafu(display("timeout connecting to relay"))]
    Timeout {},
}

/// Errors on an established relay connection.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum RelayError {
    /// The connection is closed.
    #[snafu(display("relay connection closed"))]
    ConnClosed {},
    /// Reading or writing failed.
    #[snafu(display("relay connection failed"))]
    ConnIo { source: std::io::Error },
}
