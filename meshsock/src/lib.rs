//! Endpoint discovery and path selection for mesh networking.
//!
//! [`MagicSock`] sends datagrams to peers identified by their [`PublicKey`]. It starts out
//! relaying them through the peer's relay region and keeps looking for a direct UDP path in
//! the background: it learns its own public addresses from network reports and port
//! mappings, tells peers about them, and validates candidate addresses with signed disco
//! pings. Once a direct path is confirmed, traffic moves off the relay without interrupting
//! the stream.
//!
//! The host supplies the pieces that talk to the outside world: a
//! [`RelayDialer`](meshsock_relay::RelayDialer) to reach relay servers, a
//! [`NetReporter`](net_report::NetReporter) producing network reports and optionally a
//! [`PortMapper`](portmapper::PortMapper).
//!
//! ```no_run
//! # async fn wrapper(
//! #     dialer: std::sync::Arc<dyn meshsock_relay::RelayDialer>,
//! #     reporter: std::sync::Arc<dyn meshsock::net_report::NetReporter>,
//! #     peer: meshsock::PeerInfo,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! use meshsock::{MagicSock, Options};
//!
//! let msock = MagicSock::spawn(Options {
//!     relay_dialer: Some(dialer),
//!     net_reporter: Some(reporter),
//!     ..Default::default()
//! })
//! .await?;
//! let node_id = peer.node_id;
//! msock.set_peer_set(vec![peer]);
//! msock.send(node_id, bytes::Bytes::from_static(b"hello")).await?;
//! for (from, data) in msock.receive_batch(16).await? {
//!     println!("{}: {} bytes", from.fmt_short(), data.len());
//! }
//! msock.close().await;
//! # Ok(())
//! # }
//! ```

#![recursion_limit = "256"]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(meshsock_docsrs, feature(doc_auto_cfg))]

pub mod defaults;
pub mod disco;
pub mod magicsock;
pub mod net_report;
pub mod portmapper;
pub mod stun;

pub use meshsock_base::{PublicKey, SecretKey};
pub use meshsock_relay::{RegionId, RelayMap};

pub use self::magicsock::{
    ConnectionType, CreateError, DirectAddr, DirectAddrType, Handle, MagicSock, Metrics, Options,
    PeerInfo, PingError, PongInfo, RebindError, RecvError, RemoteInfo, SendChoice, SendError,
    Status,
};
