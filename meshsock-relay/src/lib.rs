//! The relay side of meshsock.
//!
//! Relays are store-and-forward servers reachable by every node. When no direct path to a
//! peer is known, packets are sent to the peer's relay region instead. This crate holds
//! the table of relay regions and the client abstraction used to talk to a relay; the
//! relay server and its wire protocol live elsewhere.

#![cfg_attr(meshsock_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod defaults;
pub mod relay_map;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(meshsock_docsrs, doc(cfg(feature = "test-utils")))]
pub mod test_utils;

pub use self::{
    client::{ConnectError, ReceivedPacket, RelayConn, RelayDialer, RelayError, Transport},
    relay_map::{RegionId, RelayMap, RelayNode, RelayRegion},
};
