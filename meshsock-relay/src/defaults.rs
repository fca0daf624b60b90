//! Default values used when talking to relays.

use std::time::Duration;

/// The default STUN port of a relay node.
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// The default HTTPS port of a relay node.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Maximum size of a single packet forwarded by a relay.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Timeouts used by relay clients.
pub mod timeouts {
    use super::Duration;

    /// Time allowed to establish a relay connection, including the transport upgrade.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Maximum time for a relay server to answer a ping.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
}
