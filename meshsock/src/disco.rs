//! Contains the discovery message types.
//!
//! A discovery message is:
//!
//! Header:
//!
//! ```ignore
//! magic            [u8; 6]  // “TS💬” (0x54 53 f0 9f 92 ac)
//! sender_disco_pub [u8; 32] // nacl public key
//! nonce            [u8; 24]
//! ````
//!
//! The recipient then decrypts the bytes following (the nacl box) and then the inner
//! payload structure is:
//!
//! ```ignore
//! message_type    u8   // (the MessageType constants below)
//! message_version u8   // (0 or 1 for ping/pong, 0 for call-me-maybe)
//! message_payload &[u8]
//! ```
//!
//! Pings and pongs are padded with zeros so every one of them has the same size on the
//! wire, whatever its contents.

use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

use meshsock_base::{DiscoPublicKey, PublicKey, SharedSecret, disco_key};
use meshsock_relay::RegionId;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};

use crate::stun::TransactionId;

/// The 6 byte header of all discovery messages.
pub const MAGIC: &str = "TS💬"; // 6 bytes: 0x54 53 f0 9f 92 ac
/// Length of [`MAGIC`] in bytes.
pub const MAGIC_LEN: usize = MAGIC.len();

/// Current version of pings and pongs. Version 1 pings always carry the sender's node key.
const V1: u8 = 1;
/// Version of call-me-maybe, and of pings and pongs from older nodes.
const V0: u8 = 0;

const KEY_LEN: usize = 32;
const TX_LEN: usize = 12;
const HEADER_LEN: usize = 2;
const EP_LENGTH: usize = 16 + 2; // 16 byte IP address + 2 byte port

/// Maximum size of a sealed discovery packet on the wire.
pub const MAX_PACKET_SIZE: usize = 1310;

/// Size pings and pongs are padded to before sealing.
///
/// The sealed packet, with magic and sender key in front, then is exactly
/// [`MAX_PACKET_SIZE`] bytes.
pub const PADDED_PAYLOAD_LEN: usize =
    MAX_PACKET_SIZE - MAGIC_LEN - KEY_LEN - disco_key::SEAL_OVERHEAD;

const PING_LEN: usize = TX_LEN + KEY_LEN;
const PONG_LEN: usize = TX_LEN + EP_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    Ping = 0x01,
    Pong = 0x02,
    CallMeMaybe = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Ping),
            0x02 => Ok(MessageType::Pong),
            0x03 => Ok(MessageType::CallMeMaybe),
            _ => Err(value),
        }
    }
}

/// Reports whether `p` looks like a disco message.
pub fn looks_like_disco_wrapper(p: &[u8]) -> bool {
    if p.len() < MAGIC_LEN + KEY_LEN + disco_key::SEAL_OVERHEAD {
        return false;
    }
    &p[..MAGIC_LEN] == MAGIC.as_bytes()
}

/// If `p` looks like a disco message it returns the sender's disco key and the sealed box.
pub fn source_and_box(p: &[u8]) -> Option<(DiscoPublicKey, &[u8])> {
    if !looks_like_disco_wrapper(p) {
        return None;
    }

    let source = &p[MAGIC_LEN..MAGIC_LEN + KEY_LEN];
    let sender: [u8; KEY_LEN] = source.try_into().ok()?;
    let sealed_box = &p[MAGIC_LEN + KEY_LEN..];
    Some((DiscoPublicKey::from_bytes(sender), sealed_box))
}

/// Seals `msg` for the owner of `shared` and prepends the wire header.
pub fn encode_message(sender: &DiscoPublicKey, shared: &SharedSecret, msg: &Message) -> Vec<u8> {
    let sealed = shared.seal(&msg.as_bytes());
    let mut out = Vec::with_capacity(MAGIC_LEN + KEY_LEN + sealed.len());
    out.extend_from_slice(MAGIC.as_bytes());
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(&sealed);
    out
}

/// Opens a sealed box received from the owner of `shared` and parses the message inside.
pub fn open_message(shared: &SharedSecret, sealed_box: &[u8]) -> Result<Message, ParseError> {
    let payload = shared.open(sealed_box).context(DecryptionSnafu)?;
    Message::from_bytes(&payload)
}

/// A discovery message.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Message {
    /// Asks the receiver to answer with a [`Pong`].
    #[display("Ping(tx={})", data_encoding::HEXLOWER.encode(&_0.tx_id))]
    Ping(Ping),
    /// The answer to a [`Ping`].
    #[display("Pong(tx={})", data_encoding::HEXLOWER.encode(&_0.tx_id))]
    Pong(Pong),
    /// Asks the receiver to ping the listed addresses.
    #[display("CallMeMaybe({})", _0)]
    CallMeMaybe(CallMeMaybe),
}

/// A ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Random client-generated per-ping transaction ID.
    pub tx_id: TransactionId,

    /// Allegedly the ping sender's node key.
    ///
    /// Lets the receiver tell which peer a disco key belongs to before it has seen the
    /// peer in the control plane. Older senders do not include it.
    pub node_key: Option<PublicKey>,
}

/// A response a [`Ping`].
///
/// It includes the sender's source IP + port, so it's effectively a STUN response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// The transaction id of the ping this answers.
    pub tx_id: TransactionId,
    /// The address the ping was received from, as seen by the pong's sender.
    pub src: SocketAddr,
}

/// Message sent only over the relay to request that the recipient try to open up a magicsock
/// path back to the sender.
///
/// The sender should've already sent UDP packets to the peer to open up the stateful
/// firewall mappings inbound.
///
/// The recipient may choose to not open a path back, if it's already happy with its path.
/// But usually it will.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMeMaybe {
    /// What the peer believes its endpoints are.
    pub my_numbers: Vec<SocketAddr>,
}

impl Display for CallMeMaybe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for addr in &self.my_numbers {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{addr}")?;
        }
        Ok(())
    }
}

impl Ping {
    fn from_bytes(ver: u8, p: &[u8]) -> Result<Self, ParseError> {
        ensure!(p.len() >= TX_LEN, TooShortSnafu);
        let tx_id: [u8; TX_LEN] = p[..TX_LEN].try_into().map_err(|_| TooShortSnafu.build())?;
        let tx_id = TransactionId::from(tx_id);

        // Version 0 pings may still carry the key, version 1 pings always do.
        let p = &p[TX_LEN..];
        if ver >= V1 {
            ensure!(p.len() >= KEY_LEN, TooShortSnafu);
        }
        let node_key = match p.get(..KEY_LEN) {
            Some(raw) => {
                let raw: [u8; KEY_LEN] = raw.try_into().map_err(|_| TooShortSnafu.build())?;
                // An all-zero key means the sender did not fill it in.
                (raw != [0u8; KEY_LEN])
                    .then(|| PublicKey::from_bytes(&raw).ok())
                    .flatten()
            }
            None => None,
        };

        Ok(Ping { tx_id, node_key })
    }

    fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + PADDED_PAYLOAD_LEN);
        out.push(MessageType::Ping as u8);
        out.push(V1);
        out.extend_from_slice(&self.tx_id);
        match self.node_key {
            Some(key) => out.extend_from_slice(key.as_bytes()),
            None => out.extend_from_slice(&[0u8; KEY_LEN]),
        }
        debug_assert_eq!(out.len(), HEADER_LEN + PING_LEN);
        out.resize(HEADER_LEN + PADDED_PAYLOAD_LEN, 0);
        out
    }
}

impl Pong {
    fn from_bytes(p: &[u8]) -> Result<Self, ParseError> {
        ensure!(p.len() >= PONG_LEN, TooShortSnafu);
        let tx_id: [u8; TX_LEN] = p[..TX_LEN].try_into().map_err(|_| TooShortSnafu.build())?;
        let tx_id = TransactionId::from(tx_id);
        let src = socket_addr_from_bytes(&p[TX_LEN..TX_LEN + EP_LENGTH])?;
        Ok(Pong { tx_id, src })
    }

    fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + PADDED_PAYLOAD_LEN);
        out.push(MessageType::Pong as u8);
        out.push(V1);
        out.extend_from_slice(&self.tx_id);
        out.extend_from_slice(&socket_addr_as_bytes(&self.src));
        debug_assert_eq!(out.len(), HEADER_LEN + PONG_LEN);
        out.resize(HEADER_LEN + PADDED_PAYLOAD_LEN, 0);
        out
    }
}

impl CallMeMaybe {
    fn from_bytes(p: &[u8]) -> Result<Self, ParseError> {
        ensure!(p.len() % EP_LENGTH == 0, InvalidAddressSnafu);

        let my_numbers = p
            .chunks_exact(EP_LENGTH)
            .map(socket_addr_from_bytes)
            .collect::<Result<_, _>>()?;

        Ok(CallMeMaybe { my_numbers })
    }

    fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.my_numbers.len() * EP_LENGTH);
        out.push(MessageType::CallMeMaybe as u8);
        out.push(V0);
        for addr in &self.my_numbers {
            out.extend_from_slice(&socket_addr_as_bytes(addr));
        }
        out
    }
}

impl Message {
    /// Parses a decrypted discovery payload.
    pub fn from_bytes(p: &[u8]) -> Result<Self, ParseError> {
        ensure!(p.len() >= HEADER_LEN, TooShortSnafu);

        let typ = MessageType::try_from(p[0]).map_err(|typ| UnknownMessageTypeSnafu { typ }.build())?;
        let version = p[1];
        let p = &p[HEADER_LEN..];
        match typ {
            MessageType::Ping => Ok(Message::Ping(Ping::from_bytes(version, p)?)),
            MessageType::Pong => Ok(Message::Pong(Pong::from_bytes(p)?)),
            MessageType::CallMeMaybe => Ok(Message::CallMeMaybe(CallMeMaybe::from_bytes(p)?)),
        }
    }

    /// Serialize this message to bytes, padded where needed.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Message::Ping(ping) => ping.as_bytes(),
            Message::Pong(pong) => pong.as_bytes(),
            Message::CallMeMaybe(cm) => cm.as_bytes(),
        }
    }
}

fn socket_addr_from_bytes(p: &[u8]) -> Result<SocketAddr, ParseError> {
    ensure!(p.len() == EP_LENGTH, InvalidAddressSnafu);
    let raw_ip: [u8; 16] = p[..16].try_into().map_err(|_| InvalidAddressSnafu.build())?;
    let raw_port: [u8; 2] = p[16..].try_into().map_err(|_| InvalidAddressSnafu.build())?;

    let src_ip = IpAddr::from(Ipv6Addr::from(raw_ip)).to_canonical();
    let src_port = u16::from_be_bytes(raw_port);
    Ok(SocketAddr::new(src_ip, src_port))
}

fn socket_addr_as_bytes(addr: &SocketAddr) -> [u8; EP_LENGTH] {
    let mut out = [0u8; EP_LENGTH];
    let ipv6 = match addr.ip() {
        IpAddr::V4(ipv4) => ipv4.to_ipv6_mapped(),
        IpAddr::V6(ipv6) => ipv6,
    };
    out[..16].copy_from_slice(&ipv6.octets());
    out[16..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Where a disco message or payload packet is sent to, or came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SendAddr {
    /// UDP, the ip addr.
    Udp(SocketAddr),
    /// Relay region.
    Relay(RegionId),
}

impl SendAddr {
    /// Returns if this is a `relay` addr.
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay(_))
    }

    /// Returns the relay region if this is a relay address.
    pub fn relay_region(&self) -> Option<RegionId> {
        match self {
            Self::Relay(region) => Some(*region),
            Self::Udp(_) => None,
        }
    }
}

impl From<SocketAddr> for SendAddr {
    fn from(addr: SocketAddr) -> Self {
        SendAddr::Udp(addr)
    }
}

impl Display for SendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendAddr::Relay(region) => write!(f, "Relay({region})"),
            SendAddr::Udp(addr) => write!(f, "UDP({addr})"),
        }
    }
}

/// Errors parsing a discovery message.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("message is too short"))]
    TooShort {},
    #[snafu(display("unknown message type {typ:#04x}"))]
    UnknownMessageType { typ: u8 },
    #[snafu(display("invalid address"))]
    InvalidAddress {},
    #[snafu(display("failed to open box"))]
    Decryption { source: meshsock_base::DecryptionError },
}
