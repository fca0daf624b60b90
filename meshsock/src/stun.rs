//! Recognising STUN packets on the shared UDP sockets.
//!
//! Encoding and decoding of STUN is the business of the [`NetReporter`]; the path manager
//! only needs to tell STUN replies apart from disco and payload packets so it can hand them
//! over.
//!
//! [`NetReporter`]: crate::net_report::NetReporter

pub use stun_rs::TransactionId;

// Copied from stun_rs
// const MAGIC_COOKIE: Cookie = Cookie(0x2112_A442);
const COOKIE: [u8; 4] = 0x2112_A442u32.to_be_bytes();

/// Reports whether `b` is a STUN message.
pub fn is(b: &[u8]) -> bool {
    b.len() >= stun_rs::MESSAGE_HEADER_SIZE &&
        b[0] & 0b11000000 == 0 && // top two bits must be zero
        b[4..8] == COOKIE
}
