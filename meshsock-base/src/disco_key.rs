//! Keys of the discovery protocol.
//!
//! A node's disco key is separate from its identity key and may be rotated. Disco
//! messages between two nodes are sealed with a box derived from one side's secret and
//! the other side's public disco key.

use std::fmt::{Debug, Display};

use crypto_box::aead::{Aead, AeadCore, OsRng};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu, ensure};

/// Length of a disco key, in bytes.
pub const KEY_LEN: usize = 32;
/// Length of the nonce prefixed to every sealed box.
pub const NONCE_LEN: usize = 24;
/// Bytes added by sealing: the nonce plus the authentication tag.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + 16;

/// Public half of a disco key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoPublicKey([u8; KEY_LEN]);

impl DiscoPublicKey {
    /// Constructs the key from its raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short form for logging.
    pub fn fmt_short(&self) -> impl Display + Copy + 'static {
        DiscoShort([self.0[0], self.0[1], self.0[2], self.0[3], self.0[4]])
    }
}

#[derive(Clone, Copy)]
struct DiscoShort([u8; 5]);

impl Display for DiscoShort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d:{}", data_encoding::BASE32_NOPAD_NOCASE.encode(&self.0))
    }
}

impl Debug for DiscoPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DiscoPublicKey({})", self.fmt_short())
    }
}

impl Display for DiscoPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl From<[u8; KEY_LEN]> for DiscoPublicKey {
    fn from(value: [u8; KEY_LEN]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for DiscoPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Secret half of a disco key.
#[derive(Clone)]
pub struct DiscoSecretKey(crypto_box::SecretKey);

impl Debug for DiscoSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DiscoSecretKey(..)")
    }
}

impl From<[u8; KEY_LEN]> for DiscoSecretKey {
    fn from(value: [u8; KEY_LEN]) -> Self {
        Self(crypto_box::SecretKey::from(value))
    }
}

impl DiscoSecretKey {
    /// Generates a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self(crypto_box::SecretKey::generate(&mut OsRng))
    }

    /// Returns the public key for this secret key.
    pub fn public(&self) -> DiscoPublicKey {
        DiscoPublicKey(*self.0.public_key().as_bytes())
    }

    /// Returns the box shared between this key and `other`.
    pub fn shared(&self, other: &DiscoPublicKey) -> SharedSecret {
        let other = crypto_box::PublicKey::from(other.0);
        SharedSecret(crypto_box::ChaChaBox::new(&other, &self.0))
    }

    /// Raw bytes of the secret.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }
}

/// The box shared by two disco keys.
pub struct SharedSecret(crypto_box::ChaChaBox);

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret(crypto_box::ChaChaBox)")
    }
}

/// Errors from [`SharedSecret::open`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DecryptionError {
    /// The sealed box is shorter than its nonce and tag.
    #[snafu(display("sealed box too short"))]
    TooShort {},
    /// Authentication failed.
    #[snafu(display("decryption failed"))]
    Aead {},
}

impl SharedSecret {
    /// Seals `cleartext`, returning the nonce followed by the ciphertext.
    pub fn seal(&self, cleartext: &[u8]) -> Vec<u8> {
        let nonce = crypto_box::ChaChaBox::generate_nonce(&mut OsRng);
        let ciphertext = self
            .0
            .encrypt(&nonce, cleartext)
            .expect("encryption failed");

        let mut res = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        res.extend_from_slice(&nonce);
        res.extend(ciphertext);
        res
    }

    /// Opens a box created by [`Self::seal`], returning the cleartext.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        ensure!(sealed.len() >= SEAL_OVERHEAD, TooShortSnafu);

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = crypto_box::aead::Nonce::<crypto_box::ChaChaBox>::from_slice(nonce);
        self.0
            .decrypt(nonce, ciphertext)
            .map_err(|_| AeadSnafu.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key_a = DiscoSecretKey::generate();
        let key_b = DiscoSecretKey::generate();

        let msg = b"super secret message!!!!";
        let sealed = key_a.shared(&key_b.public()).seal(msg);
        assert_eq!(sealed.len(), msg.len() + SEAL_OVERHEAD);

        let opened = key_b.shared(&key_a.public()).open(&sealed).unwrap();
        assert_eq!(&opened[..], &msg[..]);
    }

    #[test]
    fn test_open_wrong_key() {
        let key_a = DiscoSecretKey::generate();
        let key_b = DiscoSecretKey::generate();
        let key_c = DiscoSecretKey::generate();

        let sealed = key_a.shared(&key_b.public()).seal(b"hello");
        let err = key_c.shared(&key_a.public()).open(&sealed).unwrap_err();
        assert!(matches!(err, DecryptionError::Aead { .. }));

        let err = key_b.shared(&key_a.public()).open(&sealed[..10]).unwrap_err();
        assert!(matches!(err, DecryptionError::TooShort { .. }));
    }

    #[test]
    fn test_public_from_bytes() {
        let key = DiscoSecretKey::generate();
        let public = key.public();
        let back = DiscoPublicKey::from(*public.as_bytes());
        assert_eq!(public, back);
        let secret_back = DiscoSecretKey::from(key.to_bytes());
        assert_eq!(secret_back.public(), public);
    }
}
