//! Node identity keys.
//!
//! A [`PublicKey`] identifies a mesh member. It never changes for the lifetime of that
//! member, so it is used as the map key everywhere peers are tracked.

use std::{
    borrow::Borrow,
    cmp::{Ord, PartialOrd},
    fmt::{Debug, Display},
    hash::Hash,
    ops::Deref,
    str::FromStr,
};

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{SigningKey, VerifyingKey};
use nested_enum_utils::common_fields;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu, ensure};

/// A public key identifying a node.
///
/// Stored as the compressed Edwards y coordinate. It is checked to decompress into a
/// valid point when created from untrusted bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PublicKey(CompressedEdwardsY);

/// The identity of a peer in the mesh.
///
/// This is the same as [`PublicKey`]. `PublicKey` is used when talking about
/// cryptography, `PeerId` when talking about routing to a peer.
pub type PeerId = PublicKey;

impl Borrow<[u8; 32]> for PublicKey {
    fn borrow(&self) -> &[u8; 32] {
        self.as_bytes()
    }
}

impl Deref for PublicKey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.as_bytes().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 32] = serde::Deserialize::deserialize(deserializer)?;
            Self::from_bytes(&data).map_err(serde::de::Error::custom)
        }
    }
}

impl PublicKey {
    /// The length of a `PublicKey`, in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Constructs a `PublicKey` from raw bytes.
    ///
    /// Fails if the bytes are not a valid ed25519 point. Never fails for bytes
    /// returned from [`Self::as_bytes`].
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let key = VerifyingKey::from_bytes(bytes).context(InvalidKeySnafu)?;
        Ok(Self(CompressedEdwardsY(key.to_bytes())))
    }

    /// A short, human readable form of the key: the first 5 bytes, base32 encoded.
    ///
    /// Used in logs.
    pub fn fmt_short(&self) -> impl Display + Copy + 'static {
        let mut short = [0u8; 5];
        short.copy_from_slice(&self.0.as_bytes()[..5]);
        PublicKeyShort(short)
    }
}

#[derive(Clone, Copy)]
struct PublicKeyShort([u8; 5]);

impl Display for PublicKeyShort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        data_encoding::BASE32_NOPAD_NOCASE.encode_write(&self.0, f)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyParsingError;

    #[inline]
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeInvalidLengthSnafu.build())?;
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (short, rest) = self.as_bytes().split_at(5);
        write!(
            f,
            "{}-{}",
            data_encoding::BASE32_NOPAD_NOCASE.encode(short),
            data_encoding::BASE32_NOPAD_NOCASE.encode(rest)
        )
    }
}

/// Error when parsing a [`PublicKey`] or a [`SecretKey`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum KeyParsingError {
    /// The string was not valid base32.
    #[snafu(display("invalid base32"))]
    FailedToDecodeBase32 { source: data_encoding::DecodeError },
    /// The bytes are not a valid key.
    #[snafu(display("invalid key"))]
    InvalidKey { source: ed25519_dalek::SignatureError },
    /// The encoded information had the wrong length.
    #[snafu(display("invalid length"))]
    DecodeInvalidLength {},
}

/// Parses a [`PublicKey`] from the format produced by [`Display`].
impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_base32(s)?;
        Self::from_bytes(&bytes)
    }
}

/// A secret key.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl Display for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            data_encoding::BASE32_NOPAD_NOCASE.encode(&self.to_bytes())
        )
    }
}

impl FromStr for SecretKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_base32(s)?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secret = SigningKey::deserialize(deserializer)?;
        Ok(Self(secret))
    }
}

impl SecretKey {
    /// The public key of this [`SecretKey`].
    pub fn public(&self) -> PublicKey {
        PublicKey(CompressedEdwardsY(self.0.verifying_key().to_bytes()))
    }

    /// Generates a new [`SecretKey`] from a cryptographically secure RNG.
    ///
    /// ```rust
    /// let _key = meshsock_base::SecretKey::generate(&mut rand::rngs::OsRng);
    /// ```
    pub fn generate<R: CryptoRngCore + ?Sized>(csprng: &mut R) -> Self {
        Self(SigningKey::generate(csprng))
    }

    /// The bytes of the secret part. The public part can always be recovered.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Creates a secret key from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }
}

impl From<[u8; 32]> for SecretKey {
    fn from(value: [u8; 32]) -> Self {
        Self::from_bytes(&value)
    }
}

fn decode_base32(s: &str) -> Result<[u8; 32], KeyParsingError> {
    let mut bytes = [0u8; 32];
    let input = s.replace('-', "").to_ascii_uppercase();
    let len = data_encoding::BASE32_NOPAD
        .decode_len(input.len())
        .context(FailedToDecodeBase32Snafu)?;
    ensure!(len == 32, DecodeInvalidLengthSnafu);
    data_encoding::BASE32_NOPAD
        .decode_mut(input.as_bytes(), &mut bytes)
        .map_err(|partial| partial.error)
        .context(FailedToDecodeBase32Snafu)?;
    Ok(bytes)
}
