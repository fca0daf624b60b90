//! Base types for meshsock: node identities and discovery keys.
#![cfg_attr(meshsock_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod disco_key;
pub mod key;

pub use self::{
    disco_key::{DecryptionError, DiscoPublicKey, DiscoSecretKey, SharedSecret},
    key::{KeyParsingError, PeerId, PublicKey, SecretKey},
};
