//! # kad-crypto
//!
//! Cryptographic primitives for the Kademlia DHT node: hashing and signing.
//! The DHT core treats these as an external collaborator (the wire protocol
//! does not mandate a specific suite) but a rewrite needs something concrete
//! to sign STOREs and derive content-addressed keys against.
//!
//! ## Modules
//!
//! - [`blake3`] — general-purpose hashing, used to derive 512-bit node/value ids
//! - [`ed25519`] — signing and verification for signed STORE values

pub mod blake3;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
