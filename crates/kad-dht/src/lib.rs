//! # kad-dht
//!
//! Core of a Kademlia-style distributed hash table: a 512-bit keyspace
//! overlay with a routing table biased toward close peers by XOR distance,
//! an iterative lookup engine, and a local value store with TTL/republish/
//! refresh semantics.
//!
//! ## Modules
//!
//! - [`id`] — 512-bit `NodeId` algebra
//! - [`contact`] — peer endpoint triples and liveness accounting
//! - [`bucket`] — k-bucket: bounded, LRU-ordered contact list
//! - [`routing`] — bucket-tree routing table, split/evict/k-closest
//! - [`store`] — local value store with TTL, republish, refresh
//! - [`wire`] — typed wire records, CBOR-encoded
//! - [`transport`] — UDP datagram transport
//! - [`rpc`] — request/response correlation and timeouts
//! - [`service`] — server-side handlers for the seven RPC verbs
//! - [`lookup`] — iterative FIND_NODE / FIND_VALUE / STORE
//! - [`node`] — lifecycle: join, bootstrap, NAT inference, leave
//! - [`scheduler`] — timer wheel for sweeps and RPC timeouts

pub mod bucket;
pub mod contact;
pub mod id;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;
pub mod wire;

/// Default bucket size / replication factor (`k`).
pub const K: usize = 16;

/// Lookup parallelism factor (`alpha`).
pub const ALPHA: usize = 3;

/// Number of successful value responses before short-circuiting a FIND_VALUE (`beta`).
pub const BETA: usize = 1;

/// Bucket and value refresh interval in seconds.
pub const T_REFRESH_SECS: u64 = 3600;

/// Republish interval in seconds.
pub const T_REPUBLISH_SECS: u64 = 86400;

/// DataStore expiry sweep interval in seconds.
pub const T_EXPIRE_SWEEP_SECS: u64 = 60;

/// Number of consecutive failed RPCs before a contact is considered stale.
pub const FAILED_RPC_LIMIT: u16 = 2;

/// Minimum fraction of the k target contacts that must accept a STORE
/// for an iterative store to be reported successful.
pub const MIN_STORE_SUCCESS_FRACTION: f64 = 0.5;

/// Default RPC timeout in seconds.
pub const RPC_TIMEOUT_SECS: u64 = 5;

/// PING / NAT-PING timeout in seconds.
pub const PING_TIMEOUT_SECS: u64 = 3;

/// Bootstrap-probe FIND_NODE timeout in seconds.
pub const BOOTSTRAP_PROBE_TIMEOUT_SECS: u64 = 7;

/// BOOTSTRAP RPC timeout in seconds.
pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 20;

/// NAT-detection type-2 (relayed) timeout in seconds.
pub const NAT_DETECTION_RELAY_TIMEOUT_SECS: u64 = 18;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// A `NodeId`, range, or power argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted before `Node::join` completed.
    #[error("node has not joined the network")]
    NotJoined,

    /// All bootstrap contacts refused or timed out.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// A cryptographic check failed in a STORE request.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// The underlying transport reported the peer unreachable.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// An RPC deadline elapsed without a response.
    #[error("rpc timed out")]
    TimedOut,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An iterative STORE produced fewer than the minimum successful replies.
    #[error("store quorum failed: {succeeded}/{attempted} succeeded, needed {needed}")]
    StoreQuorumFailed {
        /// Number of STOREs that succeeded.
        succeeded: usize,
        /// Number of STOREs attempted.
        attempted: usize,
        /// Minimum number of successes required.
        needed: usize,
    },

    /// An iterative FIND_VALUE ended with no values and no alternative holder.
    #[error("value not found")]
    ValueNotFound,

    /// Record (de)serialization failure on the wire.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local I/O failure (socket bind, hint-file read/write).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic error from `kad_crypto`.
    #[error("crypto error: {0}")]
    Crypto(#[from] kad_crypto::CryptoError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
