//! Peer endpoint triples and liveness accounting.

use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::FAILED_RPC_LIMIT;

/// A peer's identifier and reachable endpoints.
///
/// Two contacts are considered equal if either their ids match or their
/// external `(host_ip, host_port)` match — a peer that churns its id while
/// keeping the same endpoint (or vice versa) is still "the same contact"
/// for routing-table bookkeeping purposes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's 512-bit identifier.
    pub id: NodeId,
    /// External (internet-routable) host address.
    pub host_ip: String,
    /// External host port.
    pub host_port: u16,
    /// Local (LAN) host address, used when two peers share a NAT.
    pub local_ip: String,
    /// Local host port.
    pub local_port: u16,
    /// Rendezvous peer's address, if this contact is known to be behind NAT.
    pub rendezvous_ip: Option<String>,
    /// Rendezvous peer's port.
    pub rendezvous_port: Option<u16>,
    /// Unix timestamp (seconds) this contact was last confirmed live.
    pub last_seen: u64,
    /// Consecutive failed RPCs since the last successful response.
    pub failed_rpc_count: u16,
}

impl Contact {
    /// Construct a new contact with zero failures and `last_seen = now`.
    pub fn new(id: NodeId, host_ip: String, host_port: u16, local_ip: String, local_port: u16) -> Self {
        Self {
            id,
            host_ip,
            host_port,
            local_ip,
            local_port,
            rendezvous_ip: None,
            rendezvous_port: None,
            last_seen: now_secs(),
            failed_rpc_count: 0,
        }
    }

    /// Whether this contact has accumulated enough failures to be
    /// considered unreliable (`failed_rpc_count >= FAILED_RPC_LIMIT`).
    pub fn is_stale(&self) -> bool {
        self.failed_rpc_count >= FAILED_RPC_LIMIT
    }

    /// Mark the contact as freshly confirmed live: reset failures, bump
    /// `last_seen` to now.
    pub fn touch(&mut self) {
        self.last_seen = now_secs();
        self.failed_rpc_count = 0;
    }

    /// Record a failed RPC.
    pub fn mark_failed(&mut self) {
        self.failed_rpc_count = self.failed_rpc_count.saturating_add(1);
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || (self.host_ip == other.host_ip && self.host_port == other.host_port)
    }
}

impl Eq for Contact {}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
