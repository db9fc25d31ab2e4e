//! Server-side handlers for the seven RPC verbs.
//!
//! Every handler shares a preamble: the sender's claimed contact is merged
//! into the routing table (subject to the bucket's own full/split/evict
//! rules) before the request body is processed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use tracing::{debug, warn};

use crate::contact::Contact;
use crate::id::NodeId;
use crate::routing::{AddOutcome, RoutingTable};
use crate::store::DataStore;
use crate::wire::*;
use crate::{DhtError, Result, K};

/// An optional side-store consulted by FIND_VALUE before the local
/// `DataStore`, mirroring the original's `AlternativeStore` hook.
pub trait AlternativeStore: Send + Sync {
    fn has(&self, key: &[u8]) -> bool;
}

/// Verifies the signature chain on a STORE request. Kept as a trait so
/// `Service` can be tested without real Ed25519 keys.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Production verifier backed by `kad_crypto`.
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let Ok(verifying_key) = kad_crypto::ed25519::VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let signature = kad_crypto::ed25519::Signature::from_bytes(&sig_bytes);
        verifying_key.verify(message, &signature).is_ok()
    }
}

/// Handlers for PING, STORE, FIND_NODE, FIND_VALUE, DOWNLIST, BOOTSTRAP and
/// NAT_DETECTION_PING, backed by a routing table and a local value store.
pub struct Service<V: SignatureVerifier = Ed25519Verifier> {
    self_contact: Contact,
    routing: std::sync::Arc<std::sync::Mutex<RoutingTable>>,
    store: std::sync::Arc<DataStore>,
    alternative_store: Option<Box<dyn AlternativeStore>>,
    verifier: V,
    /// First signer recorded for each hashable key, granting exclusive
    /// write access to that key (§4.6 STORE, hashable-key rule).
    hashable_owners: StdMutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// Liveness checks owed on a bucket's least-recently-seen contact,
    /// queued by [`Service::note_sender`] for the node's background
    /// maintenance loop to act on (ping candidate; evict on timeout).
    pending_liveness: StdMutex<Vec<(NodeId, Contact)>>,
}

impl Service<Ed25519Verifier> {
    pub fn new(
        self_contact: Contact,
        routing: std::sync::Arc<std::sync::Mutex<RoutingTable>>,
        store: std::sync::Arc<DataStore>,
    ) -> Self {
        Self {
            self_contact,
            routing,
            store,
            alternative_store: None,
            verifier: Ed25519Verifier,
            hashable_owners: StdMutex::new(HashMap::new()),
            pending_liveness: StdMutex::new(Vec::new()),
        }
    }
}

impl<V: SignatureVerifier> Service<V> {
    pub fn with_verifier(
        self_contact: Contact,
        routing: std::sync::Arc<std::sync::Mutex<RoutingTable>>,
        store: std::sync::Arc<DataStore>,
        verifier: V,
    ) -> Self {
        Self {
            self_contact,
            routing,
            store,
            alternative_store: None,
            verifier,
            hashable_owners: StdMutex::new(HashMap::new()),
            pending_liveness: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_alternative_store(&mut self, alt: Box<dyn AlternativeStore>) {
        self.alternative_store = Some(alt);
    }

    /// Merge `sender`'s contact into the routing table. If the target
    /// bucket is full and not splittable, queues a liveness check on its
    /// least-recently-seen contact for [`Service::drain_pending_liveness_checks`].
    fn note_sender(&self, sender: &Contact) -> Option<(NodeId, Contact)> {
        if sender.id == self.self_contact.id {
            return None;
        }
        let mut routing = self.routing.lock().expect("routing mutex poisoned");
        match routing.add(sender.clone()) {
            AddOutcome::NeedsLivenessCheck { candidate, new_contact } => {
                let pair = (candidate.id, new_contact);
                self.pending_liveness.lock().expect("pending_liveness mutex poisoned").push(pair.clone());
                Some(pair)
            }
            _ => None,
        }
    }

    /// Drain all liveness checks queued since the last call. The caller
    /// (the node's background dispatch loop) should ping each `candidate`
    /// and, on timeout, evict it in favor of `new_contact`.
    pub fn drain_pending_liveness_checks(&self) -> Vec<(NodeId, Contact)> {
        std::mem::take(&mut self.pending_liveness.lock().expect("pending_liveness mutex poisoned"))
    }

    /// PING: reply `"pong"` only if the body is exactly `"ping"`.
    pub fn handle_ping(&self, request: PingRequest) -> PingResponse {
        self.note_sender(&request.sender.contact);
        if request.body == "ping" {
            PingResponse { ok: true, body: "pong".to_string() }
        } else {
            PingResponse { ok: false, body: String::new() }
        }
    }

    /// NAT_DETECTION_PING: same shape as PING, distinct literal.
    pub fn handle_nat_detection_ping(&self, request: NatDetectionPingRequest) -> NatDetectionPingResponse {
        self.note_sender(&request.sender.contact);
        if request.body == "nat_detection_ping" {
            NatDetectionPingResponse { ok: true, body: "nat_detection_pong".to_string() }
        } else {
            NatDetectionPingResponse { ok: false, body: String::new() }
        }
    }

    /// STORE: validate signatures (if present), enforce the hashable-key
    /// overwrite rule, and persist into the local `DataStore`.
    pub fn handle_store(&self, request: StoreRequest) -> StoreResponse {
        self.note_sender(&request.sender.contact);

        if request.value.is_none() && request.signed_value.is_none() {
            return StoreResponse { ok: false, reason: Some("neither value nor signed_value set".to_string()) };
        }

        if let Some(public_key) = &request.public_key {
            let signed_public_key = match &request.signed_public_key {
                Some(s) => s,
                None => return StoreResponse { ok: false, reason: Some("missing signed_public_key".to_string()) },
            };
            if !self.verifier.verify(public_key, public_key, signed_public_key) {
                return StoreResponse { ok: false, reason: Some("signed_public_key mismatch".to_string()) };
            }

            let signed_request = match &request.signed_request {
                Some(s) => s,
                None => return StoreResponse { ok: false, reason: Some("missing signed_request".to_string()) },
            };
            let mut preimage = Vec::new();
            preimage.extend_from_slice(public_key);
            preimage.extend_from_slice(signed_public_key);
            preimage.extend_from_slice(&request.key);
            let digest = kad_crypto::blake3::hash(&preimage);
            if !self.verifier.verify(public_key, &digest, signed_request) {
                return StoreResponse { ok: false, reason: Some("signed_request mismatch".to_string()) };
            }
        }

        if let Some(signed_value) = &request.signed_value {
            let Some(public_key) = &request.public_key else {
                return StoreResponse { ok: false, reason: Some("signed_value requires public_key".to_string()) };
            };
            if !self.verifier.verify(public_key, &signed_value.payload, &signed_value.signature) {
                return StoreResponse { ok: false, reason: Some("signed_value signature mismatch".to_string()) };
            }

            let serialized = serialize_signed_value(signed_value);
            let computed_key = kad_crypto::blake3::hash(&serialized);
            let is_hashable = computed_key == request.key;

            let mut owners = self.hashable_owners.lock().expect("hashable_owners mutex poisoned");
            if let Some(owner) = owners.get(&request.key) {
                // Key was already established as hashable: only the original
                // signer may re-assert it, and only with the identical
                // value — the key is cryptographically bound to its hash.
                let existing = self.store.load(&request.key);
                let unchanged = existing.iter().any(|v| v == &serialized);
                if owner != public_key || !unchanged {
                    return StoreResponse {
                        ok: false,
                        reason: Some("hashable key already owned by a different signer or value".to_string()),
                    };
                }
            } else if is_hashable {
                owners.insert(request.key.clone(), public_key.clone());
            }
            drop(owners);

            self.store.store(&request.key, &serialized, request.ttl, request.publish);
            return StoreResponse { ok: true, reason: None };
        }

        let value = request.value.expect("checked above");
        self.store.store(&request.key, &value, request.ttl, request.publish);
        StoreResponse { ok: true, reason: None }
    }

    /// FIND_NODE: reply with the k contacts closest to `key`, excluding the
    /// sender. If `is_bootstrap`, include our opinion of the requester's
    /// external address.
    pub fn handle_find_node(&self, request: FindNodeRequest, observed: SocketAddr) -> FindNodeResponse {
        self.note_sender(&request.sender.contact);
        let target = key_to_node_id(&request.key);
        let routing = self.routing.lock().expect("routing mutex poisoned");
        let contacts = routing.k_closest(&target, K, Some(&request.sender.contact.id));

        let requester_ext_addr = if request.is_bootstrap {
            Some((observed.ip().to_string(), observed.port()))
        } else {
            None
        };

        FindNodeResponse { contacts, requester_ext_addr }
    }

    /// FIND_VALUE: prefer the alternative store's signal, then the local
    /// value store, falling back to FIND_NODE-style routing.
    pub fn handle_find_value(&self, request: FindValueRequest, observed: SocketAddr) -> FindValueResponse {
        self.note_sender(&request.sender.contact);

        if let Some(alt) = &self.alternative_store {
            if alt.has(&request.key) {
                return FindValueResponse {
                    values: vec![],
                    contacts: vec![],
                    alternative_value_holder: Some(self.self_contact.clone()),
                };
            }
        }

        let values = self.store.load(&request.key);
        if !values.is_empty() {
            return FindValueResponse { values, contacts: vec![], alternative_value_holder: None };
        }

        let find_node_response = self.handle_find_node(
            FindNodeRequest {
                sender: request.sender,
                key: request.key,
                is_bootstrap: request.is_bootstrap,
            },
            observed,
        );
        FindValueResponse {
            values: vec![],
            contacts: find_node_response.contacts,
            alternative_value_holder: None,
        }
    }

    /// DOWNLIST: every reported-dead contact present in the routing table
    /// is returned so the caller can ping-and-evict asynchronously; the
    /// protocol itself responds immediately without waiting on those pings.
    pub fn handle_downlist(&self, request: DownlistRequest) -> (DownlistResponse, Vec<Contact>) {
        self.note_sender(&request.sender.contact);
        let routing = self.routing.lock().expect("routing mutex poisoned");
        let present: Vec<Contact> = request
            .dead_contacts
            .into_iter()
            .filter(|c| routing.get(&c.id).is_some())
            .collect();
        (DownlistResponse { ok: true }, present)
    }

    /// BOOTSTRAP: record the newcomer's observed external endpoint; NAT-type
    /// inference itself (§4.9) is orchestrated by the node, not this handler.
    pub fn handle_bootstrap(&self, request: BootstrapRequest, observed: SocketAddr, nat_type: u8) -> BootstrapResponse {
        debug!(newcomer = %request.newcomer_id, observed = %observed, "bootstrap request");
        if !(1..=3).contains(&nat_type) {
            warn!(nat_type, "unexpected nat_type passed to handle_bootstrap");
        }
        BootstrapResponse {
            responder_id: self.self_contact.id,
            nat_type,
            observed_ext_ip: observed.ip().to_string(),
            observed_ext_port: observed.port(),
        }
    }
}

fn key_to_node_id(key: &[u8]) -> NodeId {
    let bytes: [u8; crate::id::ID_LEN] =
        key.try_into().expect("routing key is already a 512-bit id");
    NodeId::from_bytes(bytes)
}

fn serialize_signed_value(value: &SignedValue) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).unwrap_or_default();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use std::sync::{Arc, Mutex};

    fn self_contact() -> Contact {
        Contact::new(NodeId::random(), "127.0.0.1".to_string(), 9000, "10.0.0.1".to_string(), 9000)
    }

    fn make_service() -> Service {
        let self_c = self_contact();
        let routing = Arc::new(Mutex::new(RoutingTable::new(self_c.id)));
        let store = Arc::new(DataStore::new());
        Service::new(self_c, routing, store)
    }

    fn sender_info() -> SenderInfo {
        SenderInfo {
            contact: Contact::new(NodeId::random(), "127.0.0.1".to_string(), 9001, "10.0.0.1".to_string(), 9001),
        }
    }

    #[test]
    fn test_ping_correct_body() {
        let svc = make_service();
        let resp = svc.handle_ping(PingRequest { sender: sender_info(), body: "ping".to_string() });
        assert!(resp.ok);
        assert_eq!(resp.body, "pong");
    }

    #[test]
    fn test_ping_wrong_body_fails() {
        let svc = make_service();
        let resp = svc.handle_ping(PingRequest { sender: sender_info(), body: "hello".to_string() });
        assert!(!resp.ok);
    }

    #[test]
    fn test_store_unsigned_value() {
        let svc = make_service();
        let resp = svc.handle_store(StoreRequest {
            sender: sender_info(),
            key: b"key".to_vec(),
            value: Some(b"value".to_vec()),
            signed_value: None,
            public_key: None,
            signed_public_key: None,
            signed_request: None,
            ttl: 3600,
            publish: true,
        });
        assert!(resp.ok);
        assert_eq!(svc.store.load(b"key"), vec![b"value".to_vec()]);
    }

    #[test]
    fn test_store_rejects_empty_value() {
        let svc = make_service();
        let resp = svc.handle_store(StoreRequest {
            sender: sender_info(),
            key: b"key".to_vec(),
            value: None,
            signed_value: None,
            public_key: None,
            signed_public_key: None,
            signed_request: None,
            ttl: 3600,
            publish: true,
        });
        assert!(!resp.ok);
    }

    #[test]
    fn test_find_node_excludes_sender() {
        let svc = make_service();
        let sender = sender_info();
        svc.note_sender(&sender.contact);
        let target = NodeId::random().to_bytes().to_vec();
        let resp = svc.handle_find_node(
            FindNodeRequest { sender: sender.clone(), key: target, is_bootstrap: false },
            "127.0.0.1:1".parse().expect("valid addr"),
        );
        assert!(resp.contacts.iter().all(|c| c.id != sender.contact.id));
    }

    #[test]
    fn test_find_node_bootstrap_includes_observed_addr() {
        let svc = make_service();
        let target = NodeId::random().to_bytes().to_vec();
        let resp = svc.handle_find_node(
            FindNodeRequest { sender: sender_info(), key: target, is_bootstrap: true },
            "203.0.113.5:4242".parse().expect("valid addr"),
        );
        assert_eq!(resp.requester_ext_addr, Some(("203.0.113.5".to_string(), 4242)));
    }

    #[test]
    fn test_find_value_returns_stored_value() {
        let svc = make_service();
        let key = NodeId::random().to_bytes();
        svc.store.store(&key, b"value", 3600, true);
        let resp = svc.handle_find_value(
            FindValueRequest { sender: sender_info(), key: key.to_vec(), is_bootstrap: false },
            "127.0.0.1:1".parse().expect("valid addr"),
        );
        assert_eq!(resp.values, vec![b"value".to_vec()]);
    }

    #[test]
    fn test_find_value_falls_back_to_contacts() {
        let svc = make_service();
        let key = NodeId::random().to_bytes().to_vec();
        let resp = svc.handle_find_value(
            FindValueRequest { sender: sender_info(), key, is_bootstrap: false },
            "127.0.0.1:1".parse().expect("valid addr"),
        );
        assert!(resp.values.is_empty());
        assert!(resp.alternative_value_holder.is_none());
    }

    #[test]
    fn test_downlist_reports_present_contacts() {
        let svc = make_service();
        let dead = sender_info().contact;
        svc.note_sender(&dead);
        let (resp, present) = svc.handle_downlist(DownlistRequest { sender: sender_info(), dead_contacts: vec![dead.clone()] });
        assert!(resp.ok);
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].id, dead.id);
    }

    fn signed_store_request(
        keypair: &kad_crypto::ed25519::KeyPair,
        payload: &[u8],
        ttl: u64,
    ) -> StoreRequest {
        let public_key = keypair.verifying_key.to_bytes().to_vec();
        let signed_public_key = keypair.signing_key.sign(&public_key).to_bytes().to_vec();
        let payload_signature = keypair.signing_key.sign(payload).to_bytes().to_vec();
        let signed_value = SignedValue { payload: payload.to_vec(), signature: payload_signature };
        let serialized = serialize_signed_value(&signed_value);
        let key = kad_crypto::blake3::hash(&serialized).to_vec();

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&public_key);
        preimage.extend_from_slice(&signed_public_key);
        preimage.extend_from_slice(&key);
        let signed_request = keypair.signing_key.sign(&kad_crypto::blake3::hash(&preimage)).to_bytes().to_vec();

        StoreRequest {
            sender: sender_info(),
            key,
            value: None,
            signed_value: Some(signed_value),
            public_key: Some(public_key),
            signed_public_key: Some(signed_public_key),
            signed_request: Some(signed_request),
            ttl,
            publish: true,
        }
    }

    #[test]
    fn test_signed_store_without_public_key_rejected() {
        let svc = make_service();
        let resp = svc.handle_store(StoreRequest {
            sender: sender_info(),
            key: b"v4".to_vec(),
            value: None,
            signed_value: Some(SignedValue { payload: b"v4".to_vec(), signature: vec![0u8; 64] }),
            public_key: None,
            signed_public_key: None,
            signed_request: None,
            ttl: 3600,
            publish: true,
        });
        assert!(!resp.ok);
    }

    #[test]
    fn test_signed_store_accepted_with_matching_public_key() {
        let svc = make_service();
        let keypair = kad_crypto::ed25519::KeyPair::generate();
        let req = signed_store_request(&keypair, b"v4", 3600);
        let resp = svc.handle_store(req);
        assert!(resp.ok);
    }

    #[test]
    fn test_signed_store_with_mismatched_public_key_rejected() {
        let svc = make_service();
        let signer = kad_crypto::ed25519::KeyPair::generate();
        let mut req = signed_store_request(&signer, b"v4", 3600);
        // Substitute a different signer's public key after the fact: the
        // request's signatures no longer verify against it.
        let other = kad_crypto::ed25519::KeyPair::generate();
        req.public_key = Some(other.verifying_key.to_bytes().to_vec());
        let resp = svc.handle_store(req);
        assert!(!resp.ok);
    }

    #[test]
    fn test_hashable_key_rejects_overwrite_by_different_signer() {
        let svc = make_service();
        let owner = kad_crypto::ed25519::KeyPair::generate();
        let original = signed_store_request(&owner, b"v4", 3600);
        assert!(svc.handle_store(original.clone()).ok);

        // A different signer cannot store a different value under the same
        // hashable key, even with a validly self-signed request.
        let attacker = kad_crypto::ed25519::KeyPair::generate();
        let mut forged = signed_store_request(&attacker, b"v4-forged", 3600);
        forged.key = original.key.clone();
        let resp = svc.handle_store(forged);
        assert!(!resp.ok);
    }

    #[test]
    fn test_hashable_key_same_signer_same_value_allowed() {
        let svc = make_service();
        let owner = kad_crypto::ed25519::KeyPair::generate();
        let original = signed_store_request(&owner, b"v4", 3600);
        assert!(svc.handle_store(original.clone()).ok);

        // Republishing the identical value under the same key is fine.
        let resp = svc.handle_store(original);
        assert!(resp.ok);
    }

    #[test]
    fn test_bootstrap_response_carries_observed_address() {
        let svc = make_service();
        let req = BootstrapRequest {
            newcomer_id: NodeId::random(),
            newcomer_local_ip: "10.0.0.5".to_string(),
            newcomer_local_port: 9000,
            claimed_ext_ip: "0.0.0.0".to_string(),
            claimed_ext_port: 0,
        };
        let resp = svc.handle_bootstrap(req, "198.51.100.9:5000".parse().expect("valid addr"), 1);
        assert_eq!(resp.observed_ext_ip, "198.51.100.9");
        assert_eq!(resp.observed_ext_port, 5000);
        assert_eq!(resp.nat_type, 1);
    }
}
