//! Iterative FIND_NODE / FIND_VALUE / STORE.
//!
//! Each lookup owns its shortlist; the shortlist is never shared across
//! tasks. Rounds of up to `alpha` parallel RPCs run via a `JoinSet`, and the
//! shortlist is only mutated after a round's responses (or timeouts) are
//! all observed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::debug;

use crate::contact::Contact;
use crate::id::NodeId;
use crate::routing::RoutingTable;
use crate::rpc::{RpcLayer, RpcMethod, RpcOutcome};
use crate::transport::Transport;
use crate::wire::{
    DownlistRequest, FindNodeRequest, FindNodeResponse, FindValueRequest, FindValueResponse, Message,
    SenderInfo, SignedValue, StoreRequest,
};
use crate::{DhtError, Result, ALPHA, BETA, K, MIN_STORE_SUCCESS_FRACTION};

#[derive(Clone, Debug)]
struct LookupContact {
    contact: Contact,
    queried: bool,
}

/// Arguments for an iterative STORE.
pub struct StoreArgs {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub signed_value: Option<SignedValue>,
    pub public_key: Option<Vec<u8>>,
    pub signed_public_key: Option<Vec<u8>>,
    pub signed_request: Option<Vec<u8>>,
    pub ttl: u64,
    pub publish: bool,
}

/// Outcome of an iterative FIND_VALUE.
pub enum FindValueOutcome {
    Values { values: Vec<Vec<u8>>, cache_at: Vec<Contact> },
    AlternativeHolder(Contact),
    NotFound,
}

/// Drives iterative FIND_NODE / FIND_VALUE / STORE lookups against the
/// routing table and RPC layer.
pub struct LookupEngine<T: Transport + 'static> {
    rpc: Arc<RpcLayer<T>>,
    routing: Arc<Mutex<RoutingTable>>,
    self_contact: Contact,
    k: usize,
    alpha: usize,
    beta: usize,
}

impl<T: Transport + 'static> LookupEngine<T> {
    pub fn new(rpc: Arc<RpcLayer<T>>, routing: Arc<Mutex<RoutingTable>>, self_contact: Contact) -> Self {
        Self { rpc, routing, self_contact, k: K, alpha: ALPHA, beta: BETA }
    }

    fn seed_shortlist(&self, target: &NodeId) -> Vec<LookupContact> {
        let routing = self.routing.lock().expect("routing mutex poisoned");
        routing
            .k_closest(target, self.k, Some(&self.self_contact.id))
            .into_iter()
            .map(|contact| LookupContact { contact, queried: false })
            .collect()
    }

    fn peer_addr(contact: &Contact) -> Result<SocketAddr> {
        format!("{}:{}", contact.host_ip, contact.host_port)
            .parse()
            .map_err(|e| DhtError::InvalidArgument(format!("bad contact address: {e}")))
    }

    fn closest_unqueried(shortlist: &[LookupContact], target: &NodeId, alpha: usize) -> Vec<Contact> {
        let mut unqueried: Vec<&LookupContact> = shortlist.iter().filter(|c| !c.queried).collect();
        unqueried.sort_by_key(|c| target.distance(&c.contact.id));
        unqueried.into_iter().take(alpha).map(|c| c.contact.clone()).collect()
    }

    fn merge(shortlist: &mut Vec<LookupContact>, target: &NodeId, self_id: &NodeId, discovered: Vec<Contact>, k: usize) {
        for contact in discovered {
            if contact.id == *self_id {
                continue;
            }
            if !shortlist.iter().any(|c| c.contact.id == contact.id) {
                shortlist.push(LookupContact { contact, queried: false });
            }
        }
        shortlist.sort_by_key(|c| target.distance(&c.contact.id));
        shortlist.truncate(k);
    }

    fn mark_queried(shortlist: &mut [LookupContact], id: &NodeId) {
        if let Some(entry) = shortlist.iter_mut().find(|c| c.contact.id == *id) {
            entry.queried = true;
        }
    }

    fn mark_dead(&self, id: &NodeId) {
        let mut routing = self.routing.lock().expect("routing mutex poisoned");
        routing.remove(id, false);
    }

    /// Run a single round of up to `alpha` parallel FIND_NODE RPCs against
    /// `candidates`, returning (responder_id, response) pairs that actually
    /// answered and a list of candidate ids that failed.
    async fn dispatch_find_node_round(
        &self,
        target: &NodeId,
        candidates: &[Contact],
        is_bootstrap: bool,
    ) -> (Vec<(NodeId, FindNodeResponse)>, Vec<NodeId>) {
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let rpc = self.rpc.clone();
            let addr = match Self::peer_addr(candidate) {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let request = Message::FindNodeRequest(FindNodeRequest {
                sender: SenderInfo { contact: self.self_contact.clone() },
                key: target.to_bytes().to_vec(),
                is_bootstrap,
            });
            let id = candidate.id;
            tasks.spawn(async move {
                let outcome = rpc.call(addr, RpcMethod::FindNode, request).await;
                (id, outcome)
            });
        }

        let mut responses = Vec::new();
        let mut dead = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, outcome)) = joined else { continue };
            match outcome {
                RpcOutcome::Response(Message::FindNodeResponse(resp)) => responses.push((id, resp)),
                _ => dead.push(id),
            }
        }
        (responses, dead)
    }

    /// Iterative FIND_NODE(target): returns up to `k` contacts sorted by
    /// XOR distance to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        let mut shortlist = self.seed_shortlist(&target);
        // Attribution for downlist: who suggested a contact, and the last
        // known Contact record for everyone we have heard of.
        let mut suggested_by: HashMap<NodeId, NodeId> = HashMap::new();
        let mut known: HashMap<NodeId, Contact> = shortlist.iter().map(|c| (c.contact.id, c.contact.clone())).collect();
        let mut dead_ids: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        let mut best_distance = shortlist.first().map(|c| target.distance(&c.contact.id));

        loop {
            let candidates = Self::closest_unqueried(&shortlist, &target, self.alpha);
            if candidates.is_empty() {
                break;
            }

            let (_, dead) =
                self.run_find_node_round(&target, &candidates, false, &mut shortlist, &mut suggested_by, &mut known).await;
            for dead_id in &dead {
                self.mark_dead(dead_id);
                dead_ids.insert(*dead_id);
            }

            let current_best = shortlist.first().map(|c| target.distance(&c.contact.id));
            let improved = match (current_best, best_distance) {
                (Some(current), Some(best)) => current < best,
                (Some(_), None) => true,
                _ => false,
            };
            if !improved {
                let remaining: Vec<Contact> = shortlist.iter().filter(|c| !c.queried).map(|c| c.contact.clone()).collect();
                if !remaining.is_empty() {
                    let (_, final_dead) =
                        self.run_find_node_round(&target, &remaining, false, &mut shortlist, &mut suggested_by, &mut known).await;
                    for dead_id in &final_dead {
                        self.mark_dead(dead_id);
                        dead_ids.insert(*dead_id);
                    }
                }
                break;
            }
            best_distance = current_best;
        }

        self.send_downlists(&suggested_by, &known, &dead_ids).await;

        shortlist.sort_by_key(|c| target.distance(&c.contact.id));
        shortlist.truncate(self.k);
        Ok(shortlist.into_iter().map(|c| c.contact).collect())
    }

    /// Dispatch one round of FIND_NODE RPCs, merging responses into
    /// `shortlist` and recording suggester attribution for any newly
    /// discovered contact.
    #[allow(clippy::too_many_arguments)]
    async fn run_find_node_round(
        &self,
        target: &NodeId,
        candidates: &[Contact],
        is_bootstrap: bool,
        shortlist: &mut Vec<LookupContact>,
        suggested_by: &mut HashMap<NodeId, NodeId>,
        known: &mut HashMap<NodeId, Contact>,
    ) -> (Vec<(NodeId, FindNodeResponse)>, Vec<NodeId>) {
        let (responses, dead) = self.dispatch_find_node_round(target, candidates, is_bootstrap).await;
        for candidate in candidates {
            Self::mark_queried(shortlist, &candidate.id);
        }
        for (suggester_id, response) in &responses {
            for contact in &response.contacts {
                known.entry(contact.id).or_insert_with(|| contact.clone());
                suggested_by.entry(contact.id).or_insert(*suggester_id);
            }
            Self::merge(shortlist, target, &self.self_contact.id, response.contacts.clone(), self.k);
        }
        (responses, dead)
    }

    async fn send_downlists(
        &self,
        suggested_by: &HashMap<NodeId, NodeId>,
        known: &HashMap<NodeId, Contact>,
        dead_ids: &std::collections::HashSet<NodeId>,
    ) {
        let mut by_suggester: HashMap<NodeId, Vec<Contact>> = HashMap::new();
        for (suggested_id, suggester_id) in suggested_by {
            if !dead_ids.contains(suggested_id) {
                continue;
            }
            if let Some(contact) = known.get(suggested_id) {
                by_suggester.entry(*suggester_id).or_default().push(contact.clone());
            }
        }

        for (suggester_id, dead_contacts) in by_suggester {
            if dead_contacts.is_empty() {
                continue;
            }
            let suggester = self.routing.lock().expect("routing mutex poisoned").get(&suggester_id);
            let Some(suggester) = suggester else { continue };
            let Ok(addr) = Self::peer_addr(&suggester) else { continue };
            let request = Message::DownlistRequest(DownlistRequest {
                sender: SenderInfo { contact: self.self_contact.clone() },
                dead_contacts,
            });
            let _ = self.rpc.call(addr, RpcMethod::Downlist, request).await;
        }
    }

    /// Iterative FIND_VALUE(key): like FIND_NODE, but short-circuits on the
    /// first response carrying values or an alternative-holder signal.
    pub async fn find_value(&self, key: NodeId) -> Result<FindValueOutcome> {
        let mut shortlist = self.seed_shortlist(&key);
        let mut confirmations = 0usize;
        let mut best_distance = shortlist.first().map(|c| key.distance(&c.contact.id));

        loop {
            let candidates = Self::closest_unqueried(&shortlist, &key, self.alpha);
            if candidates.is_empty() {
                return Ok(FindValueOutcome::NotFound);
            }

            let mut tasks = JoinSet::new();
            for candidate in &candidates {
                let rpc = self.rpc.clone();
                let Ok(addr) = Self::peer_addr(candidate) else { continue };
                let request = Message::FindValueRequest(FindValueRequest {
                    sender: SenderInfo { contact: self.self_contact.clone() },
                    key: key.to_bytes().to_vec(),
                    is_bootstrap: false,
                });
                let id = candidate.id;
                tasks.spawn(async move {
                    let outcome = rpc.call(addr, RpcMethod::FindValue, request).await;
                    (id, outcome)
                });
            }
            for candidate in &candidates {
                Self::mark_queried(&mut shortlist, &candidate.id);
            }

            let mut nearest_non_holder: Option<Contact> = None;
            let mut discovered = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let Ok((id, outcome)) = joined else { continue };
                match outcome {
                    RpcOutcome::Response(Message::FindValueResponse(resp)) => {
                        if let Some(holder) = resp.alternative_value_holder {
                            return Ok(FindValueOutcome::AlternativeHolder(holder));
                        }
                        if !resp.values.is_empty() {
                            confirmations += 1;
                            if confirmations >= self.beta {
                                let cache_at = nearest_non_holder.into_iter().collect();
                                return Ok(FindValueOutcome::Values { values: resp.values, cache_at });
                            }
                        }
                        discovered.extend(resp.contacts.clone());
                        if nearest_non_holder.is_none() {
                            if let Some(contact) = shortlist.iter().find(|c| c.contact.id == id) {
                                nearest_non_holder = Some(contact.contact.clone());
                            }
                        }
                    }
                    _ => self.mark_dead(&id),
                }
            }

            Self::merge(&mut shortlist, &key, &self.self_contact.id, discovered, self.k);
            let current_best = shortlist.first().map(|c| key.distance(&c.contact.id));
            let improved = matches!((current_best, best_distance), (Some(c), Some(b)) if c < b);
            if !improved {
                return Ok(FindValueOutcome::NotFound);
            }
            best_distance = current_best;
        }
    }

    /// Iterative STORE: FIND_NODE(key) followed by parallel STORE RPCs to
    /// the resulting contacts. Succeeds iff at least
    /// `ceil(n * MIN_STORE_SUCCESS_FRACTION)` STOREs succeed.
    pub async fn store(&self, key: NodeId, args: StoreArgs) -> Result<()> {
        let contacts = self.find_node(key).await?;
        let attempted = contacts.len();
        let needed = (attempted as f64 * MIN_STORE_SUCCESS_FRACTION).ceil() as usize;

        let mut tasks = JoinSet::new();
        for contact in &contacts {
            let rpc = self.rpc.clone();
            let Ok(addr) = Self::peer_addr(contact) else { continue };
            let request = Message::StoreRequest(StoreRequest {
                sender: SenderInfo { contact: self.self_contact.clone() },
                key: args.key.clone(),
                value: args.value.clone(),
                signed_value: args.signed_value.clone(),
                public_key: args.public_key.clone(),
                signed_public_key: args.signed_public_key.clone(),
                signed_request: args.signed_request.clone(),
                ttl: args.ttl,
                publish: args.publish,
            });
            tasks.spawn(async move { rpc.call(addr, RpcMethod::Store, request).await });
        }

        let mut succeeded = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if let Ok(RpcOutcome::Response(Message::StoreResponse(resp))) = joined {
                if resp.ok {
                    succeeded += 1;
                }
            }
        }

        debug!(succeeded, attempted, needed, "iterative store complete");
        if succeeded >= needed {
            Ok(())
        } else {
            Err(DhtError::StoreQuorumFailed { succeeded, attempted, needed })
        }
    }
}
