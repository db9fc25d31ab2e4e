//! Node lifecycle: join, bootstrap, NAT-type inference, leave, and the
//! periodic maintenance tasks that keep the DataStore and RoutingTable
//! healthy while joined.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::contact::Contact;
use crate::id::NodeId;
use crate::lookup::{LookupEngine, StoreArgs};
use crate::routing::RoutingTable;
use crate::rpc::{RpcLayer, RpcMethod, RpcOutcome};
use crate::scheduler::{Scheduler, TaskId};
use crate::service::Service;
use crate::store::DataStore;
use crate::transport::{Transport, UdpTransport};
use crate::wire::{BootstrapRequest, BootstrapResponse, Message, PingRequest, SenderInfo};
use crate::{DhtError, Result, K, T_EXPIRE_SWEEP_SECS, T_REFRESH_SECS};

/// Sentinel id advertised by a client-mode node: it performs lookups and
/// stores but is excluded from peers' routing tables.
pub fn client_sentinel_id() -> NodeId {
    NodeId::zero()
}

/// Configuration for [`Node::join`].
pub struct JoinConfig {
    /// This node's id, or `None` to generate a random one (ignored in
    /// client mode, where the sentinel id is always used).
    pub node_id: Option<NodeId>,
    /// Local UDP bind address.
    pub bind_addr: SocketAddr,
    /// Advertised external address, if already known (e.g. via port forwarding).
    pub known_ext_addr: Option<SocketAddr>,
    /// Whether this node is client-only (see §4.9).
    pub client_mode: bool,
}

/// A joined (or joining) DHT participant: owns the transport, routing
/// table, value store, RPC layer, lookup engine and maintenance scheduler.
pub struct Node<T: Transport + 'static = UdpTransport> {
    self_contact: Arc<Mutex<Contact>>,
    routing: Arc<Mutex<RoutingTable>>,
    store: Arc<DataStore>,
    transport: Arc<T>,
    rpc: Arc<RpcLayer<T>>,
    lookup: Arc<LookupEngine<T>>,
    service: Arc<Mutex<Service>>,
    scheduler: Scheduler,
    client_mode: bool,
    joined: Mutex<bool>,
    nat_type: Mutex<Option<u8>>,
    periodic_task_ids: Mutex<Vec<TaskId>>,
    serve_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node<UdpTransport> {
    /// Bind the UDP transport and assemble a not-yet-joined node. A
    /// non-client-mode node starts serving inbound requests immediately,
    /// since peers may select it as a bootstrap contact before it finishes
    /// its own join.
    pub async fn bind(config: &JoinConfig) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(config.bind_addr).await?);
        let node = Self::new(transport, config)?;
        if !node.client_mode {
            node.start_serving();
        }
        Ok(node)
    }
}

impl<T: Transport + 'static> Node<T> {
    fn new(transport: Arc<T>, config: &JoinConfig) -> Result<Self> {
        let id = if config.client_mode {
            client_sentinel_id()
        } else {
            config.node_id.unwrap_or_else(NodeId::random)
        };

        let local_addr = transport.local_addr()?;
        let (ext_ip, ext_port) = config
            .known_ext_addr
            .map(|a| (a.ip().to_string(), a.port()))
            .unwrap_or_else(|| (local_addr.ip().to_string(), local_addr.port()));

        let self_contact = Contact::new(id, ext_ip, ext_port, local_addr.ip().to_string(), local_addr.port());
        let routing = Arc::new(Mutex::new(RoutingTable::new(id)));
        let store = Arc::new(DataStore::new());
        let rpc = Arc::new(RpcLayer::new(transport));
        let lookup = Arc::new(LookupEngine::new(rpc.clone(), routing.clone(), self_contact.clone()));
        let service = Arc::new(Mutex::new(Service::new(self_contact.clone(), routing.clone(), store.clone())));

        Ok(Self {
            self_contact: Arc::new(Mutex::new(self_contact)),
            routing,
            store,
            rpc,
            lookup,
            service,
            scheduler: Scheduler::new(),
            client_mode: config.client_mode,
            joined: Mutex::new(false),
            nat_type: Mutex::new(None),
            periodic_task_ids: Mutex::new(Vec::new()),
            serve_handle: Mutex::new(None),
        })
    }

    /// Spawn the inbound dispatch loop: receives datagrams off the
    /// transport, correlates responses via `RpcLayer`, and routes
    /// uncorrelated requests to `Service`, replying over the same socket.
    /// A dedicated task per request mirrors the thread-pool dispatch model
    /// (no lookup or handler blocks the receive loop itself).
    fn start_serving(&self) {
        let transport = self.transport.clone();
        let rpc = self.rpc.clone();
        let service = self.service.clone();
        let routing = self.routing.clone();
        let self_contact = self.self_contact();

        let handle = tokio::spawn(async move {
            loop {
                let (peer, data) = match transport.recv().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "transport recv failed");
                        continue;
                    }
                };
                match rpc.dispatch_inbound(&data) {
                    Ok(Some((request_id, message))) => {
                        let rpc = rpc.clone();
                        let service = service.clone();
                        let routing = routing.clone();
                        let self_contact = self_contact.clone();
                        tokio::spawn(async move {
                            handle_inbound_request(&rpc, &service, &routing, &self_contact, peer, request_id, message)
                                .await;
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse inbound datagram"),
                }
            }
        });
        *self.serve_handle.lock().expect("serve_handle mutex poisoned") = Some(handle);
    }

    pub fn self_contact(&self) -> Contact {
        self.self_contact.lock().expect("self_contact mutex poisoned").clone()
    }

    pub fn is_joined(&self) -> bool {
        *self.joined.lock().expect("joined mutex poisoned")
    }

    pub fn nat_type(&self) -> Option<u8> {
        *self.nat_type.lock().expect("nat_type mutex poisoned")
    }

    pub fn routing_table(&self) -> Arc<Mutex<RoutingTable>> {
        self.routing.clone()
    }

    pub fn store(&self) -> Arc<DataStore> {
        self.store.clone()
    }

    pub fn lookup(&self) -> Arc<LookupEngine<T>> {
        self.lookup.clone()
    }

    /// Join the network: the first node declares itself joined with an
    /// empty routing table; later nodes bootstrap against each contact in
    /// turn until one succeeds.
    pub async fn join(&self, bootstrap_contacts: &[Contact]) -> Result<()> {
        if bootstrap_contacts.is_empty() {
            info!("no bootstrap contacts provided; declaring self as first node");
            *self.joined.lock().expect("joined mutex poisoned") = true;
            self.start_periodic_tasks();
            return Ok(());
        }

        for contact in bootstrap_contacts {
            match self.try_bootstrap(contact).await {
                Ok(()) => {
                    self.routing.lock().expect("routing mutex poisoned").add(contact.clone());
                    *self.joined.lock().expect("joined mutex poisoned") = true;
                    let own_id = self.self_contact().id;
                    if let Err(e) = self.lookup.find_node(own_id).await {
                        warn!(error = %e, "post-bootstrap self find_node failed");
                    }
                    self.start_periodic_tasks();
                    return Ok(());
                }
                Err(e) => warn!(contact = %contact.host_ip, error = %e, "bootstrap attempt failed"),
            }
        }

        Err(DhtError::BootstrapFailed("all bootstrap contacts failed".to_string()))
    }

    async fn try_bootstrap(&self, contact: &Contact) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", contact.host_ip, contact.host_port)
            .parse()
            .map_err(|e| DhtError::InvalidArgument(format!("bad bootstrap address: {e}")))?;

        let self_contact = self.self_contact();
        let request = Message::BootstrapRequest(BootstrapRequest {
            newcomer_id: self_contact.id,
            newcomer_local_ip: self_contact.local_ip.clone(),
            newcomer_local_port: self_contact.local_port,
            claimed_ext_ip: self_contact.host_ip.clone(),
            claimed_ext_port: self_contact.host_port,
        });

        match self.rpc.call(addr, RpcMethod::Bootstrap, request).await {
            RpcOutcome::Response(Message::BootstrapResponse(resp)) => {
                self.adopt_bootstrap_response(&resp);
                Ok(())
            }
            RpcOutcome::Response(_) => Err(DhtError::BootstrapFailed("unexpected response type".to_string())),
            RpcOutcome::TimedOut => Err(DhtError::TimedOut),
            RpcOutcome::Cancelled => Err(DhtError::Cancelled),
            RpcOutcome::TransportFailed(reason) => Err(DhtError::TransportFailed(reason)),
        }
    }

    fn adopt_bootstrap_response(&self, resp: &BootstrapResponse) {
        let mut self_contact = self.self_contact.lock().expect("self_contact mutex poisoned");
        self_contact.host_ip = resp.observed_ext_ip.clone();
        self_contact.host_port = resp.observed_ext_port;
        *self.nat_type.lock().expect("nat_type mutex poisoned") = Some(resp.nat_type);
    }

    /// PING a node already known to the routing table. Returns `Ok(true)`
    /// if it answered, `Ok(false)` if the RPC timed out or the transport
    /// reported unreachability, and `Err` if `id` is not in the routing
    /// table at all.
    pub async fn ping(&self, id: NodeId) -> Result<bool> {
        let contact = self
            .routing
            .lock()
            .expect("routing mutex poisoned")
            .get(&id)
            .ok_or_else(|| DhtError::InvalidArgument("unknown node id".to_string()))?;
        let addr = peer_addr(&contact)
            .ok_or_else(|| DhtError::InvalidArgument("contact has no valid address".to_string()))?;
        let request = Message::PingRequest(PingRequest {
            sender: SenderInfo { contact: self.self_contact() },
            body: "ping".to_string(),
        });
        match self.rpc.call(addr, RpcMethod::Ping, request).await {
            RpcOutcome::Response(Message::PingResponse(resp)) => Ok(resp.ok),
            RpcOutcome::TimedOut | RpcOutcome::TransportFailed(_) => Ok(false),
            RpcOutcome::Response(_) => Err(DhtError::BootstrapFailed("unexpected response type".to_string())),
            RpcOutcome::Cancelled => Err(DhtError::Cancelled),
        }
    }

    /// Server-side NAT-type inference for a BOOTSTRAP request.
    ///
    /// The full three-peer protocol (a rendezvous peer relaying a probe to
    /// the newcomer's observed endpoint to detect hole-punchable restricted
    /// NATs) needs a dedicated relay RPC this wire protocol does not yet
    /// define; this resolves the direct-reachability cases (1 and 3)
    /// precisely and falls back to 3 rather than guess at 2.
    pub async fn infer_nat_type(&self, newcomer_addr: SocketAddr) -> u8 {
        infer_nat_type(&self.rpc, &self.self_contact(), newcomer_addr).await
    }

    fn start_periodic_tasks(&self) {
        if self.client_mode {
            return;
        }

        let store = self.store.clone();
        let expiry_id = self.scheduler.schedule_periodic(Duration::from_secs(T_EXPIRE_SWEEP_SECS), move || {
            let removed = store.delete_expired();
            if removed > 0 {
                info!(removed, "expiry sweep removed stale entries");
            }
        });

        let store = self.store.clone();
        let lookup = self.lookup.clone();
        let refresh_id = self.scheduler.schedule_periodic(Duration::from_secs(T_REFRESH_SECS), move || {
            let store = store.clone();
            let lookup = lookup.clone();
            tokio::spawn(async move {
                for due in store.values_to_refresh(T_REFRESH_SECS) {
                    let key = key_to_node_id(&due.key);
                    let args = StoreArgs {
                        key: due.key,
                        value: Some(due.value),
                        signed_value: None,
                        public_key: None,
                        signed_public_key: None,
                        signed_request: None,
                        ttl: due.ttl,
                        publish: false,
                    };
                    if let Err(e) = lookup.store(key, args).await {
                        warn!(error = %e, "refresh re-store failed");
                    }
                }
            });
        });

        let mut ids = self.periodic_task_ids.lock().expect("periodic_task_ids mutex poisoned");
        ids.push(expiry_id);
        ids.push(refresh_id);
    }

    /// Leave the network: cancel periodic tasks and the inbound serve
    /// loop, and write a bootstrap-hint file containing the current
    /// k-closest contacts, for a future rejoin.
    pub fn leave(&self, hint_path: Option<&Path>) -> Result<()> {
        for id in self.periodic_task_ids.lock().expect("periodic_task_ids mutex poisoned").drain(..) {
            self.scheduler.cancel(id);
        }
        self.scheduler.shutdown();
        if let Some(handle) = self.serve_handle.lock().expect("serve_handle mutex poisoned").take() {
            handle.abort();
        }
        *self.joined.lock().expect("joined mutex poisoned") = false;

        if let Some(path) = hint_path {
            let self_id = self.self_contact().id;
            let hints = self.routing.lock().expect("routing mutex poisoned").k_closest(&self_id, K, None);
            let mut buf = Vec::new();
            ciborium::into_writer(&hints, &mut buf)
                .map_err(|e| DhtError::Serialization(format!("failed to serialize bootstrap hints: {e}")))?;
            std::fs::write(path, buf).map_err(DhtError::Io)?;
        }
        Ok(())
    }

    /// Load a previously saved bootstrap-hint file into a contact list
    /// usable as `JoinConfig::bootstrap_contacts`.
    pub fn load_hints(path: &Path) -> Result<Vec<Contact>> {
        let bytes = std::fs::read(path).map_err(DhtError::Io)?;
        ciborium::from_reader(bytes.as_slice())
            .map_err(|e| DhtError::Serialization(format!("failed to parse bootstrap hints: {e}")))
    }
}

fn key_to_node_id(key: &[u8]) -> NodeId {
    let bytes: [u8; crate::id::ID_LEN] =
        key.try_into().expect("routing key is already a 512-bit id");
    NodeId::from_bytes(bytes)
}

fn peer_addr(contact: &Contact) -> Option<SocketAddr> {
    format!("{}:{}", contact.host_ip, contact.host_port).parse().ok()
}

/// Server-side NAT-type inference for a BOOTSTRAP request (§4.9): a direct
/// PING from here to the newcomer's observed endpoint distinguishes type 1
/// (fully reachable) from type 3 (symmetric/unreachable). The rendezvous
/// relay needed to confirm type 2 is outside this wire protocol.
async fn infer_nat_type<T: Transport>(rpc: &RpcLayer<T>, self_contact: &Contact, newcomer_addr: SocketAddr) -> u8 {
    let request = Message::PingRequest(PingRequest {
        sender: SenderInfo { contact: self_contact.clone() },
        body: "ping".to_string(),
    });
    match rpc.call(newcomer_addr, RpcMethod::Ping, request).await {
        RpcOutcome::Response(Message::PingResponse(resp)) if resp.ok => 1,
        _ => 3,
    }
}

/// Dispatch one uncorrelated inbound request to `Service` and send its
/// reply. Runs as its own task so a slow handler never blocks the receive
/// loop or other concurrent requests.
async fn handle_inbound_request<T: Transport>(
    rpc: &Arc<RpcLayer<T>>,
    service: &Arc<Mutex<Service>>,
    routing: &Arc<Mutex<RoutingTable>>,
    self_contact: &Contact,
    peer: SocketAddr,
    request_id: u32,
    message: Message,
) {
    let response = match message {
        Message::PingRequest(req) => {
            Message::PingResponse(service.lock().expect("service mutex poisoned").handle_ping(req))
        }
        Message::NatDetectionPingRequest(req) => Message::NatDetectionPingResponse(
            service.lock().expect("service mutex poisoned").handle_nat_detection_ping(req),
        ),
        Message::StoreRequest(req) => {
            Message::StoreResponse(service.lock().expect("service mutex poisoned").handle_store(req))
        }
        Message::FindNodeRequest(req) => {
            Message::FindNodeResponse(service.lock().expect("service mutex poisoned").handle_find_node(req, peer))
        }
        Message::FindValueRequest(req) => {
            Message::FindValueResponse(service.lock().expect("service mutex poisoned").handle_find_value(req, peer))
        }
        Message::DownlistRequest(req) => {
            let (resp, present) = service.lock().expect("service mutex poisoned").handle_downlist(req);
            spawn_downlist_pings(rpc.clone(), routing.clone(), self_contact.clone(), present);
            Message::DownlistResponse(resp)
        }
        Message::BootstrapRequest(req) => {
            let newcomer_addr: SocketAddr =
                format!("{}:{}", req.newcomer_local_ip, req.newcomer_local_port).parse().unwrap_or(peer);
            let nat_type = infer_nat_type(rpc, self_contact, newcomer_addr).await;
            Message::BootstrapResponse(
                service.lock().expect("service mutex poisoned").handle_bootstrap(req, peer, nat_type),
            )
        }
        // Response variants reaching here failed to correlate to a pending
        // request (already timed out, cancelled, or a stray duplicate);
        // there is nothing useful to reply with.
        _ => return,
    };

    if let Err(e) = rpc.respond(peer, request_id, response).await {
        warn!(error = %e, "failed to send response");
    }

    drain_liveness_checks(rpc.clone(), routing.clone(), self_contact.clone(), service);
}

/// Ping each liveness-check candidate `Service` queued while handling this
/// request; on timeout, evict it in favor of the contact it was blocking
/// (§4.3 `NeedsLastSeenCheck`).
fn drain_liveness_checks<T: Transport>(
    rpc: Arc<RpcLayer<T>>,
    routing: Arc<Mutex<RoutingTable>>,
    self_contact: Contact,
    service: &Arc<Mutex<Service>>,
) {
    let pending = service.lock().expect("service mutex poisoned").drain_pending_liveness_checks();
    for (candidate_id, new_contact) in pending {
        let rpc = rpc.clone();
        let routing = routing.clone();
        let self_contact = self_contact.clone();
        tokio::spawn(async move {
            let candidate = routing.lock().expect("routing mutex poisoned").get(&candidate_id);
            let Some(candidate) = candidate else { return };
            let Some(addr) = peer_addr(&candidate) else { return };
            let request = Message::PingRequest(PingRequest {
                sender: SenderInfo { contact: self_contact },
                body: "ping".to_string(),
            });
            match rpc.call(addr, RpcMethod::Ping, request).await {
                RpcOutcome::Response(Message::PingResponse(resp)) if resp.ok => {}
                _ => {
                    routing.lock().expect("routing mutex poisoned").evict_and_insert(&candidate_id, new_contact);
                }
            }
        });
    }
}

/// Ping each contact a DOWNLIST reported as suspect; on timeout, force-evict
/// it from the routing table (§4.6 DOWNLIST).
fn spawn_downlist_pings<T: Transport>(
    rpc: Arc<RpcLayer<T>>,
    routing: Arc<Mutex<RoutingTable>>,
    self_contact: Contact,
    contacts: Vec<Contact>,
) {
    for contact in contacts {
        let rpc = rpc.clone();
        let routing = routing.clone();
        let self_contact = self_contact.clone();
        tokio::spawn(async move {
            let Some(addr) = peer_addr(&contact) else { return };
            let request = Message::PingRequest(PingRequest {
                sender: SenderInfo { contact: self_contact },
                body: "ping".to_string(),
            });
            match rpc.call(addr, RpcMethod::Ping, request).await {
                RpcOutcome::Response(Message::PingResponse(resp)) if resp.ok => {}
                _ => {
                    routing.lock().expect("routing mutex poisoned").remove(&contact.id, true);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bind_port: u16) -> JoinConfig {
        JoinConfig {
            node_id: Some(NodeId::random()),
            bind_addr: format!("127.0.0.1:{bind_port}").parse().expect("valid addr"),
            known_ext_addr: None,
            client_mode: false,
        }
    }

    #[tokio::test]
    async fn test_first_node_joins_immediately() {
        let node = Node::bind(&config(0)).await.expect("bind");
        node.join(&[]).await.expect("join as first node");
        assert!(node.is_joined());
        node.leave(None).expect("leave");
        assert!(!node.is_joined());
    }

    #[tokio::test]
    async fn test_bootstrap_against_unreachable_contact_fails() {
        let node = Node::bind(&config(0)).await.expect("bind");
        let dead = Contact::new(NodeId::random(), "127.0.0.1".to_string(), 1, "0.0.0.0".to_string(), 0);
        let result = node.join(&[dead]).await;
        assert!(result.is_err());
        assert!(!node.is_joined());
    }

    #[tokio::test]
    async fn test_client_mode_uses_sentinel_id() {
        let mut cfg = config(0);
        cfg.client_mode = true;
        let node = Node::bind(&cfg).await.expect("bind");
        assert_eq!(node.self_contact().id, client_sentinel_id());
    }

    #[tokio::test]
    async fn test_infer_nat_type_unreachable_is_symmetric() {
        let node = Node::bind(&config(0)).await.expect("bind");
        let nat_type = node.infer_nat_type("127.0.0.1:1".parse().expect("valid addr")).await;
        assert_eq!(nat_type, 3);
    }

    #[tokio::test]
    async fn test_ping_unknown_id_rejected() {
        let node = Node::bind(&config(0)).await.expect("bind");
        let result = node.ping(NodeId::random()).await;
        assert!(matches!(result, Err(DhtError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_ping_live_peer_succeeds() {
        let a = Node::bind(&config(0)).await.expect("bind a");
        let b = Node::bind(&config(0)).await.expect("bind b");
        a.join(&[]).await.expect("a joins as first node");

        // b bootstraps against a so a's routing table learns about b.
        let a_self = a.self_contact();
        let a_contact_for_b = Contact::new(a_self.id, a_self.host_ip.clone(), a_self.host_port, a_self.local_ip.clone(), a_self.local_port);
        b.join(&[a_contact_for_b]).await.expect("b joins via a");

        let ok = a.ping(b.self_contact().id).await.expect("ping known peer");
        assert!(ok);

        a.leave(None).expect("leave a");
        b.leave(None).expect("leave b");
    }
}
