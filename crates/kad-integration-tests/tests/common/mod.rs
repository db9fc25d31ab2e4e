//! Shared helpers for spinning up a small loopback network of real nodes.

use kad_dht::contact::Contact;
use kad_dht::node::{JoinConfig, Node};
use kad_dht::transport::UdpTransport;

/// Bring up `count` nodes on ephemeral loopback ports. `nodes[0]` declares
/// itself the first node; every later node bootstraps against `nodes[0]`,
/// mirroring the single-bootstrap-contact chain the CLI demo uses.
pub async fn spin_up_chain(count: usize) -> Vec<Node<UdpTransport>> {
    assert!(count >= 1);
    let mut nodes = Vec::with_capacity(count);

    let first = Node::bind(&config()).await.expect("bind first node");
    first.join(&[]).await.expect("first node joins immediately");
    let first_contact = first.self_contact();
    nodes.push(first);

    for _ in 1..count {
        let node = Node::bind(&config()).await.expect("bind node");
        node.join(&[first_contact.clone()]).await.expect("node bootstraps against first");
        nodes.push(node);
    }

    nodes
}

fn config() -> JoinConfig {
    JoinConfig {
        node_id: None,
        bind_addr: "127.0.0.1:0".parse().expect("valid addr"),
        known_ext_addr: None,
        client_mode: false,
    }
}

/// Build a bootstrap-style `Contact` for `node`, the way a peer dialing it
/// would see it (its own reported external endpoint).
pub fn contact_of(node: &Node<UdpTransport>) -> Contact {
    node.self_contact()
}

/// Bind a fresh node and bootstrap it against a single contact.
pub async fn bind_and_join(bootstrap: &Contact) -> Node<UdpTransport> {
    let node = Node::bind(&config()).await.expect("bind node");
    node.join(&[bootstrap.clone()]).await.expect("node bootstraps");
    node
}
