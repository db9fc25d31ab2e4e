//! `kad-cli`: an interactive command-line demo that exercises a single
//! DHT node through its full lifecycle — join, the seven-verb RPC
//! surface via iterative lookups, and leave.
//!
//! Usage: `kad-cli [listen_port]`. Configuration otherwise comes from
//! `kad-cli.toml` in the data directory (see `config::NodeConfig`); run
//! several instances with distinct ports and `bootstrap_contacts`
//! entries to form a local swarm.

mod config;

use std::io::Write as _;

use kad_dht::contact::Contact;
use kad_dht::id::NodeId;
use kad_dht::lookup::{FindValueOutcome, StoreArgs};
use kad_dht::node::{JoinConfig, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = NodeConfig::load()?;
    if let Some(port_arg) = std::env::args().nth(1) {
        config.listen_port = port_arg.parse()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let node_id = match &config.node_id {
        Some(hex) => Some(NodeId::from_hex(hex)?),
        None => None,
    };
    let join_config = JoinConfig {
        node_id,
        bind_addr: format!("0.0.0.0:{}", config.listen_port).parse()?,
        known_ext_addr: None,
        client_mode: config.client_mode,
    };

    let node = Node::bind(&join_config).await?;
    info!(id = %node.self_contact().id, port = node.self_contact().host_port, "node bound");

    let bootstrap_contacts = resolve_bootstrap_contacts(&config)?;
    node.join(&bootstrap_contacts).await?;
    info!("joined the network");

    run_demo(&node).await?;

    node.leave(Some(&config.hints_path()))?;
    println!("Exiting application...");
    Ok(())
}

fn resolve_bootstrap_contacts(config: &NodeConfig) -> anyhow::Result<Vec<Contact>> {
    if !config.bootstrap_contacts.is_empty() {
        return config
            .bootstrap_contacts
            .iter()
            .map(|c| {
                Ok(Contact::new(
                    NodeId::from_hex(&c.node_id)?,
                    c.host_ip.clone(),
                    c.host_port,
                    c.host_ip.clone(),
                    c.host_port,
                ))
            })
            .collect();
    }

    match kad_dht::node::Node::<kad_dht::transport::UdpTransport>::load_hints(&config.hints_path()) {
        Ok(hints) => Ok(hints),
        Err(_) => Ok(Vec::new()),
    }
}

async fn run_demo(node: &Node) -> anyhow::Result<()> {
    print_usage();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("demo > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nCtrl-C received, shutting down");
                break;
            }
        };

        let Some(line) = line else {
            break;
        };
        if !process_command(node, &line).await {
            break;
        }
    }
    Ok(())
}

/// Returns `false` when the demo should stop (the `exit` command).
async fn process_command(node: &Node, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else { return true };
    let args: Vec<&str> = parts.collect();

    match cmd {
        "help" => print_usage(),
        "getinfo" => {
            let contact = node.self_contact();
            println!("Node info:");
            println!("  id: {}", contact.id.to_hex());
            println!("  external: {}:{}", contact.host_ip, contact.host_port);
            println!("  local: {}:{}", contact.local_ip, contact.local_port);
            println!("  nat type: {}", node.nat_type().map(|t| t.to_string()).unwrap_or_else(|| "unknown".to_string()));
        }
        "pingnode" => match args.as_slice() {
            [id] => match parse_strict_node_id(id) {
                Some(target) => match node.ping(target).await {
                    Ok(true) => println!("Node with id {id} is up."),
                    Ok(false) => println!("Node with id {id} is down."),
                    Err(e) => println!("Node with id {id} is down. ({e})"),
                },
                None => println!("Invalid Node id"),
            },
            _ => println!("Invalid number of arguments for pingnode command"),
        },
        "findnode" => match args.as_slice() {
            [id] => match parse_strict_node_id(id) {
                Some(target) => match node.lookup().find_node(target).await {
                    Ok(contacts) => match contacts.iter().find(|c| c.id == target) {
                        Some(c) => println!("Node with id {id} found. Node info:\n  {}:{}", c.host_ip, c.host_port),
                        None => println!("Could not find node with id {id}."),
                    },
                    Err(e) => println!("Could not find node with id {id}. ({e})"),
                },
                None => println!("Invalid Node id"),
            },
            _ => println!("Invalid number of arguments for findnode command"),
        },
        "storefile" => match args.as_slice() {
            [key, path, ttl_min] => match (std::fs::read(path), ttl_min.parse::<u64>()) {
                (Ok(content), Ok(ttl_min)) => store_value(node, key, content, ttl_min * 60).await,
                (Err(e), _) => println!("{path} does not exist or cannot be read: {e}"),
                (_, Err(_)) => println!("Invalid ttl"),
            },
            _ => println!("Invalid number of arguments for storefile command"),
        },
        "storevalue" => match args.as_slice() {
            [key, value, ttl_min] => match ttl_min.parse::<u64>() {
                Ok(ttl_min) => store_value(node, key, value.as_bytes().to_vec(), ttl_min * 60).await,
                Err(_) => println!("Invalid ttl"),
            },
            _ => println!("Invalid number of arguments for storevalue command"),
        },
        "findvalue" => match args.as_slice() {
            [key] => find_value(node, key, None).await,
            _ => println!("Invalid number of arguments for findvalue command"),
        },
        "findfile" => match args.as_slice() {
            [key, path] => find_value(node, key, Some(path)).await,
            _ => println!("Invalid number of arguments for findfile command"),
        },
        "store50values" => match args.as_slice() {
            [prefix] => store_50_values(node, prefix).await,
            _ => println!("Invalid number of arguments for store50values command"),
        },
        "exit" => return false,
        "" => {}
        other => println!("Invalid command {other}"),
    }

    true
}

async fn store_value(node: &Node, key: &str, content: Vec<u8>, ttl_secs: u64) {
    let key_id = parse_key_or_hash(key);
    let args = StoreArgs {
        key: key_id.to_bytes().to_vec(),
        value: Some(content),
        signed_value: None,
        public_key: None,
        signed_public_key: None,
        signed_request: None,
        ttl: ttl_secs,
        publish: true,
    };
    match node.lookup().store(key_id, args).await {
        Ok(()) => println!("Successfully stored key {} with ttl {}s", key_id.to_hex(), ttl_secs),
        Err(e) => {
            println!("Failed to store enough copies of the value for key {}.", key_id.to_hex());
            println!("Some copies might have been stored ({e})");
        }
    }
}

async fn find_value(node: &Node, key: &str, write_to: Option<&str>) {
    let key_id = parse_key_or_hash(key);
    match node.lookup().find_value(key_id).await {
        Ok(FindValueOutcome::Values { values, .. }) => {
            println!("Successfully retrieved value(s) for key {}", key_id.to_hex());
            match write_to {
                Some(path) => {
                    if let Some(first) = values.first() {
                        if let Err(e) = std::fs::write(path, first) {
                            println!("Error writing to file {path}: {e}");
                        }
                    }
                }
                None => {
                    for (i, value) in values.iter().enumerate() {
                        println!("{}. {}", i + 1, String::from_utf8_lossy(value));
                    }
                }
            }
        }
        Ok(FindValueOutcome::AlternativeHolder(contact)) => {
            println!("Value for key {} is held by {}:{}", key_id.to_hex(), contact.host_ip, contact.host_port);
        }
        Ok(FindValueOutcome::NotFound) | Err(_) => {
            println!("There is no value stored under key {}", key_id.to_hex());
        }
    }
}

/// Stores 50 key/value pairs `(prefix{i}, prefix{i} * 10240)` with an
/// extended TTL, exercising replication under sustained load.
async fn store_50_values(node: &Node, prefix: &str) {
    for i in 0..50 {
        let label = format!("{prefix}{i}");
        let value = label.repeat(1024 * 10 / label.len().max(1));
        let key_id = parse_key_or_hash(&label);
        let args = StoreArgs {
            key: key_id.to_bytes().to_vec(),
            value: Some(value.into_bytes()),
            signed_value: None,
            public_key: None,
            signed_public_key: None,
            signed_request: None,
            ttl: 1040 * 60,
            publish: true,
        };
        match node.lookup().store(key_id, args).await {
            Ok(()) => println!("Successfully stored key {label}"),
            Err(e) => {
                println!("Failed to store enough copies of the value for key {label}.");
                warn!(error = %e, %label, "store50values entry failed");
            }
        }
    }
}

/// `pingnode`/`findnode` operate on node ids, which must be exact 512-bit
/// hex, unlike the generic hashable keys accepted elsewhere.
fn parse_strict_node_id(s: &str) -> Option<NodeId> {
    if s.len() != 128 {
        return None;
    }
    NodeId::from_hex(s).ok()
}

/// A key that is not 128 hex chars is hashed to derive the 512-bit key.
fn parse_key_or_hash(s: &str) -> NodeId {
    if let Some(id) = parse_strict_node_id(s) {
        return id;
    }
    NodeId::from_bytes(kad_crypto::blake3::hash512(s.as_bytes()))
}

fn print_usage() {
    println!("\thelp                        Print help.");
    println!("\tgetinfo                     Print this node's info.");
    println!("\tpingnode node_id            Ping node with id node_id.");
    println!("\tfindnode node_id            Find node with id node_id.");
    println!("\tstorefile key filepath ttl  Store contents of file in the network. ttl in minutes.");
    println!("\tstorevalue key value ttl    Store value in the network. ttl in minutes.");
    println!("\tfindfile key filepath       Find value stored with key and save it to filepath.");
    println!("\tfindvalue key               Find value stored with key.");
    println!("\tstore50values prefix        Store 50 key value pairs of form (prefix[i], prefix[i]*10240).");
    println!("\texit                        Stop the node and exit.");
    println!();
    println!("\tNOTE -- node_id should be 128 hex chars.");
    println!("\t        If key is not a valid 512-bit hex key, it will be hashed.");
    println!();
}
