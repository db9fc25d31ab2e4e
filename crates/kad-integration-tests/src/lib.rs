//! Integration test crate for the Kademlia DHT core.
//!
//! This crate has no library code — it only contains integration tests
//! that bring up several real `Node`s over loopback UDP and exercise
//! bootstrap, lookup, replication, and liveness end to end.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kad-integration-tests -- --ignored
//! ```
