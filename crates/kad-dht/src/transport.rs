//! Datagram transport abstraction and its UDP realization.
//!
//! The core never depends on `tokio::net::UdpSocket` directly; it depends on
//! [`Transport`], so tests can swap in an in-memory stub while the real node
//! runs on [`UdpTransport`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::{DhtError, Result};

/// Maximum single-datagram size this transport will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// A connectivity failure observed by the transport for a specific peer.
#[derive(Clone, Debug)]
pub struct ConnectionFailure {
    pub peer: SocketAddr,
    pub reason: String,
}

/// Abstract datagram transport. [`crate::rpc::RpcLayer`] and [`crate::service::Service`]
/// are generic over this trait rather than tied to a concrete socket type, so
/// tests can substitute an in-memory transport.
pub trait Transport: Send + Sync {
    /// Send `bytes` to `peer`.
    fn send_to(&self, peer: SocketAddr, bytes: &[u8]) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Receive the next datagram, returning its sender and payload.
    fn recv(&self) -> impl std::future::Future<Output = Result<(SocketAddr, Vec<u8>)>> + Send;

    /// The local address this transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Subscribe to connection-failure notifications (e.g. ICMP port
    /// unreachable surfaced by the OS, or a send error).
    fn subscribe_failures(&self) -> broadcast::Receiver<ConnectionFailure>;
}

/// UDP-backed [`Transport`]. Binds a single socket shared between the send
/// path (RPC dispatch, Service replies) and a dedicated receive loop.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    failures_tx: broadcast::Sender<ConnectionFailure>,
}

impl UdpTransport {
    /// Bind a new UDP socket at `bind_addr`.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(DhtError::Io)?;
        let (failures_tx, _) = broadcast::channel(64);
        Ok(Self {
            socket: Arc::new(socket),
            failures_tx,
        })
    }

    /// Report a connection failure to subscribers (called by the RPC layer
    /// when a send errors out for a specific peer).
    pub fn report_failure(&self, peer: SocketAddr, reason: impl Into<String>) {
        let _ = self.failures_tx.send(ConnectionFailure {
            peer,
            reason: reason.into(),
        });
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, peer: SocketAddr, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DhtError::TransportFailed(format!(
                "datagram too large: {} bytes",
                bytes.len()
            )));
        }
        self.socket
            .send_to(bytes, peer)
            .await
            .map_err(|e| {
                self.report_failure(peer, e.to_string());
                DhtError::Io(e)
            })?;
        Ok(())
    }

    async fn recv(&self) -> Result<(SocketAddr, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, peer) = self.socket.recv_from(&mut buf).await.map_err(DhtError::Io)?;
        buf.truncate(len);
        Ok((peer, buf))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(DhtError::Io)
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<ConnectionFailure> {
        self.failures_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().expect("valid addr"))
            .await
            .expect("bind");
        let addr = transport.local_addr().expect("has local addr");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_send_and_recv_roundtrip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().expect("valid addr"))
            .await
            .expect("bind a");
        let b = UdpTransport::bind("127.0.0.1:0".parse().expect("valid addr"))
            .await
            .expect("bind b");
        let b_addr = b.local_addr().expect("b addr");

        a.send_to(b_addr, b"hello").await.expect("send");
        let (from, payload) = b.recv().await.expect("recv");
        assert_eq!(payload, b"hello");
        assert_eq!(from, a.local_addr().expect("a addr"));
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().expect("valid addr"))
            .await
            .expect("bind");
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let result = a.send_to("127.0.0.1:9".parse().expect("valid addr"), &big).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failure_subscription_receives_report() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().expect("valid addr"))
            .await
            .expect("bind");
        let mut rx = transport.subscribe_failures();
        transport.report_failure("127.0.0.1:1".parse().expect("valid addr"), "boom");
        let failure = rx.try_recv().expect("failure queued");
        assert_eq!(failure.reason, "boom");
    }
}
