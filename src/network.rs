use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::TransportError;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub sender: String,
}

/// Best effort, unordered datagram delivery bound to one local address.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> &str;

    async fn send_to(&self, payload: Bytes, target: &str) -> Result<(), TransportError>;

    /// Waits for the next inbound datagram.
    async fn recv(&self) -> Result<Datagram, TransportError>;
}

pub struct UdpTransport {
    local_address: String,
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(local_address: impl Into<String>, bind_address: SocketAddr) -> std::io::Result<UdpTransport> {
        let socket = UdpSocket::bind(bind_address).await?;
        let local_address = local_address.into();
        log::debug!("{} listening on {}", local_address, socket.local_addr()?);
        Ok(UdpTransport { local_address, socket })
    }

    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_address(&self) -> &str {
        &self.local_address
    }

    async fn send_to(&self, payload: Bytes, target: &str) -> Result<(), TransportError> {
        let target_addr = tokio::net::lookup_host(target).await?
            .next()
            .ok_or_else(|| TransportError::Unresolvable(target.to_owned()))?;
        let sent = self.socket.send_to(payload.as_ref(), target_addr).await?;
        log::trace!("Send {} of {} bytes to {}", sent, payload.len(), target_addr);
        Ok(())
    }

    async fn recv(&self) -> Result<Datagram, TransportError> {
        let mut bytes_mut = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
        let (len, socket_address) = self.socket.recv_buf_from(&mut bytes_mut).await?;
        log::trace!("Receive msg with len {} from {}", len, socket_address);
        Ok(Datagram { payload: bytes_mut.split_to(len).freeze(), sender: socket_address.to_string() })
    }
}

/// In-process network routing datagrams between [`InMemoryTransport`]s by address.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    routes: Arc<Mutex<HashMap<String, UnboundedSender<Datagram>>>>,
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        InMemoryNetwork::default()
    }

    /// Binds an endpoint, replacing any endpoint previously bound to `address`.
    pub fn bind(&self, address: impl Into<String>) -> InMemoryTransport {
        let address = address.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes.lock().insert(address.clone(), sender);
        InMemoryTransport {
            local_address: address,
            network: self.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Removes the endpoint at `address`; its pending `recv` observes a closed transport.
    pub fn disconnect(&self, address: &str) {
        self.routes.lock().remove(address);
    }

    fn route(&self, target: &str) -> Option<UnboundedSender<Datagram>> {
        self.routes.lock().get(target).cloned()
    }
}

pub struct InMemoryTransport {
    local_address: String,
    network: InMemoryNetwork,
    receiver: tokio::sync::Mutex<UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_address(&self) -> &str {
        &self.local_address
    }

    async fn send_to(&self, payload: Bytes, target: &str) -> Result<(), TransportError> {
        let route = self.network.route(target)
            .ok_or_else(|| TransportError::UnknownTarget(target.to_owned()))?;
        route.send(Datagram { payload, sender: self.local_address.clone() })
            .map_err(|_| TransportError::UnknownTarget(target.to_owned()))
    }

    async fn recv(&self) -> Result<Datagram, TransportError> {
        self.receiver.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[tokio::test]
    async fn should_received_and_send_messages() {
        let server = UdpTransport::bind("server", SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
        let client = UdpTransport::bind("client", SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
        let server_address = server.socket_addr().unwrap().to_string();
        let client_address = client.socket_addr().unwrap().to_string();

        client.send_to(Bytes::from("test"), &server_address).await.unwrap();

        let result = server.recv().await.unwrap();
        let expected = Datagram { payload: Bytes::from("test"), sender: client_address };
        assert_eq!(expected, result)
    }

    #[tokio::test]
    async fn unresolvable_target_is_an_error() {
        let client = UdpTransport::bind("client", SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
        assert!(client.send_to(Bytes::from("test"), "not an address").await.is_err());
    }

    #[tokio::test]
    async fn in_memory_routes_by_address() {
        let network = InMemoryNetwork::new();
        let a = network.bind("a:1");
        let b = network.bind("b:2");

        a.send_to(Bytes::from("hello"), "b:2").await.unwrap();

        let result = b.recv().await.unwrap();
        assert_eq!(Datagram { payload: Bytes::from("hello"), sender: "a:1".to_owned() }, result);
    }

    #[tokio::test]
    async fn in_memory_disconnect_closes_endpoint() {
        let network = InMemoryNetwork::new();
        let a = network.bind("a:1");
        let b = network.bind("b:2");
        network.disconnect("b:2");

        assert!(matches!(a.send_to(Bytes::from("x"), "b:2").await, Err(TransportError::UnknownTarget(_))));
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
    }
}
