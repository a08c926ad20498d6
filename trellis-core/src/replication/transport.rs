//! Message transports
//!
//! The protocol logic only sees [`Transport`]: one complete message per
//! read or write. Two implementations ship here:
//!
//! - [`TcpTransport`]: `[length:4][payload:N][crc32:4]` frames over TCP
//! - [`MemoryTransport`]: the same frames over in-process channels, used by
//!   [`MemoryNetwork`] to wire nodes together without sockets

use crate::replication::config::ReplicationConfig;
use crate::replication::node::Node;
use crate::replication::protocol::ReplicationMessage;
use crate::replication::server::ConnectionManager;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Size of the CRC32 trailer on every frame
const CRC_LEN: usize = 4;

/// A bidirectional, message-oriented connection
#[async_trait]
pub trait Transport: Send {
    /// Read the next message; `Ok(None)` when the peer closed the connection
    async fn read_message(&mut self) -> Result<Option<ReplicationMessage>>;

    /// Write one message
    async fn write_message(&mut self, msg: &ReplicationMessage) -> Result<()>;

    /// Human-readable peer address, for logs and the slave registry
    fn peer(&self) -> &str;

    /// Write a message and wait for its `ACK`/`NAK`
    ///
    /// Returns `Ok(true)` for `ACK` and `Ok(false)` for `NAK`. Any other reply,
    /// a closed connection or an elapsed timeout is an error.
    async fn send_and_wait_ack(
        &mut self,
        msg: &ReplicationMessage,
        timeout: Duration,
    ) -> Result<bool> {
        self.write_message(msg).await?;
        let reply = tokio::time::timeout(timeout, self.read_message())
            .await
            .map_err(|_| Error::timeout(format!("No acknowledgement for '{}'", msg.kind())))??;

        match reply {
            Some(ReplicationMessage::Ack) => Ok(true),
            Some(ReplicationMessage::Nak { .. }) => Ok(false),
            Some(other) => Err(Error::protocol(format!(
                "Expected ACK/NAK for '{}', got '{}'",
                msg.kind(),
                other.kind()
            ))),
            None => Err(Error::ConnectionClosed),
        }
    }
}

/// Encode a message into a frame payload with its CRC32 trailer
pub fn encode_frame(msg: &ReplicationMessage) -> Result<Bytes> {
    let text = msg.encode()?;
    let mut buf = BytesMut::with_capacity(text.len() + CRC_LEN);
    buf.put_slice(text.as_bytes());
    buf.put_u32_le(crc32fast::hash(text.as_bytes()));
    Ok(buf.freeze())
}

/// Verify and decode a frame payload
pub fn decode_frame(frame: &[u8]) -> Result<ReplicationMessage> {
    if frame.len() < CRC_LEN {
        return Err(Error::protocol("Frame too short"));
    }

    let (payload, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let mut crc = [0u8; CRC_LEN];
    crc.copy_from_slice(trailer);
    let stored_crc = u32::from_le_bytes(crc);
    let computed_crc = crc32fast::hash(payload);
    if stored_crc != computed_crc {
        return Err(Error::protocol(format!(
            "CRC mismatch: expected {:x}, got {:x}",
            stored_crc, computed_crc
        )));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::protocol(format!("Message is not UTF-8: {}", e)))?;
    ReplicationMessage::decode(text)
}

/// Length-delimited TCP transport
pub struct TcpTransport {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: String,
}

impl TcpTransport {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, max_frame_length: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            peer,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_message(&mut self) -> Result<Option<ReplicationMessage>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(frame)) => decode_frame(&frame).map(Some),
        }
    }

    async fn write_message(&mut self, msg: &ReplicationMessage) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.framed.send(frame).await?;
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// In-process transport carrying encoded frames over unbounded channels
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    peer: String,
}

impl MemoryTransport {
    /// Create two connected endpoints; each one's `peer()` is the other's name
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                peer: b.into(),
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                peer: a.into(),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_message(&mut self) -> Result<Option<ReplicationMessage>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(frame) => decode_frame(&frame).map(Some),
        }
    }

    async fn write_message(&mut self, msg: &ReplicationMessage) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Opens outbound connections to other nodes
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `addr` (`host:port`)
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>>;
}

/// Connector for real TCP peers
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_frame_length: usize,
}

impl TcpConnector {
    /// Build from replication settings
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            max_frame_length: config.max_frame_length,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("Connection to {} timed out", addr)))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransport::new(stream, self.max_frame_length)))
    }
}

/// Registry of in-process nodes reachable by address
///
/// Each `connect` spawns the target node's connection handler on the server
/// end of a fresh [`MemoryTransport`] pair.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<Node>>>,
    next_client: AtomicU64,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `node` reachable at `addr`
    pub fn attach(&self, addr: impl Into<String>, node: &Arc<Node>) {
        self.nodes.write().insert(addr.into(), Arc::downgrade(node));
    }

    /// Make `addr` unreachable for new connections
    pub fn detach(&self, addr: &str) {
        self.nodes.write().remove(addr);
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>> {
        let node = self
            .nodes
            .read()
            .get(addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("No node listening at {}", addr),
                ))
            })?;

        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (client, server) = MemoryTransport::pair(format!("memory-client-{}", client_id), addr);
        tokio::spawn(ConnectionManager::handle_connection(node, Box::new(server)));
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::SyncStatus;
    use tokio::net::TcpListener;

    #[test]
    fn test_frame_crc_validation() {
        let frame = encode_frame(&ReplicationMessage::Ping).unwrap();
        let mut corrupted = frame.to_vec();
        corrupted[0] ^= 0xFF;

        let result = decode_frame(&corrupted);
        assert!(result.unwrap_err().to_string().contains("CRC"));
        assert!(decode_frame(&[1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_memory_transport_ack_roundtrip() {
        let (mut client, mut server) = MemoryTransport::pair("slave", "master");
        assert_eq!(client.peer(), "master");
        assert_eq!(server.peer(), "slave");

        let responder = tokio::spawn(async move {
            let msg = server.read_message().await.unwrap().unwrap();
            assert_eq!(msg, ReplicationMessage::Ping);
            server.write_message(&ReplicationMessage::Ack).await.unwrap();
            let msg = server.read_message().await.unwrap().unwrap();
            assert_eq!(msg, ReplicationMessage::EndSync(SyncStatus::Ok));
            server.write_message(&ReplicationMessage::nak()).await.unwrap();
        });

        let timeout = Duration::from_secs(1);
        assert!(client.send_and_wait_ack(&ReplicationMessage::Ping, timeout).await.unwrap());
        assert!(!client
            .send_and_wait_ack(&ReplicationMessage::EndSync(SyncStatus::Ok), timeout)
            .await
            .unwrap());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_transport_closed_peer() {
        let (mut client, server) = MemoryTransport::pair("a", "b");
        drop(server);
        assert!(client.read_message().await.unwrap().is_none());
        assert!(matches!(
            client.write_message(&ReplicationMessage::Ping).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let (mut client, _server) = MemoryTransport::pair("a", "b");
        let result = client
            .send_and_wait_ack(&ReplicationMessage::Ping, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = TcpTransport::new(stream, 1024 * 1024);
            let msg = transport.read_message().await.unwrap().unwrap();
            assert_eq!(msg, ReplicationMessage::CreateStore("orders".into()));
            transport.write_message(&ReplicationMessage::Ack).await.unwrap();
        });

        let connector = TcpConnector::from_config(&ReplicationConfig::default());
        let mut client = connector.connect(&addr.to_string()).await.unwrap();
        let acked = client
            .send_and_wait_ack(
                &ReplicationMessage::CreateStore("orders".into()),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(acked);
        server.await.unwrap();

        assert!(client.read_message().await.unwrap().is_none());
    }
}
