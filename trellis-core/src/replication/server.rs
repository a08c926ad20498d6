//! Connection manager
//!
//! Owns the replication listener. Every inbound connection gets its own task
//! that reads messages, dispatches them by header keyword and replies. The
//! number of connections handled at once is bounded by
//! `max_connections`.

use crate::replication::node::{ApplyMode, ApplyOutcome, Node};
use crate::replication::protocol::ReplicationMessage;
use crate::replication::state::NodeState;
use crate::replication::sync;
use crate::replication::transport::{TcpTransport, Transport};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

/// Replication listener bound to a node
pub struct ConnectionManager {
    node: Arc<Node>,
}

impl ConnectionManager {
    /// Create a manager serving `node`
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Bind the configured replication address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.node.config().bind_addr).await?;
        Ok(listener)
    }

    /// Bind and serve until the node shuts down
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the node shuts down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr: SocketAddr = listener.local_addr()?;
        let shutdown = self.node.shutdown_token();
        let limiter = Arc::new(Semaphore::new(self.node.config().max_connections));
        let max_frame_length = self.node.config().max_frame_length;

        tracing::info!("Replication listener on {}", local_addr);

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => {
                    permit.map_err(|_| Error::internal("connection limiter closed"))?
                }
            };

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                            }
                            tracing::debug!(peer = %addr, "Accepted replication connection");
                            let transport = TcpTransport::new(stream, max_frame_length);
                            let node = self.node.clone();
                            tokio::spawn(async move {
                                Self::handle_connection(node, Box::new(transport)).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!("Replication listener on {} stopped", local_addr);
        Ok(())
    }

    /// Serve one connection until the peer closes it or it becomes a live
    /// slave channel
    pub async fn handle_connection(node: Arc<Node>, mut transport: Box<dyn Transport>) {
        let peer = transport.peer().to_string();

        loop {
            let msg = match transport.read_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::debug!(peer = %peer, "Connection closed by peer");
                    return;
                }
                Err(Error::Protocol(reason)) => {
                    tracing::warn!(peer = %peer, reason = %reason, "Rejecting malformed message");
                    if transport.write_message(&ReplicationMessage::nak()).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Connection failed");
                    return;
                }
            };

            tracing::debug!(peer = %peer, kind = %msg.kind(), "Received message");

            if node.state() == NodeState::Broken && msg != ReplicationMessage::Ping {
                let _ = transport
                    .write_message(&ReplicationMessage::Nak { close: true })
                    .await;
                return;
            }

            let reply = match msg {
                ReplicationMessage::Ping => ReplicationMessage::Pong,
                ReplicationMessage::Master(policy) => ack_or_nak(node.become_master(policy), "master"),
                ReplicationMessage::SlaveOf { host, port } => {
                    ack_or_nak(node.become_slave(&host, port).await, "slaveof")
                }
                ReplicationMessage::Sync(cursor) => {
                    if !node.state().is_master_role() {
                        tracing::warn!(peer = %peer, state = %node.state(), "Refusing sync, not a master");
                        ReplicationMessage::nak()
                    } else {
                        if let Err(e) = sync::serve_sync(&node, cursor, transport.as_mut()).await {
                            tracing::warn!(peer = %peer, error = %e, "Catch-up aborted");
                            return;
                        }
                        continue;
                    }
                }
                ReplicationMessage::Listen => {
                    if node.state().is_master_role() {
                        node.register_slave(transport);
                        return;
                    }
                    tracing::warn!(peer = %peer, state = %node.state(), "Refusing listen, not a master");
                    ReplicationMessage::Nak { close: true }
                }
                ReplicationMessage::Transaction(txn) => {
                    match node.apply_replicated_write(txn, ApplyMode::Live) {
                        Ok(ApplyOutcome::Applied | ApplyOutcome::Duplicate) => ReplicationMessage::Ack,
                        Ok(ApplyOutcome::Gap { .. }) => ReplicationMessage::nak(),
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Rejected replicated transaction");
                            ReplicationMessage::nak()
                        }
                    }
                }
                ReplicationMessage::CreateStore(name) => {
                    if node.state().is_slave_role() {
                        ack_or_nak(node.local_create_store(&name), "+store")
                    } else {
                        ReplicationMessage::nak()
                    }
                }
                ReplicationMessage::DeleteStore(name) => {
                    if node.state().is_slave_role() {
                        ack_or_nak(node.local_delete_store(&name), "-store")
                    } else {
                        ReplicationMessage::nak()
                    }
                }
                ReplicationMessage::EndSync(status) => {
                    // Catch-up streams are consumed by the slave's own sync client
                    tracing::debug!(peer = %peer, ok = status.is_ok(), "endsync outside a catch-up stream");
                    ReplicationMessage::Ack
                }
                ReplicationMessage::Pong | ReplicationMessage::Ack | ReplicationMessage::Nak { .. } => {
                    tracing::debug!(peer = %peer, "Ignoring unsolicited reply");
                    continue;
                }
            };

            let close = matches!(reply, ReplicationMessage::Nak { close: true });
            if let Err(e) = transport.write_message(&reply).await {
                tracing::debug!(peer = %peer, error = %e, "Failed to write reply");
                return;
            }
            if close {
                return;
            }
        }
    }
}

fn ack_or_nak(result: Result<()>, request: &str) -> ReplicationMessage {
    match result {
        Ok(()) => ReplicationMessage::Ack,
        Err(e) => {
            tracing::warn!(request, error = %e, "Request refused");
            ReplicationMessage::nak()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::replication::config::ReplicationConfig;
    use crate::replication::protocol::MasterPolicy;
    use crate::replication::transaction::{Transaction, TransactionBody, TransactionId};
    use crate::replication::transport::{MemoryNetwork, MemoryTransport};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn connect(node: &Arc<Node>) -> MemoryTransport {
        let (client, server) = MemoryTransport::pair("client", "node");
        tokio::spawn(ConnectionManager::handle_connection(node.clone(), Box::new(server)));
        client
    }

    fn start_node() -> Arc<Node> {
        Node::start(
            ReplicationConfig::default(),
            Arc::new(MemoryEngine::new()),
            MemoryNetwork::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let node = start_node();
        let mut client = connect(&node);
        client.write_message(&ReplicationMessage::Ping).await.unwrap();
        assert_eq!(
            client.read_message().await.unwrap(),
            Some(ReplicationMessage::Pong)
        );
    }

    #[tokio::test]
    async fn test_master_request() {
        let node = start_node();
        let mut client = connect(&node);

        let policy = ReplicationMessage::Master(MasterPolicy::new(0));
        assert!(client.send_and_wait_ack(&policy, TIMEOUT).await.unwrap());
        assert_eq!(node.state(), NodeState::Master);

        // Already master
        assert!(!client.send_and_wait_ack(&policy, TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn test_listen_refused_unless_master() {
        let node = start_node();
        let mut client = connect(&node);
        client.write_message(&ReplicationMessage::Listen).await.unwrap();
        assert_eq!(
            client.read_message().await.unwrap(),
            Some(ReplicationMessage::Nak { close: true })
        );
        assert!(client.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listen_counts_toward_quorum() {
        let node = start_node();
        node.become_master(MasterPolicy::new(1)).unwrap();

        let mut client = connect(&node);
        client.write_message(&ReplicationMessage::Listen).await.unwrap();
        node.wait_for_state(NodeState::Master, TIMEOUT).await.unwrap();
        assert_eq!(node.slaves().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_rejected_by_master() {
        let node = start_node();
        node.become_master(MasterPolicy::new(0)).unwrap();
        let mut client = connect(&node);

        let txn = Transaction::new(
            "orders",
            TransactionId::new(),
            TransactionId::EMPTY,
            TransactionBody::query_update("CLEAR ALL"),
        );
        let acked = client
            .send_and_wait_ack(&ReplicationMessage::Transaction(txn), TIMEOUT)
            .await
            .unwrap();
        assert!(!acked);
        assert!(!node.chains().contains("orders"));
    }

    #[tokio::test]
    async fn test_sync_refused_unless_master() {
        let node = start_node();
        let mut client = connect(&node);
        let acked = client
            .send_and_wait_ack(&ReplicationMessage::Sync(Default::default()), TIMEOUT)
            .await
            .unwrap();
        assert!(!acked);
    }

    #[tokio::test]
    async fn test_broken_node_closes_connections() {
        let node = start_node();
        node.go_broken("test");
        let mut client = connect(&node);

        client.write_message(&ReplicationMessage::Ping).await.unwrap();
        assert_eq!(
            client.read_message().await.unwrap(),
            Some(ReplicationMessage::Pong)
        );

        let acked = client
            .send_and_wait_ack(&ReplicationMessage::Master(MasterPolicy::new(0)), TIMEOUT)
            .await
            .unwrap();
        assert!(!acked);
        assert!(client.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_store_name_gets_nak_and_keeps_connection() {
        use crate::replication::protocol::MAX_STORE_NAME_LEN;
        use crate::replication::transport::{decode_frame, encode_frame};
        use bytes::{BufMut, BytesMut};
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::{Framed, LengthDelimitedCodec};

        let node = start_node();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_node = node.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = TcpTransport::new(stream, 1024 * 1024);
            ConnectionManager::handle_connection(server_node, Box::new(transport)).await;
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let text = format!("+store {}\n", "x".repeat(MAX_STORE_NAME_LEN * 2));
        let mut frame = BytesMut::new();
        frame.put_slice(text.as_bytes());
        frame.put_u32_le(crc32fast::hash(text.as_bytes()));
        framed.send(frame.freeze()).await.unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(decode_frame(&reply).unwrap(), ReplicationMessage::nak());

        framed
            .send(encode_frame(&ReplicationMessage::Ping).unwrap())
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(decode_frame(&reply).unwrap(), ReplicationMessage::Pong);
        assert_eq!(node.chains().len(), 0);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let node = start_node();
        let manager = ConnectionManager::new(node.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { manager.serve(listener).await });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut client = TcpTransport::new(stream, 1024 * 1024);
        client.write_message(&ReplicationMessage::Ping).await.unwrap();
        assert_eq!(
            client.read_message().await.unwrap(),
            Some(ReplicationMessage::Pong)
        );

        node.shutdown();
        server.await.unwrap().unwrap();
    }
}
