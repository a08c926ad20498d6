//! Administrative client
//!
//! Sends role commands (`master`, `slaveof`) and liveness checks to a node.

use crate::replication::protocol::{MasterPolicy, ReplicationMessage};
use crate::replication::transport::{Connector, Transport};
use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Default time to wait for a reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one node's replication endpoint
pub struct AdminClient {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl AdminClient {
    /// Connect to the node at `addr`
    pub async fn connect(connector: &dyn Connector, addr: &str) -> Result<Self> {
        let transport = connector.connect(addr).await?;
        Ok(Self::from_transport(transport))
    }

    /// Wrap an established transport
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Address of the node
    pub fn peer(&self) -> &str {
        self.transport.peer()
    }

    /// Ping the node; returns the round-trip time
    pub async fn ping(&mut self) -> Result<Duration> {
        let started = Instant::now();
        self.transport.write_message(&ReplicationMessage::Ping).await?;

        let reply = tokio::time::timeout(self.timeout, self.transport.read_message())
            .await
            .map_err(|_| Error::timeout(format!("No pong from {}", self.transport.peer())))??;

        match reply {
            Some(ReplicationMessage::Pong) => Ok(started.elapsed()),
            Some(other) => Err(Error::protocol(format!(
                "Expected pong, got '{}'",
                other.kind()
            ))),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Designate the node master; `Ok(false)` when it refused
    pub async fn make_master(&mut self, policy: MasterPolicy) -> Result<bool> {
        self.transport
            .send_and_wait_ack(&ReplicationMessage::Master(policy), self.timeout)
            .await
    }

    /// Make the node a slave of `host:port`; `Ok(false)` when it refused
    pub async fn slave_of(&mut self, host: &str, port: u16) -> Result<bool> {
        let msg = ReplicationMessage::SlaveOf {
            host: host.to_string(),
            port,
        };
        self.transport.send_and_wait_ack(&msg, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::replication::config::ReplicationConfig;
    use crate::replication::node::Node;
    use crate::replication::state::NodeState;
    use crate::replication::transport::MemoryNetwork;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_admin_commands() {
        let network = MemoryNetwork::new();
        let node = Node::start(
            ReplicationConfig::default(),
            Arc::new(MemoryEngine::new()),
            network.clone(),
        )
        .unwrap();
        network.attach("node-a:15480", &node);

        let mut client = AdminClient::connect(network.as_ref(), "node-a:15480")
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(1));
        assert_eq!(client.peer(), "node-a:15480");
        client.ping().await.unwrap();

        assert!(client.make_master(MasterPolicy::new(0)).await.unwrap());
        assert_eq!(node.state(), NodeState::Master);

        // A master cannot be turned into a slave
        assert!(!client.slave_of("node-b", 15480).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_unknown_address() {
        let network = MemoryNetwork::new();
        assert!(AdminClient::connect(network.as_ref(), "nowhere:1").await.is_err());
    }
}
