//! Live slave registry
//!
//! Each slave that sent `listen` gets a bounded queue drained by its own
//! writer task, so a slow or dead slave never holds up delivery to the
//! others. A slave is dropped when its writer hits a write error or its
//! queue overflows; it will notice the closed subscription and resync.

use crate::replication::protocol::ReplicationMessage;
use crate::replication::transport::Transport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

/// Information about a registered slave
#[derive(Debug, Clone)]
pub struct SlaveConnection {
    /// Registry-assigned id
    pub id: u64,
    /// Peer address of the live channel
    pub address: String,
    /// Registration time
    pub connected_at: Instant,
}

struct SlaveHandle {
    info: SlaveConnection,
    sender: mpsc::Sender<ReplicationMessage>,
}

struct Inner {
    slaves: RwLock<HashMap<u64, SlaveHandle>>,
    live_count: watch::Sender<usize>,
    dropped: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) -> Option<SlaveConnection> {
        let mut slaves = self.slaves.write();
        let removed = slaves.remove(&id).map(|handle| handle.info);
        self.live_count.send_replace(slaves.len());
        if removed.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }
}

/// Registry of slaves subscribed to live broadcasts
pub struct SlaveRegistry {
    inner: Arc<Inner>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SlaveRegistry {
    /// Create a registry; `capacity` bounds each slave's pending broadcasts
    pub fn new(capacity: usize) -> Self {
        let (live_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                slaves: RwLock::new(HashMap::new()),
                live_count,
                dropped: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a slave's live channel and start its writer task
    pub fn register(&self, transport: Box<dyn Transport>) -> SlaveConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SlaveConnection {
            id,
            address: transport.peer().to_string(),
            connected_at: Instant::now(),
        };
        let (sender, receiver) = mpsc::channel(self.capacity);

        {
            let mut slaves = self.inner.slaves.write();
            slaves.insert(
                id,
                SlaveHandle {
                    info: info.clone(),
                    sender,
                },
            );
            self.inner.live_count.send_replace(slaves.len());
        }

        tracing::info!(slave = id, peer = %info.address, "Slave registered for live broadcasts");
        tokio::spawn(run_writer(self.inner.clone(), id, transport, receiver));
        info
    }

    /// Queue `msg` for every live slave; returns how many accepted it
    pub fn broadcast(&self, msg: &ReplicationMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let slaves = self.inner.slaves.read();
            for (id, slave) in slaves.iter() {
                match slave.sender.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            slave = id,
                            peer = %slave.info.address,
                            "Slave broadcast queue full, dropping slave"
                        );
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        for id in dead {
            self.inner.remove(id);
        }
        delivered
    }

    /// Remove a slave; its writer task ends and the channel closes
    pub fn remove(&self, id: u64) -> Option<SlaveConnection> {
        self.inner.remove(id)
    }

    /// Drop every slave
    pub fn clear(&self) {
        let mut slaves = self.inner.slaves.write();
        slaves.clear();
        self.inner.live_count.send_replace(0);
    }

    /// Number of live slaves
    pub fn len(&self) -> usize {
        self.inner.slaves.read().len()
    }

    /// True when no slave is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live slaves, ordered by registration
    pub fn list(&self) -> Vec<SlaveConnection> {
        let mut slaves: Vec<_> = self
            .inner
            .slaves
            .read()
            .values()
            .map(|handle| handle.info.clone())
            .collect();
        slaves.sort_by_key(|slave| slave.id);
        slaves
    }

    /// Slaves removed since the registry was created
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Watch the live slave count
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.inner.live_count.subscribe()
    }
}

async fn run_writer(
    inner: Arc<Inner>,
    id: u64,
    mut transport: Box<dyn Transport>,
    mut receiver: mpsc::Receiver<ReplicationMessage>,
) {
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = transport.write_message(&msg).await {
            tracing::warn!(slave = id, peer = %transport.peer(), error = %e, "Slave live channel failed");
            if inner.remove(id).is_some() {
                tracing::info!(slave = id, "Slave removed from registry");
            }
            return;
        }
    }
    tracing::debug!(slave = id, peer = %transport.peer(), "Slave writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::transport::MemoryTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_broadcast_reaches_every_slave() {
        let registry = SlaveRegistry::new(16);
        let (master_a, mut slave_a) = MemoryTransport::pair("master", "slave-a");
        let (master_b, mut slave_b) = MemoryTransport::pair("master", "slave-b");
        registry.register(Box::new(master_a));
        registry.register(Box::new(master_b));

        assert_eq!(registry.broadcast(&ReplicationMessage::Ping), 2);
        assert_eq!(
            slave_a.read_message().await.unwrap(),
            Some(ReplicationMessage::Ping)
        );
        assert_eq!(
            slave_b.read_message().await.unwrap(),
            Some(ReplicationMessage::Ping)
        );
    }

    #[tokio::test]
    async fn test_dead_slave_removed_lazily() {
        let registry = SlaveRegistry::new(16);
        let (master_side, slave_side) = MemoryTransport::pair("master", "slave");
        registry.register(Box::new(master_side));
        drop(slave_side);

        let mut count = registry.subscribe_count();
        assert_eq!(*count.borrow_and_update(), 1);

        registry.broadcast(&ReplicationMessage::Ping);
        tokio::time::timeout(Duration::from_secs(1), count.wait_for(|n| *n == 0))
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_slave() {
        let registry = SlaveRegistry::new(1);
        let (master_side, _slave_side) = MemoryTransport::pair("master", "slave");
        registry.register(Box::new(master_side));

        // The writer task has not run yet, so the second message overflows
        registry.broadcast(&ReplicationMessage::Ping);
        assert_eq!(registry.broadcast(&ReplicationMessage::Ping), 0);
        assert!(registry.is_empty());
        assert_eq!(registry.dropped(), 1);
    }

    #[tokio::test]
    async fn test_count_watch() {
        let registry = SlaveRegistry::new(4);
        let count = registry.subscribe_count();
        let (a, _a) = MemoryTransport::pair("m", "a");
        let info = registry.register(Box::new(a));
        assert_eq!(*count.borrow(), 1);
        assert_eq!(registry.list()[0].address, "a");

        registry.remove(info.id);
        assert_eq!(*count.borrow(), 0);
    }
}
