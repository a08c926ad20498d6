//! Node orchestrator
//!
//! [`Node`] owns the lifecycle state, the per-store chains and the slave
//! registry, and bridges transactions to the [`StorageEngine`]:
//!
//! - Master role: [`Node::accept_client_write`] stamps and queues client
//!   writes; the completion loop broadcasts them once the engine applied them.
//! - Slave role: [`Node::apply_replicated_write`] validates predecessors and
//!   queues replicated writes; a live gap triggers catch-up.
//! - A failed local apply puts the node in [`NodeState::Broken`].

use crate::engine::{JobCompleted, JobOutcome, StorageEngine};
use crate::replication::chain::{AppendOutcome, ChainRegistry, StoreChain};
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::{validate_store_name, MasterPolicy, ReplicationMessage, SyncStatus};
use crate::replication::slaves::{SlaveConnection, SlaveRegistry};
use crate::replication::state::NodeState;
use crate::replication::sync;
use crate::replication::transaction::{Transaction, TransactionBody, TransactionId};
use crate::replication::transport::{Connector, Transport};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

/// Path a replicated transaction arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Live broadcast from the master
    Live,
    /// Catch-up replay
    Sync,
}

/// Result of [`Node::apply_replicated_write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Queued for local apply
    Applied,
    /// Already known; nothing changed
    Duplicate,
    /// Predecessor mismatch; nothing changed
    Gap {
        /// Local chain tail the predecessor should have matched
        expected: TransactionId,
    },
}

/// Node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Client writes accepted as master
    pub writes_accepted: u64,
    /// Replicated writes queued for local apply
    pub replicated_applied: u64,
    /// Replicated writes ignored as already known
    pub duplicates_ignored: u64,
    /// Predecessor mismatches seen
    pub gaps_detected: u64,
    /// Messages broadcast to live slaves
    pub broadcasts_sent: u64,
    /// Slaves removed from the live registry
    pub slaves_dropped: u64,
    /// Catch-up handshakes served as master
    pub syncs_served: u64,
    /// Catch-up handshakes that ended with `endsync OK`
    pub syncs_completed: u64,
    /// Catch-up handshakes that ended with `endsync FAIL`
    pub sync_failures: u64,
}

/// What the caller of [`Node::complete_sync`] should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNext {
    /// In sync
    Done,
    /// Run another catch-up round
    Again,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Replicated,
}

#[derive(Debug)]
struct PendingJob {
    txn: Transaction,
    origin: Origin,
}

enum FollowEnd {
    Resync,
    Closed,
    Stopped,
}

/// A replication node
pub struct Node {
    config: ReplicationConfig,
    state: watch::Sender<NodeState>,
    chains: ChainRegistry,
    engine: Arc<dyn StorageEngine>,
    connector: Arc<dyn Connector>,
    slaves: SlaveRegistry,
    pending: DashMap<TransactionId, PendingJob>,
    policy: Mutex<Option<MasterPolicy>>,
    master_addr: Mutex<Option<String>>,
    session: Mutex<Option<CancellationToken>>,
    resync_pending: AtomicBool,
    resync_requested: Notify,
    full_resync_attempts: AtomicU32,
    stats: Mutex<NodeStats>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("state", &self.state())
            .field("stores", &self.chains.len())
            .field("slaves", &self.slaves.len())
            .finish()
    }
}

impl Node {
    /// Start a node in `AwaitingMaster`
    ///
    /// Rebuilds every store chain from the engine's history and spawns the
    /// job completion loop. Must be called inside a Tokio runtime.
    pub fn start(
        config: ReplicationConfig,
        engine: Arc<dyn StorageEngine>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::config)?;

        let chains = ChainRegistry::new();
        for store in engine.list_stores()? {
            let history = engine.transaction_history(&store)?;
            tracing::debug!(store = %store, transactions = history.len(), "Recovered store chain");
            chains.insert(store, StoreChain::from_history(history.iter().map(|e| e.id)));
        }
        tracing::info!(stores = chains.len(), "Store chains recovered");

        let jobs = engine.subscribe_jobs();
        let (state, _) = watch::channel(NodeState::AwaitingMaster);
        let slaves = SlaveRegistry::new(config.slave_channel_capacity);

        let node = Arc::new(Self {
            config,
            state,
            chains,
            engine,
            connector,
            slaves,
            pending: DashMap::new(),
            policy: Mutex::new(None),
            master_addr: Mutex::new(None),
            session: Mutex::new(None),
            resync_pending: AtomicBool::new(false),
            resync_requested: Notify::new(),
            full_resync_attempts: AtomicU32::new(0),
            stats: Mutex::new(NodeStats::default()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_completion_loop(
            Arc::downgrade(&node),
            jobs,
            node.shutdown.clone(),
        ));
        Ok(node)
    }

    /// Current state
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Wait until the node reaches `target`
    pub async fn wait_for_state(&self, target: NodeState, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("state channel closed")),
            Err(_) => Err(Error::timeout(format!(
                "Node did not reach {} (currently {})",
                target,
                self.state()
            ))),
        }
    }

    /// Replication settings
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Per-store chains
    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Storage engine
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Live slaves
    pub fn slaves(&self) -> Vec<SlaveConnection> {
        self.slaves.list()
    }

    /// Master policy, once designated master
    pub fn policy(&self) -> Option<MasterPolicy> {
        *self.policy.lock()
    }

    /// Address of the master this node follows
    pub fn master_address(&self) -> Option<String> {
        self.master_addr.lock().clone()
    }

    /// Token cancelled on shutdown and when the node breaks
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get statistics
    pub fn stats(&self) -> NodeStats {
        let mut stats = self.stats.lock().clone();
        stats.slaves_dropped = self.slaves.dropped();
        stats
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut NodeStats)) {
        update(&mut self.stats.lock());
    }

    /// Move to `to` if the transition table allows it from the current state
    fn transition(&self, to: NodeState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                tracing::info!(from = %from, to = %to, "Node state changed");
                true
            }
            None => false,
        }
    }

    /// Move from exactly `from` to `to`
    fn transition_from(&self, from: NodeState, to: NodeState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from && from.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(from = %from, to = %to, "Node state changed");
        }
        changed
    }

    /// Designate this node master
    ///
    /// With `write_quorum = 0` the node becomes `Master` at once; otherwise
    /// it waits in `AwaitingSlaveQuorum` until that many slaves subscribed.
    pub fn become_master(self: &Arc<Self>, policy: MasterPolicy) -> Result<()> {
        let target = if policy.write_quorum == 0 {
            NodeState::Master
        } else {
            NodeState::AwaitingSlaveQuorum
        };
        if !self.transition_from(NodeState::AwaitingMaster, target) {
            return Err(Error::InvalidTransition {
                from: self.state(),
                to: target,
            });
        }
        *self.policy.lock() = Some(policy);
        tracing::info!(write_quorum = policy.write_quorum, "Designated master");

        if target == NodeState::AwaitingSlaveQuorum {
            tokio::spawn(self.clone().await_slave_quorum(policy.write_quorum as usize));
        }
        Ok(())
    }

    async fn await_slave_quorum(self: Arc<Self>, quorum: usize) {
        let mut count = self.slaves.subscribe_count();
        let reached = tokio::select! {
            _ = self.shutdown.cancelled() => false,
            result = count.wait_for(|live| *live >= quorum) => result.is_ok(),
        };

        if reached && self.transition_from(NodeState::AwaitingSlaveQuorum, NodeState::Master) {
            tracing::info!(quorum, "Slave quorum reached, accepting writes");
        }
    }

    /// Register a slave's live channel
    pub fn register_slave(&self, transport: Box<dyn Transport>) -> SlaveConnection {
        self.slaves.register(transport)
    }

    /// Close a slave's live channel; the slave reconnects and catches up
    pub fn disconnect_slave(&self, id: u64) -> Option<SlaveConnection> {
        let removed = self.slaves.remove(id);
        if let Some(slave) = &removed {
            tracing::info!(slave = slave.id, peer = %slave.address, "Disconnected slave");
        }
        removed
    }

    /// Make this node a slave of `host:port`
    ///
    /// Opens the live subscription first so no broadcast is missed, then
    /// moves to `SyncingToMaster` and starts catch-up in the background. A
    /// node that is already a slave may be pointed at a different master.
    pub async fn become_slave(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let current = self.state();
        if !matches!(current, NodeState::AwaitingMaster | NodeState::Slave) {
            return Err(Error::InvalidTransition {
                from: current,
                to: NodeState::SyncingToMaster,
            });
        }

        let addr = format!("{}:{}", host, port);
        let live = self.subscribe(&addr).await?;

        if !self.transition_from(current, NodeState::SyncingToMaster) {
            return Err(Error::InvalidTransition {
                from: self.state(),
                to: NodeState::SyncingToMaster,
            });
        }

        let session = self.shutdown.child_token();
        if let Some(previous) = self.session.lock().replace(session.clone()) {
            previous.cancel();
        }
        *self.master_addr.lock() = Some(addr.clone());
        self.full_resync_attempts.store(0, Ordering::SeqCst);
        self.resync_pending.store(false, Ordering::SeqCst);
        tracing::info!(master = %addr, "Following master");

        tokio::spawn(self.clone().run_slave_session(addr, session, live));
        Ok(())
    }

    /// Open the live channel to the master
    ///
    /// `listen` has no reply, so the master may serve the following `sync`
    /// before it registers this channel. A write completing in between is
    /// in neither stream; the next broadcast for that store then carries an
    /// unknown predecessor, which triggers another catch-up round.
    async fn subscribe(&self, addr: &str) -> Result<Box<dyn Transport>> {
        let mut live = self.connector.connect(addr).await?;
        live.write_message(&ReplicationMessage::Listen).await?;
        Ok(live)
    }

    fn session_active(&self, session: &CancellationToken) -> bool {
        !session.is_cancelled() && self.state() != NodeState::Broken
    }

    async fn sleep_or_cancel(session: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = session.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run_slave_session(
        self: Arc<Self>,
        addr: String,
        session: CancellationToken,
        live: Box<dyn Transport>,
    ) {
        let initial_delay = self.config.reconnect_initial_delay;
        let max_delay = self.config.reconnect_max_delay;
        let mut delay = initial_delay;
        let mut subscription = Some(live);

        while self.session_active(&session) {
            let mut live = match subscription.take() {
                Some(live) => live,
                None => match self.subscribe(&addr).await {
                    Ok(live) => live,
                    Err(e) => {
                        tracing::warn!(master = %addr, error = %e, retry_in = ?delay, "Failed to subscribe to master");
                        if !Self::sleep_or_cancel(&session, delay).await {
                            break;
                        }
                        delay = (delay * 2).min(max_delay);
                        continue;
                    }
                },
            };

            if let Err(e) = self.catch_up(&addr).await {
                if self.state() == NodeState::Broken {
                    break;
                }
                tracing::warn!(master = %addr, error = %e, retry_in = ?delay, "Catch-up failed");
                if !Self::sleep_or_cancel(&session, delay).await {
                    break;
                }
                delay = (delay * 2).min(max_delay);
                continue;
            }
            delay = initial_delay;

            match self.follow(live.as_mut(), &session).await {
                FollowEnd::Resync => subscription = Some(live),
                FollowEnd::Closed => {
                    tracing::warn!(master = %addr, "Live subscription lost, resyncing");
                    self.transition_from(NodeState::Slave, NodeState::SyncingToMaster);
                }
                FollowEnd::Stopped => break,
            }
        }

        tracing::debug!(master = %addr, "Slave session ended");
    }

    /// Run catch-up rounds until the node is in sync
    async fn catch_up(&self, addr: &str) -> Result<()> {
        loop {
            let status = sync::run_catch_up(self, addr).await?;
            match self.complete_sync(&status)? {
                SyncNext::Done => return Ok(()),
                SyncNext::Again => continue,
            }
        }
    }

    async fn follow(&self, live: &mut dyn Transport, session: &CancellationToken) -> FollowEnd {
        loop {
            if !self.session_active(session) {
                return FollowEnd::Stopped;
            }

            let msg = tokio::select! {
                biased;
                _ = session.cancelled() => return FollowEnd::Stopped,
                _ = self.resync_requested.notified() => return FollowEnd::Resync,
                msg = live.read_message() => msg,
            };

            match msg {
                Ok(Some(ReplicationMessage::Transaction(txn))) => {
                    if let Err(e) = self.apply_replicated_write(txn, ApplyMode::Live) {
                        if self.state() == NodeState::Broken {
                            return FollowEnd::Stopped;
                        }
                        tracing::warn!(error = %e, "Failed to apply live broadcast");
                        self.request_resync();
                    }
                }
                Ok(Some(ReplicationMessage::CreateStore(name))) => {
                    if let Err(e) = self.local_create_store(&name) {
                        tracing::warn!(store = %name, error = %e, "Failed to create broadcast store");
                    }
                }
                Ok(Some(ReplicationMessage::DeleteStore(name))) => {
                    if let Err(e) = self.local_delete_store(&name) {
                        tracing::warn!(store = %name, error = %e, "Failed to delete broadcast store");
                    }
                }
                Ok(Some(other)) => {
                    tracing::debug!(kind = %other.kind(), "Ignoring message on live channel");
                }
                Ok(None) => return FollowEnd::Closed,
                Err(e) => {
                    tracing::warn!(error = %e, "Live channel error");
                    return FollowEnd::Closed;
                }
            }
        }
    }

    /// Schedule catch-up after a missed broadcast
    ///
    /// A `Slave` goes back to `SyncingToMaster` at once; a node already
    /// syncing runs one more round after the current one succeeds.
    pub fn request_resync(&self) {
        match self.state() {
            NodeState::Slave => {
                if self.transition_from(NodeState::Slave, NodeState::SyncingToMaster) {
                    self.resync_requested.notify_one();
                }
            }
            NodeState::SyncingToMaster | NodeState::FullResyncToMaster => {
                self.resync_pending.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /// Handle the end of a catch-up stream
    ///
    /// `OK` moves the node to `Slave`. `FAIL` drops the failed stores so the
    /// next round fetches them from scratch, and breaks the node once
    /// `max_full_resync_attempts` full resyncs in a row have failed.
    pub fn complete_sync(&self, status: &SyncStatus) -> Result<SyncNext> {
        match status {
            SyncStatus::Ok => {
                self.record(|s| s.syncs_completed += 1);
                self.full_resync_attempts.store(0, Ordering::SeqCst);
                if self.state().is_syncing() {
                    self.transition(NodeState::Slave);
                }

                if self.resync_pending.swap(false, Ordering::SeqCst)
                    && self.transition_from(NodeState::Slave, NodeState::SyncingToMaster)
                {
                    tracing::info!("Broadcasts were missed during catch-up, syncing again");
                    return Ok(SyncNext::Again);
                }
                Ok(SyncNext::Done)
            }
            SyncStatus::Failed { stores } => {
                self.record(|s| s.sync_failures += 1);

                match self.state() {
                    NodeState::SyncingToMaster => {
                        self.transition(NodeState::FullResyncToMaster);
                    }
                    NodeState::FullResyncToMaster => {
                        let attempts = self.full_resync_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempts >= self.config.max_full_resync_attempts {
                            let reason = format!("full resync failed {} times", attempts);
                            self.go_broken(&reason);
                            return Err(Error::broken(reason));
                        }
                    }
                    state => {
                        return Err(Error::sync(format!("endsync received while {}", state)));
                    }
                }

                tracing::warn!(stores = ?stores, "Catch-up failed, dropping stores for full resync");
                for store in stores {
                    self.local_delete_store(store)?;
                }
                Ok(SyncNext::Again)
            }
        }
    }

    /// Accept a client write (master only)
    ///
    /// Returns the new transaction id as soon as the engine queued it; slaves
    /// receive it once the engine reports completion.
    pub fn accept_client_write(&self, store_id: &str, body: TransactionBody) -> Result<TransactionId> {
        let state = self.state();
        if !state.accepts_client_writes() {
            return Err(Error::NotMaster { state });
        }

        let id = TransactionId::new();
        let predecessor = self
            .chains
            .with_chain_mut(store_id, |chain| -> Result<TransactionId> {
                let predecessor = chain
                    .queue(id)
                    .ok_or_else(|| Error::internal(format!("transaction id {} reused", id)))?;
                let txn = Transaction::new(store_id, id, predecessor, body);
                self.submit(txn, Origin::Client).inspect_err(|_| {
                    chain.unqueue(id, predecessor);
                })?;
                Ok(predecessor)
            })
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))??;

        self.record(|s| s.writes_accepted += 1);
        tracing::debug!(store = %store_id, id = %id, predecessor = %predecessor, "Accepted client write");
        Ok(id)
    }

    /// Validate and apply a transaction replicated from the master
    ///
    /// Duplicates are a no-op. An unknown store is created first. A
    /// predecessor mismatch leaves the chain untouched; on the live path it
    /// also schedules catch-up.
    pub fn apply_replicated_write(&self, txn: Transaction, mode: ApplyMode) -> Result<ApplyOutcome> {
        let state = self.state();
        if state == NodeState::Broken {
            return Err(Error::broken("node refuses replicated writes"));
        }
        if !state.is_slave_role() {
            return Err(Error::sync(format!(
                "replicated transaction rejected while {}",
                state
            )));
        }
        validate_store_name(&txn.store_id)?;

        if self.chains.have_transaction(&txn.store_id, txn.id) {
            self.record(|s| s.duplicates_ignored += 1);
            return Ok(ApplyOutcome::Duplicate);
        }
        if !self.chains.contains(&txn.store_id) {
            self.ensure_local_store(&txn.store_id)?;
        }

        let store_id = txn.store_id.clone();
        let (id, actual) = (txn.id, txn.predecessor_id);
        let outcome = self
            .chains
            .with_chain_mut(&store_id, |chain| -> Result<ApplyOutcome> {
                match chain.try_append(id, actual) {
                    AppendOutcome::Duplicate => Ok(ApplyOutcome::Duplicate),
                    AppendOutcome::Gap { expected } => Ok(ApplyOutcome::Gap { expected }),
                    AppendOutcome::Appended { predecessor } => {
                        self.submit(txn, Origin::Replicated).inspect_err(|_| {
                            chain.unqueue(id, predecessor);
                        })?;
                        Ok(ApplyOutcome::Applied)
                    }
                }
            })
            .ok_or_else(|| Error::StoreNotFound(store_id.clone()))??;

        match outcome {
            ApplyOutcome::Applied => {
                self.record(|s| s.replicated_applied += 1);
                tracing::debug!(store = %store_id, id = %id, ?mode, "Applied replicated write");
            }
            ApplyOutcome::Duplicate => self.record(|s| s.duplicates_ignored += 1),
            ApplyOutcome::Gap { expected } => {
                self.record(|s| s.gaps_detected += 1);
                let gap = Error::CausalGap {
                    store: store_id.clone(),
                    expected,
                    actual,
                };
                tracing::warn!(id = %id, ?mode, error = %gap, "Rejected out-of-order transaction");
                if mode == ApplyMode::Live {
                    self.request_resync();
                }
            }
        }
        Ok(outcome)
    }

    /// Hand a queued transaction to the engine, tracking it until completion
    fn submit(&self, txn: Transaction, origin: Origin) -> Result<()> {
        self.pending.insert(
            txn.id,
            PendingJob {
                txn: txn.clone(),
                origin,
            },
        );
        let queued = self.engine.queue_transaction(&txn);
        if queued.is_err() {
            self.pending.remove(&txn.id);
        }
        queued
    }

    /// Create a store and announce it to live slaves (master only)
    pub fn create_store(&self, name: &str) -> Result<()> {
        let state = self.state();
        if !state.accepts_client_writes() {
            return Err(Error::NotMaster { state });
        }
        validate_store_name(name)?;
        if self.engine.does_store_exist(name)? {
            return Err(Error::storage(format!("store '{}' already exists", name)));
        }

        self.engine.create_store(name)?;
        self.chains.insert(name, StoreChain::new());
        tracing::info!(store = %name, "Store created");
        self.broadcast(&ReplicationMessage::CreateStore(name.to_string()));
        Ok(())
    }

    /// Delete a store and announce it to live slaves (master only)
    pub fn delete_store(&self, name: &str) -> Result<()> {
        let state = self.state();
        if !state.accepts_client_writes() {
            return Err(Error::NotMaster { state });
        }

        self.engine.delete_store(name)?;
        self.chains.remove(name);
        tracing::info!(store = %name, "Store deleted");
        self.broadcast(&ReplicationMessage::DeleteStore(name.to_string()));
        Ok(())
    }

    /// Create a store announced by the master; no-op if it exists
    pub fn local_create_store(&self, name: &str) -> Result<()> {
        validate_store_name(name)?;
        self.ensure_local_store(name).map(|_| ())
    }

    /// Drop a store the master no longer has; no-op if unknown
    pub fn local_delete_store(&self, name: &str) -> Result<()> {
        self.chains.remove(name);
        if self.engine.does_store_exist(name)? {
            self.engine.delete_store(name)?;
            tracing::info!(store = %name, "Dropped local store");
        }
        Ok(())
    }

    fn ensure_local_store(&self, name: &str) -> Result<bool> {
        if !self.engine.does_store_exist(name)? {
            if let Err(e) = self.engine.create_store(name) {
                // Lost a race with another connection creating it
                if !self.engine.does_store_exist(name)? {
                    return Err(e);
                }
            } else {
                tracing::info!(store = %name, "Created local store");
            }
        }
        Ok(self.chains.ensure(name))
    }

    fn broadcast(&self, msg: &ReplicationMessage) {
        let delivered = self.slaves.broadcast(msg);
        self.record(|s| s.broadcasts_sent += 1);
        tracing::debug!(kind = %msg.kind(), delivered, "Broadcast to slaves");
    }

    fn on_job_completed(&self, event: JobCompleted) {
        let Some((_, job)) = self.pending.remove(&event.job_id) else {
            tracing::debug!(store = %event.store_id, id = %event.job_id, "Completion for untracked job");
            return;
        };

        match &event.outcome {
            JobOutcome::Succeeded => {}
            JobOutcome::PreconditionFailed(reason) => {
                tracing::info!(store = %event.store_id, id = %event.job_id, reason = %reason, "Transaction preconditions not met");
            }
            JobOutcome::Failed(reason) => {
                self.go_broken(&format!(
                    "transaction {} in store '{}' failed to apply: {}",
                    event.job_id, event.store_id, reason
                ));
                return;
            }
        }

        self.chains.commit(&event.store_id, event.job_id);

        // The id holds a chain slot even when its preconditions failed, so
        // slaves must see it to keep their predecessors aligned
        if job.origin == Origin::Client && self.state().is_master_role() {
            self.broadcast(&ReplicationMessage::Transaction(job.txn));
        }
    }

    /// Settle pending jobs from the engine's history
    ///
    /// Used after completion events were dropped. Every pending job the
    /// history already records is completed with its recorded outcome, in
    /// history order; jobs not yet in the history stay pending.
    fn reconcile_pending(&self) {
        let mut stores: Vec<String> = self
            .pending
            .iter()
            .map(|job| job.txn.store_id.clone())
            .collect();
        stores.sort();
        stores.dedup();

        let mut settled = 0usize;
        for store in stores {
            let history = match self.engine.transaction_history(&store) {
                Ok(history) => history,
                Err(Error::StoreNotFound(_)) => {
                    self.pending.retain(|_, job| job.txn.store_id != store);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(store = %store, error = %e, "Cannot reconcile pending jobs");
                    continue;
                }
            };

            for entry in history {
                if !self.pending.contains_key(&entry.id) {
                    continue;
                }
                self.on_job_completed(JobCompleted {
                    store_id: store.clone(),
                    job_id: entry.id,
                    outcome: entry.outcome,
                });
                settled += 1;
                if self.state() == NodeState::Broken {
                    return;
                }
            }
        }

        tracing::info!(settled, pending = self.pending.len(), "Pending jobs reconciled");
    }

    /// Enter `Broken`: stop the engine, drop slaves and stop serving
    pub fn go_broken(&self, reason: &str) {
        if self.transition(NodeState::Broken) {
            tracing::error!(reason = %reason, "Node is broken, refusing further work until restart");
            self.engine.shutdown();
            self.slaves.clear();
            self.shutdown.cancel();
        }
    }

    /// Stop background tasks and the listener
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutting down node");
            self.shutdown.cancel();
            self.slaves.clear();
            self.engine.shutdown();
        }
    }
}

async fn run_completion_loop(
    node: Weak<Node>,
    mut jobs: broadcast::Receiver<JobCompleted>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = jobs.recv() => event,
        };

        match event {
            Ok(event) => match node.upgrade() {
                Some(node) => node.on_job_completed(event),
                None => break,
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Job completion loop lagged, reconciling with engine history");
                match node.upgrade() {
                    Some(node) => node.reconcile_pending(),
                    None => break,
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Job completion loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::replication::transport::MemoryNetwork;

    fn start_node(engine: Arc<MemoryEngine>) -> Arc<Node> {
        Node::start(ReplicationConfig::default(), engine, MemoryNetwork::new()).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn insert(triple: &str) -> TransactionBody {
        TransactionBody::update("", "", triple)
    }

    /// Node forced into the slave role without a master session
    fn slave_node(engine: Arc<MemoryEngine>) -> Arc<Node> {
        let node = start_node(engine);
        assert!(node.transition_from(NodeState::AwaitingMaster, NodeState::SyncingToMaster));
        assert!(node.transition_from(NodeState::SyncingToMaster, NodeState::Slave));
        node
    }

    #[tokio::test]
    async fn test_start_recovers_chains() {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_store("orders").unwrap();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        engine.queue_update_transaction(t1, "orders", "", "", "<a> <b> <c> .").unwrap();
        engine.queue_query_update_transaction(t2, "orders", "CLEAR ALL").unwrap();

        let node = start_node(engine);
        assert_eq!(node.state(), NodeState::AwaitingMaster);
        assert_eq!(node.chains().last("orders"), Some(t2));
        assert!(node.chains().have_transaction("orders", t1));
    }

    #[tokio::test]
    async fn test_write_rejected_unless_master() {
        let node = start_node(Arc::new(MemoryEngine::new()));
        let err = node.accept_client_write("orders", insert("<a> <b> <c> .")).unwrap_err();
        assert!(matches!(
            err,
            Error::NotMaster {
                state: NodeState::AwaitingMaster
            }
        ));
        assert_eq!(node.stats().writes_accepted, 0);
    }

    #[tokio::test]
    async fn test_master_write_commits() {
        let engine = Arc::new(MemoryEngine::new());
        let node = start_node(engine.clone());
        node.become_master(MasterPolicy::new(0)).unwrap();
        assert_eq!(node.state(), NodeState::Master);
        node.create_store("orders").unwrap();

        let t1 = node.accept_client_write("orders", insert("<a> <b> <c> .")).unwrap();
        let t2 = node.accept_client_write("orders", insert("<a> <b> <d> .")).unwrap();
        assert_eq!(node.chains().last("orders"), Some(t2));

        eventually(|| node.chains().snapshot("orders").unwrap().committed_len() == 2).await;
        assert_eq!(engine.history_ids("orders"), vec![t1, t2]);
        assert_eq!(node.stats().writes_accepted, 2);
    }

    #[tokio::test]
    async fn test_write_to_unknown_store() {
        let node = start_node(Arc::new(MemoryEngine::new()));
        node.become_master(MasterPolicy::new(0)).unwrap();
        let err = node.accept_client_write("nope", insert("<a> <b> <c> .")).unwrap_err();
        assert!(matches!(err, Error::StoreNotFound(_)));
    }

    #[tokio::test]
    async fn test_become_master_twice_fails() {
        let node = start_node(Arc::new(MemoryEngine::new()));
        node.become_master(MasterPolicy::new(2)).unwrap();
        assert_eq!(node.state(), NodeState::AwaitingSlaveQuorum);
        assert!(matches!(
            node.become_master(MasterPolicy::new(0)),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(node.policy(), Some(MasterPolicy::new(2)));
    }

    #[tokio::test]
    async fn test_replicated_duplicate_and_gap() {
        let engine = Arc::new(MemoryEngine::new());
        let node = slave_node(engine.clone());

        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        let t3 = TransactionId::new();
        let txn = |id, pred| Transaction::new("orders", id, pred, insert("<a> <b> <c> ."));

        assert_eq!(
            node.apply_replicated_write(txn(t1, TransactionId::EMPTY), ApplyMode::Sync).unwrap(),
            ApplyOutcome::Applied
        );
        assert!(engine.does_store_exist("orders").unwrap());
        assert_eq!(
            node.apply_replicated_write(txn(t1, TransactionId::EMPTY), ApplyMode::Sync).unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(
            node.apply_replicated_write(txn(t3, t2), ApplyMode::Sync).unwrap(),
            ApplyOutcome::Gap { expected: t1 }
        );
        assert_eq!(node.chains().last("orders"), Some(t1));
        assert_eq!(node.state(), NodeState::Slave);

        let stats = node.stats();
        assert_eq!(stats.replicated_applied, 1);
        assert_eq!(stats.duplicates_ignored, 1);
        assert_eq!(stats.gaps_detected, 1);
    }

    #[tokio::test]
    async fn test_live_gap_requests_resync() {
        let node = slave_node(Arc::new(MemoryEngine::new()));
        let txn = Transaction::new(
            "orders",
            TransactionId::new(),
            TransactionId::new(),
            insert("<a> <b> <c> ."),
        );

        let outcome = node.apply_replicated_write(txn, ApplyMode::Live).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Gap { .. }));
        assert_eq!(node.state(), NodeState::SyncingToMaster);
    }

    #[tokio::test]
    async fn test_master_rejects_replicated_write() {
        let node = start_node(Arc::new(MemoryEngine::new()));
        node.become_master(MasterPolicy::new(0)).unwrap();
        let txn = Transaction::new(
            "orders",
            TransactionId::new(),
            TransactionId::EMPTY,
            insert("<a> <b> <c> ."),
        );
        assert!(node.apply_replicated_write(txn, ApplyMode::Live).is_err());
    }

    #[tokio::test]
    async fn test_failed_apply_breaks_node() {
        let engine = Arc::new(MemoryEngine::new());
        let node = slave_node(engine.clone());
        let id = TransactionId::new();
        engine.fail_transaction(id);

        let txn = Transaction::new("orders", id, TransactionId::EMPTY, insert("<a> <b> <c> ."));
        node.apply_replicated_write(txn, ApplyMode::Live).unwrap();

        node.wait_for_state(NodeState::Broken, Duration::from_secs(1)).await.unwrap();
        assert!(engine.is_shut_down());
        assert!(node.shutdown_token().is_cancelled());

        let next = Transaction::new("orders", TransactionId::new(), id, insert("<x> <y> <z> ."));
        assert!(matches!(
            node.apply_replicated_write(next, ApplyMode::Live),
            Err(Error::Broken(_))
        ));
    }

    #[tokio::test]
    async fn test_lagged_completions_are_reconciled() {
        let engine = Arc::new(MemoryEngine::with_event_capacity(8));
        let node = start_node(engine.clone());
        node.become_master(MasterPolicy::new(0)).unwrap();
        node.create_store("orders").unwrap();

        // No await in between, so the completion loop falls behind
        let written: Vec<_> = (0..50)
            .map(|i| {
                node.accept_client_write("orders", insert(&format!("<s{}> <p> <o> .", i)))
                    .unwrap()
            })
            .collect();

        eventually(|| node.pending.is_empty()).await;
        let chain = node.chains().snapshot("orders").unwrap();
        assert_eq!(chain.queued_len(), 0);
        assert_eq!(chain.committed_len(), written.len());
        // +store plus one broadcast per write
        assert_eq!(node.stats().broadcasts_sent, 51);
    }

    #[tokio::test]
    async fn test_lagged_failure_still_breaks_node() {
        let engine = Arc::new(MemoryEngine::with_event_capacity(4));
        let node = slave_node(engine.clone());
        let ids: Vec<_> = (0..20).map(|_| TransactionId::new()).collect();
        engine.fail_transaction(ids[0]);

        let mut predecessor = TransactionId::EMPTY;
        for id in &ids {
            let txn = Transaction::new("orders", *id, predecessor, insert("<a> <b> <c> ."));
            assert_eq!(
                node.apply_replicated_write(txn, ApplyMode::Live).unwrap(),
                ApplyOutcome::Applied
            );
            predecessor = *id;
        }

        node.wait_for_state(NodeState::Broken, Duration::from_secs(1)).await.unwrap();
        assert!(engine.is_shut_down());
    }

    #[tokio::test]
    async fn test_sync_failure_escalates_to_broken() {
        let config = ReplicationConfig::default().with_max_full_resync_attempts(2);
        let node = Node::start(config, Arc::new(MemoryEngine::new()), MemoryNetwork::new()).unwrap();
        assert!(node.transition_from(NodeState::AwaitingMaster, NodeState::SyncingToMaster));
        node.local_create_store("orders").unwrap();

        let failed = SyncStatus::Failed {
            stores: vec!["orders".to_string()],
        };
        assert_eq!(node.complete_sync(&failed).unwrap(), SyncNext::Again);
        assert_eq!(node.state(), NodeState::FullResyncToMaster);
        assert!(!node.chains().contains("orders"));

        assert_eq!(node.complete_sync(&failed).unwrap(), SyncNext::Again);
        assert!(node.complete_sync(&failed).is_err());
        assert_eq!(node.state(), NodeState::Broken);
    }

    #[tokio::test]
    async fn test_deferred_resync_after_ok() {
        let node = start_node(Arc::new(MemoryEngine::new()));
        assert!(node.transition_from(NodeState::AwaitingMaster, NodeState::SyncingToMaster));

        node.request_resync();
        assert_eq!(node.complete_sync(&SyncStatus::Ok).unwrap(), SyncNext::Again);
        assert_eq!(node.state(), NodeState::SyncingToMaster);
        assert_eq!(node.complete_sync(&SyncStatus::Ok).unwrap(), SyncNext::Done);
        assert_eq!(node.state(), NodeState::Slave);
        assert_eq!(node.stats().syncs_completed, 2);
    }
}
