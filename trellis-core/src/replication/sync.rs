//! Catch-up synchronization
//!
//! The slave opens a fresh connection, sends `sync` with its cursor and then
//! answers every streamed message with `ACK` or `NAK`:
//!
//! ```text
//! slave                          master
//!   │ ── sync {store id ...} ──────► │
//!   │ ◄───────────── +store users ── │  store unknown to the slave
//!   │ ── ACK ──────────────────────► │
//!   │ ◄────── txn users t1 <empty> ── │  full history
//!   │ ── ACK ──────────────────────► │
//!   │ ◄──────── txn orders t3 t2 ─── │  history after the cursor
//!   │ ── ACK ──────────────────────► │
//!   │ ◄───────────── -store stale ── │  store unknown to the master
//!   │ ── ACK ──────────────────────► │
//!   │ ◄──────────────── endsync OK ── │
//!   │ ── ACK ──────────────────────► │
//! ```
//!
//! Replay re-stamps predecessors so the stream forms an unbroken chain even
//! when failed transactions are skipped. A `NAK` aborts only the current
//! store; a transport failure aborts the whole handshake.

use crate::replication::node::{ApplyMode, ApplyOutcome, Node};
use crate::replication::protocol::{ReplicationMessage, SyncCursor, SyncStatus};
use crate::replication::state::NodeState;
use crate::replication::transaction::{Transaction, TransactionId};
use crate::replication::transport::Transport;
use crate::{Error, Result};

/// Serve a slave's `sync` request over `transport` (master side)
///
/// Returns the status sent in `endsync`. Errors only when the connection
/// itself failed.
pub async fn serve_sync(
    node: &Node,
    cursor: SyncCursor,
    transport: &mut dyn Transport,
) -> Result<SyncStatus> {
    let timeout = node.config().ack_timeout;
    let mut stores = node.engine().list_stores()?;
    stores.sort();

    tracing::info!(peer = %transport.peer(), known = cursor.len(), stores = stores.len(), "Serving catch-up");
    let mut failed = Vec::new();

    for store in &stores {
        let replayed = match cursor.get(store) {
            Some(after) => replay_store(node, store, after, transport).await,
            None => {
                match transport
                    .send_and_wait_ack(&ReplicationMessage::CreateStore(store.clone()), timeout)
                    .await?
                {
                    true => replay_store(node, store, TransactionId::EMPTY, transport).await,
                    false => Ok(false),
                }
            }
        };

        match replayed {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(store = %store, peer = %transport.peer(), "Slave rejected replay");
                failed.push(store.clone());
            }
            Err(e) if e.is_connection_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(store = %store, error = %e, "Store replay failed");
                failed.push(store.clone());
            }
        }
    }

    for store in cursor.stores() {
        if stores.iter().any(|known| known == store) {
            continue;
        }
        let msg = ReplicationMessage::DeleteStore(store.to_string());
        if !transport.send_and_wait_ack(&msg, timeout).await? {
            tracing::warn!(store = %store, "Slave rejected store removal");
            failed.push(store.to_string());
        }
    }

    let status = if failed.is_empty() {
        SyncStatus::Ok
    } else {
        SyncStatus::Failed { stores: failed }
    };

    if !transport
        .send_and_wait_ack(&ReplicationMessage::EndSync(status.clone()), timeout)
        .await?
    {
        tracing::debug!(peer = %transport.peer(), "Slave refused endsync");
    }

    node.record(|s| s.syncs_served += 1);
    tracing::info!(peer = %transport.peer(), ok = status.is_ok(), "Catch-up served");
    Ok(status)
}

/// Stream every successful transaction of `store` after `after`
///
/// `after` is the empty id for a full replay. Returns `Ok(false)` when the
/// slave answered `NAK`.
async fn replay_store(
    node: &Node,
    store: &str,
    after: TransactionId,
    transport: &mut dyn Transport,
) -> Result<bool> {
    let engine = node.engine();
    let history = engine.transaction_history(store)?;

    let start = if after.is_empty() {
        0
    } else {
        history
            .iter()
            .position(|entry| entry.id == after)
            .map(|index| index + 1)
            .ok_or_else(|| {
                Error::sync(format!(
                    "slave position {} not found in history of '{}'",
                    after, store
                ))
            })?
    };

    let timeout = node.config().ack_timeout;
    let mut predecessor = after;
    let mut sent = 0usize;

    for entry in history[start..].iter().filter(|entry| entry.outcome.is_success()) {
        let body = engine.load_transaction_body(store, entry)?;
        let txn = Transaction::new(store, entry.id, predecessor, body);
        if !transport
            .send_and_wait_ack(&ReplicationMessage::Transaction(txn), timeout)
            .await?
        {
            return Ok(false);
        }
        predecessor = entry.id;
        sent += 1;
    }

    tracing::debug!(store = %store, after = %after, sent, "Store replayed");
    Ok(true)
}

/// Run one catch-up handshake against the master at `addr` (slave side)
///
/// Applies everything the master streams and returns the `endsync` status.
pub async fn run_catch_up(node: &Node, addr: &str) -> Result<SyncStatus> {
    let mut transport = node.connector().connect(addr).await?;
    let cursor = node.chains().cursor();
    let timeout = node.config().ack_timeout;

    tracing::info!(master = %addr, stores = cursor.len(), "Requesting catch-up");
    transport.write_message(&ReplicationMessage::Sync(cursor)).await?;

    loop {
        let msg = tokio::time::timeout(timeout, transport.read_message())
            .await
            .map_err(|_| Error::timeout(format!("Catch-up stream from {} stalled", addr)))??
            .ok_or(Error::ConnectionClosed)?;

        let reply = match msg {
            ReplicationMessage::Transaction(txn) => {
                let (store, id) = (txn.store_id.clone(), txn.id);
                match node.apply_replicated_write(txn, ApplyMode::Sync) {
                    Ok(ApplyOutcome::Applied | ApplyOutcome::Duplicate) => ReplicationMessage::Ack,
                    Ok(ApplyOutcome::Gap { .. }) => ReplicationMessage::nak(),
                    Err(e) if node.state() == NodeState::Broken => return Err(e),
                    Err(e) => {
                        tracing::warn!(store = %store, id = %id, error = %e, "Rejected replayed transaction");
                        ReplicationMessage::nak()
                    }
                }
            }
            ReplicationMessage::CreateStore(name) => match node.local_create_store(&name) {
                Ok(()) => ReplicationMessage::Ack,
                Err(e) => {
                    tracing::warn!(store = %name, error = %e, "Failed to create store");
                    ReplicationMessage::nak()
                }
            },
            ReplicationMessage::DeleteStore(name) => match node.local_delete_store(&name) {
                Ok(()) => ReplicationMessage::Ack,
                Err(e) => {
                    tracing::warn!(store = %name, error = %e, "Failed to drop store");
                    ReplicationMessage::nak()
                }
            },
            ReplicationMessage::EndSync(status) => {
                transport.write_message(&ReplicationMessage::Ack).await?;
                tracing::info!(master = %addr, ok = status.is_ok(), "Catch-up stream finished");
                return Ok(status);
            }
            ReplicationMessage::Nak { .. } => {
                return Err(Error::sync(format!("Master {} refused catch-up", addr)));
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unexpected '{}' during catch-up",
                    other.kind()
                )));
            }
        };

        transport.write_message(&reply).await?;
    }
}
