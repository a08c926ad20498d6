//! Storage engine seam
//!
//! The replication core never applies a transaction itself. It hands work to
//! a [`StorageEngine`], which applies it durably in the background and later
//! reports a [`JobCompleted`] event. Jobs queued for one store must complete
//! in submission order.

pub mod memory;

pub use memory::MemoryEngine;

use crate::replication::transaction::{Transaction, TransactionBody, TransactionId, TransactionKind};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Result of applying one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Applied
    Succeeded,
    /// Update preconditions did not hold; nothing was changed
    PreconditionFailed(String),
    /// The engine could not apply a well-formed transaction
    Failed(String),
}

impl JobOutcome {
    /// True for `Succeeded`
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Completion notification raised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompleted {
    /// Store the job ran against
    pub store_id: String,
    /// Job id (the transaction id)
    pub job_id: TransactionId,
    /// What happened
    pub outcome: JobOutcome,
}

/// One entry of a store's persisted transaction history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Transaction id
    pub id: TransactionId,
    /// Transaction kind
    pub kind: TransactionKind,
    /// Outcome recorded when the job ran
    pub outcome: JobOutcome,
    /// When the job completed
    pub completed_at: DateTime<Utc>,
}

/// Operations the replication core consumes from the storage engine
pub trait StorageEngine: Send + Sync + 'static {
    /// Names of every store
    fn list_stores(&self) -> Result<Vec<String>>;

    /// Create an empty store
    fn create_store(&self, name: &str) -> Result<()>;

    /// Delete a store and its history
    fn delete_store(&self, name: &str) -> Result<()>;

    /// True when the store exists
    fn does_store_exist(&self, name: &str) -> Result<bool>;

    /// Queue an update-triples transaction for durable application
    fn queue_update_transaction(
        &self,
        id: TransactionId,
        store_id: &str,
        preconditions: &str,
        deletes: &str,
        inserts: &str,
    ) -> Result<()>;

    /// Queue a query-update transaction for durable application
    fn queue_query_update_transaction(
        &self,
        id: TransactionId,
        store_id: &str,
        expression: &str,
    ) -> Result<()>;

    /// Persisted history of a store, oldest first
    fn transaction_history(&self, store_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Body of a historical transaction
    fn load_transaction_body(&self, store_id: &str, entry: &HistoryEntry)
        -> Result<TransactionBody>;

    /// Subscribe to job completion events
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobCompleted>;

    /// Stop accepting work
    fn shutdown(&self);

    /// Queue a transaction of either kind
    fn queue_transaction(&self, txn: &Transaction) -> Result<()> {
        match &txn.body {
            TransactionBody::Update {
                preconditions,
                deletes,
                inserts,
            } => self.queue_update_transaction(
                txn.id,
                &txn.store_id,
                preconditions,
                deletes,
                inserts,
            ),
            TransactionBody::QueryUpdate { expression } => {
                self.queue_query_update_transaction(txn.id, &txn.store_id, expression)
            }
        }
    }
}
