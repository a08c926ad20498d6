//! In-memory storage engine
//!
//! Stores are sets of triple lines. An update applies only when every
//! precondition line is present; deletes are removed, then inserts added.
//! Query-update expressions are recorded but not interpreted. Jobs run
//! inline when queued, so per-store completion order is submission order.

use crate::engine::{HistoryEntry, JobCompleted, JobOutcome, StorageEngine};
use crate::replication::transaction::{TransactionBody, TransactionId};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Capacity of the job event channel
const JOB_EVENT_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryStore {
    triples: BTreeSet<String>,
    expressions: Vec<String>,
    history: Vec<(HistoryEntry, TransactionBody)>,
}

impl MemoryStore {
    fn apply(&mut self, body: &TransactionBody) -> JobOutcome {
        match body {
            TransactionBody::Update {
                preconditions,
                deletes,
                inserts,
            } => {
                if let Some(missing) = triple_lines(preconditions).find(|t| !self.triples.contains(*t))
                {
                    return JobOutcome::PreconditionFailed(format!("missing triple: {}", missing));
                }
                for triple in triple_lines(deletes) {
                    self.triples.remove(triple);
                }
                for triple in triple_lines(inserts) {
                    self.triples.insert(triple.to_string());
                }
                JobOutcome::Succeeded
            }
            TransactionBody::QueryUpdate { expression } => {
                self.expressions.push(expression.clone());
                JobOutcome::Succeeded
            }
        }
    }
}

fn triple_lines(section: &str) -> impl Iterator<Item = &str> {
    section.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Reference [`StorageEngine`] keeping everything in memory
pub struct MemoryEngine {
    stores: RwLock<BTreeMap<String, MemoryStore>>,
    events: broadcast::Sender<JobCompleted>,
    failing: Mutex<HashSet<TransactionId>>,
    shut_down: AtomicBool,
}

impl MemoryEngine {
    /// Create an engine with no stores
    pub fn new() -> Self {
        Self::with_event_capacity(JOB_EVENT_CAPACITY)
    }

    /// Create an engine whose job event channel holds `capacity` events
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            stores: RwLock::new(BTreeMap::new()),
            events,
            failing: Mutex::new(HashSet::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Make the job with this id fail when it runs
    pub fn fail_transaction(&self, id: TransactionId) {
        self.failing.lock().insert(id);
    }

    /// Current triples of a store, sorted
    pub fn triples(&self, store_id: &str) -> Option<Vec<String>> {
        self.stores
            .read()
            .get(store_id)
            .map(|store| store.triples.iter().cloned().collect())
    }

    /// Query-update expressions applied to a store, in order
    pub fn expressions(&self, store_id: &str) -> Option<Vec<String>> {
        self.stores
            .read()
            .get(store_id)
            .map(|store| store.expressions.clone())
    }

    /// Ids in a store's history, oldest first
    pub fn history_ids(&self, store_id: &str) -> Vec<TransactionId> {
        self.stores
            .read()
            .get(store_id)
            .map(|store| store.history.iter().map(|(entry, _)| entry.id).collect())
            .unwrap_or_default()
    }

    /// True once `shutdown` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn run_job(&self, id: TransactionId, store_id: &str, body: TransactionBody) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::storage("engine is shut down"));
        }

        let injected = self.failing.lock().remove(&id);
        let outcome = {
            let mut stores = self.stores.write();
            let store = stores
                .get_mut(store_id)
                .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))?;

            let outcome = if injected {
                JobOutcome::Failed("injected failure".to_string())
            } else {
                store.apply(&body)
            };

            let entry = HistoryEntry {
                id,
                kind: body.kind(),
                outcome: outcome.clone(),
                completed_at: Utc::now(),
            };
            store.history.push((entry, body));
            outcome
        };

        // No subscribers is fine
        let _ = self.events.send(JobCompleted {
            store_id: store_id.to_string(),
            job_id: id,
            outcome,
        });
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn list_stores(&self) -> Result<Vec<String>> {
        Ok(self.stores.read().keys().cloned().collect())
    }

    fn create_store(&self, name: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::storage("engine is shut down"));
        }
        let mut stores = self.stores.write();
        if stores.contains_key(name) {
            return Err(Error::storage(format!("store '{}' already exists", name)));
        }
        stores.insert(name.to_string(), MemoryStore::default());
        Ok(())
    }

    fn delete_store(&self, name: &str) -> Result<()> {
        self.stores
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))
    }

    fn does_store_exist(&self, name: &str) -> Result<bool> {
        Ok(self.stores.read().contains_key(name))
    }

    fn queue_update_transaction(
        &self,
        id: TransactionId,
        store_id: &str,
        preconditions: &str,
        deletes: &str,
        inserts: &str,
    ) -> Result<()> {
        self.run_job(
            id,
            store_id,
            TransactionBody::update(preconditions, deletes, inserts),
        )
    }

    fn queue_query_update_transaction(
        &self,
        id: TransactionId,
        store_id: &str,
        expression: &str,
    ) -> Result<()> {
        self.run_job(id, store_id, TransactionBody::query_update(expression))
    }

    fn transaction_history(&self, store_id: &str) -> Result<Vec<HistoryEntry>> {
        self.stores
            .read()
            .get(store_id)
            .map(|store| store.history.iter().map(|(entry, _)| entry.clone()).collect())
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))
    }

    fn load_transaction_body(
        &self,
        store_id: &str,
        entry: &HistoryEntry,
    ) -> Result<TransactionBody> {
        let stores = self.stores.read();
        let store = stores
            .get(store_id)
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))?;
        store
            .history
            .iter()
            .find(|(e, _)| e.id == entry.id)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| {
                Error::storage(format!("no body for {} in store '{}'", entry.id, store_id))
            })
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobCompleted> {
        self.events.subscribe()
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Memory engine shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_applies_deletes_then_inserts() {
        let engine = MemoryEngine::new();
        engine.create_store("orders").unwrap();

        engine
            .queue_update_transaction(TransactionId::new(), "orders", "", "", "<a> <b> <c> .\n<a> <b> <d> .")
            .unwrap();
        engine
            .queue_update_transaction(
                TransactionId::new(),
                "orders",
                "<a> <b> <c> .",
                "<a> <b> <c> .",
                "<a> <b> <e> .",
            )
            .unwrap();

        assert_eq!(
            engine.triples("orders").unwrap(),
            vec!["<a> <b> <d> .", "<a> <b> <e> ."]
        );
    }

    #[test]
    fn test_precondition_failure_recorded() {
        let engine = MemoryEngine::new();
        engine.create_store("orders").unwrap();
        let mut events = engine.subscribe_jobs();

        let id = TransactionId::new();
        engine
            .queue_update_transaction(id, "orders", "<x> <y> <z> .", "", "<a> <b> <c> .")
            .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.job_id, id);
        assert!(matches!(event.outcome, JobOutcome::PreconditionFailed(_)));
        assert!(engine.triples("orders").unwrap().is_empty());

        let history = engine.transaction_history("orders").unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].outcome.is_success());
    }

    #[test]
    fn test_injected_failure() {
        let engine = MemoryEngine::new();
        engine.create_store("orders").unwrap();
        let mut events = engine.subscribe_jobs();

        let id = TransactionId::new();
        engine.fail_transaction(id);
        engine
            .queue_query_update_transaction(id, "orders", "INSERT DATA {}")
            .unwrap();

        assert!(matches!(
            events.try_recv().unwrap().outcome,
            JobOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_unknown_store() {
        let engine = MemoryEngine::new();
        let result = engine.queue_query_update_transaction(TransactionId::new(), "nope", "x");
        assert!(matches!(result, Err(Error::StoreNotFound(_))));
        assert!(engine.transaction_history("nope").is_err());
        assert!(!engine.does_store_exist("nope").unwrap());
    }

    #[test]
    fn test_history_bodies() {
        let engine = MemoryEngine::new();
        engine.create_store("orders").unwrap();
        let id = TransactionId::new();
        engine
            .queue_query_update_transaction(id, "orders", "CLEAR ALL")
            .unwrap();

        let history = engine.transaction_history("orders").unwrap();
        let body = engine.load_transaction_body("orders", &history[0]).unwrap();
        assert_eq!(body, TransactionBody::query_update("CLEAR ALL"));
        assert_eq!(engine.history_ids("orders"), vec![id]);
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let engine = MemoryEngine::new();
        engine.create_store("orders").unwrap();
        engine.shutdown();
        assert!(engine.is_shut_down());
        assert!(engine
            .queue_query_update_transaction(TransactionId::new(), "orders", "x")
            .is_err());
    }
}
