//! Per-store causal transaction chains
//!
//! A [`StoreChain`] answers "do I already have transaction X?" and "what must
//! the next transaction's predecessor be?" for one store. [`ChainRegistry`]
//! holds one chain per known store; each chain is mutated under its map
//! entry's lock, so check-and-queue is atomic per store while different
//! stores proceed independently.

use crate::replication::protocol::SyncCursor;
use crate::replication::transaction::TransactionId;
use dashmap::DashMap;
use std::collections::HashSet;

/// Result of appending a replicated transaction to a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Queued; `predecessor` was the previous `last`
    Appended {
        /// Previous chain tail
        predecessor: TransactionId,
    },
    /// Already known; chain unchanged
    Duplicate,
    /// Predecessor does not match the chain tail; chain unchanged
    Gap {
        /// Current chain tail
        expected: TransactionId,
    },
}

/// Causal chain of one store
#[derive(Debug, Clone, Default)]
pub struct StoreChain {
    committed: HashSet<TransactionId>,
    queued: HashSet<TransactionId>,
    last: TransactionId,
}

impl StoreChain {
    /// Empty chain (`last` is the empty id)
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from persisted history, oldest first
    pub fn from_history(ids: impl IntoIterator<Item = TransactionId>) -> Self {
        let mut chain = Self::new();
        for id in ids {
            chain.committed.insert(id);
            chain.last = id;
        }
        chain
    }

    /// Id of the most recently queued transaction
    pub fn last(&self) -> TransactionId {
        self.last
    }

    /// `id == last || id ∈ queued || id ∈ committed`
    pub fn have_transaction(&self, id: TransactionId) -> bool {
        id == self.last || self.queued.contains(&id) || self.committed.contains(&id)
    }

    /// Record `id` as the new tail and return the previous tail
    ///
    /// Returns `None` without touching the chain when `id` is already known.
    pub fn queue(&mut self, id: TransactionId) -> Option<TransactionId> {
        if self.have_transaction(id) {
            return None;
        }
        let predecessor = self.last;
        self.queued.insert(id);
        self.last = id;
        Some(predecessor)
    }

    /// Move `id` from queued to committed
    pub fn commit(&mut self, id: TransactionId) -> bool {
        if self.queued.remove(&id) {
            self.committed.insert(id);
            true
        } else {
            false
        }
    }

    /// Undo a `queue(id)` whose submission failed, if `id` is still the tail
    pub fn unqueue(&mut self, id: TransactionId, predecessor: TransactionId) -> bool {
        if self.last != id || !self.queued.remove(&id) {
            return false;
        }
        self.last = predecessor;
        true
    }

    /// Queue `id` only if `predecessor` is the current tail
    pub fn try_append(&mut self, id: TransactionId, predecessor: TransactionId) -> AppendOutcome {
        if self.have_transaction(id) {
            return AppendOutcome::Duplicate;
        }
        if predecessor != self.last {
            return AppendOutcome::Gap {
                expected: self.last,
            };
        }
        self.queued.insert(id);
        self.last = id;
        AppendOutcome::Appended { predecessor }
    }

    /// Transactions queued but not yet committed
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Committed transactions
    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// True when `id` is waiting for its completion notification
    pub fn is_queued(&self, id: TransactionId) -> bool {
        self.queued.contains(&id)
    }
}

/// Concurrent map of store id -> chain
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: DashMap<String, StoreChain>,
}

impl ChainRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a chain for a store, replacing any existing one
    pub fn insert(&self, store_id: impl Into<String>, chain: StoreChain) {
        self.chains.insert(store_id.into(), chain);
    }

    /// Create an empty chain if the store has none; true if created
    pub fn ensure(&self, store_id: &str) -> bool {
        if self.chains.contains_key(store_id) {
            return false;
        }
        let mut created = false;
        self.chains.entry(store_id.to_string()).or_insert_with(|| {
            created = true;
            StoreChain::new()
        });
        created
    }

    /// Drop a store's chain
    pub fn remove(&self, store_id: &str) -> bool {
        self.chains.remove(store_id).is_some()
    }

    /// True when the store has a chain
    pub fn contains(&self, store_id: &str) -> bool {
        self.chains.contains_key(store_id)
    }

    /// Chain tail for a store
    pub fn last(&self, store_id: &str) -> Option<TransactionId> {
        self.chains.get(store_id).map(|chain| chain.last())
    }

    /// `HaveTransaction` for a store; false for unknown stores
    pub fn have_transaction(&self, store_id: &str, id: TransactionId) -> bool {
        self.chains
            .get(store_id)
            .is_some_and(|chain| chain.have_transaction(id))
    }

    /// Commit `id` in a store's chain
    pub fn commit(&self, store_id: &str, id: TransactionId) -> bool {
        self.chains
            .get_mut(store_id)
            .is_some_and(|mut chain| chain.commit(id))
    }

    /// Run `f` with exclusive access to one store's chain
    ///
    /// Other callers touching the same store block until `f` returns, so `f`
    /// must not await.
    pub fn with_chain_mut<R>(
        &self,
        store_id: &str,
        f: impl FnOnce(&mut StoreChain) -> R,
    ) -> Option<R> {
        self.chains.get_mut(store_id).map(|mut chain| f(&mut chain))
    }

    /// Clone of a store's chain
    pub fn snapshot(&self, store_id: &str) -> Option<StoreChain> {
        self.chains.get(store_id).map(|chain| chain.value().clone())
    }

    /// Known stores, sorted
    pub fn stores(&self) -> Vec<String> {
        let mut stores: Vec<String> = self.chains.iter().map(|e| e.key().clone()).collect();
        stores.sort();
        stores
    }

    /// Sync cursor describing every known store's tail
    pub fn cursor(&self) -> SyncCursor {
        self.chains
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last()))
            .collect()
    }

    /// Number of known stores
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// True when no store is known
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_queue_returns_previous_last() {
        let mut chain = StoreChain::new();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();

        assert_eq!(chain.queue(t1), Some(TransactionId::EMPTY));
        assert_eq!(chain.queue(t2), Some(t1));
        assert_eq!(chain.last(), t2);
        assert_eq!(chain.queued_len(), 2);
    }

    #[test]
    fn test_commit_moves_out_of_queued() {
        let mut chain = StoreChain::new();
        let t1 = TransactionId::new();
        chain.queue(t1);

        assert!(chain.commit(t1));
        assert!(!chain.is_queued(t1));
        assert_eq!(chain.committed_len(), 1);
        assert!(chain.have_transaction(t1));
        assert!(!chain.commit(t1));
    }

    #[test]
    fn test_requeue_after_commit_is_noop() {
        let mut chain = StoreChain::new();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        chain.queue(t1);
        chain.commit(t1);
        chain.queue(t2);

        assert_eq!(chain.queue(t1), None);
        assert_eq!(chain.last(), t2);
    }

    #[test]
    fn test_try_append_gap_leaves_chain_untouched() {
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        let t3 = TransactionId::new();
        let mut chain = StoreChain::from_history([t1]);

        assert_eq!(chain.try_append(t3, t2), AppendOutcome::Gap { expected: t1 });
        assert_eq!(chain.last(), t1);
        assert!(!chain.have_transaction(t3));

        assert_eq!(
            chain.try_append(t2, t1),
            AppendOutcome::Appended { predecessor: t1 }
        );
        assert_eq!(
            chain.try_append(t3, t2),
            AppendOutcome::Appended { predecessor: t2 }
        );
        assert_eq!(chain.try_append(t2, t1), AppendOutcome::Duplicate);
    }

    #[test]
    fn test_unqueue_only_restores_tail() {
        let mut chain = StoreChain::new();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        chain.queue(t1);
        chain.queue(t2);

        assert!(!chain.unqueue(t1, TransactionId::EMPTY));
        assert!(chain.unqueue(t2, t1));
        assert_eq!(chain.last(), t1);
        assert!(!chain.have_transaction(t2));
    }

    #[test]
    fn test_from_history() {
        let ids: Vec<_> = (0..3).map(|_| TransactionId::new()).collect();
        let chain = StoreChain::from_history(ids.clone());
        assert_eq!(chain.last(), ids[2]);
        assert_eq!(chain.committed_len(), 3);
        assert_eq!(chain.queued_len(), 0);
    }

    #[test]
    fn test_registry_cursor() {
        let registry = ChainRegistry::new();
        let t1 = TransactionId::new();
        registry.insert("orders", StoreChain::from_history([t1]));
        assert!(registry.ensure("users"));
        assert!(!registry.ensure("users"));

        let cursor = registry.cursor();
        assert_eq!(cursor.get("orders"), Some(t1));
        assert_eq!(cursor.get("users"), Some(TransactionId::EMPTY));
        assert_eq!(registry.stores(), vec!["orders", "users"]);
    }

    #[test]
    fn test_registry_unknown_store() {
        let registry = ChainRegistry::new();
        assert!(!registry.have_transaction("orders", TransactionId::new()));
        assert!(!registry.commit("orders", TransactionId::new()));
        assert!(registry.with_chain_mut("orders", |c| c.last()).is_none());
    }

    proptest! {
        #[test]
        fn prop_duplicate_queue_never_moves_last(n in 1usize..40, picks in proptest::collection::vec(0usize..40, 1..20)) {
            let ids: Vec<_> = (0..n).map(|_| TransactionId::new()).collect();
            let mut chain = StoreChain::new();
            for id in &ids {
                chain.queue(*id);
            }
            for (i, id) in ids.iter().enumerate() {
                if i % 2 == 0 {
                    chain.commit(*id);
                }
            }

            let last = chain.last();
            for pick in picks {
                let id = ids[pick % n];
                prop_assert_eq!(chain.queue(id), None);
                prop_assert_eq!(chain.last(), last);
            }
        }

        #[test]
        fn prop_appended_chain_is_linked(n in 1usize..40) {
            let mut chain = StoreChain::new();
            let mut prev = TransactionId::EMPTY;
            for _ in 0..n {
                let id = TransactionId::new();
                let appended = chain.try_append(id, prev);
                prop_assert_eq!(appended, AppendOutcome::Appended { predecessor: prev });
                prop_assert!(chain.have_transaction(id));
                prev = id;
            }
            prop_assert_eq!(chain.last(), prev);
            prop_assert_eq!(chain.queued_len(), n);
        }
    }
}
