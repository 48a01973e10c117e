//! Transactions over subscription state.
//!
//! In-memory tables are mutated eagerly while a transaction is open; the
//! persisted form of those mutations is staged as [`StoreOp`]s. Whoever
//! mutates memory registers a compensating action with
//! [`Transaction::on_rollback`], which runs (in reverse registration order)
//! if the transaction is rolled back or its commit fails.

use crate::error::StoreError;
use crate::store::{StoreOp, SubscriptionStore};
use std::fmt;

type Callback = Box<dyn FnOnce() + Send>;

/// A unit of work over subscription state.
///
/// Dropping a transaction without committing it rolls it back.
#[must_use]
#[derive(Default)]
pub struct Transaction {
    ops: Vec<StoreOp>,
    on_commit: Vec<Callback>,
    on_rollback: Vec<Callback>,
}

impl Transaction {
    /// Open an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a persisted write.
    pub fn stage(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    /// Register an action to run after a successful commit.
    pub fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    /// Register a compensating action to run on rollback.
    pub fn on_rollback(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_rollback.push(Box::new(action));
    }

    /// Staged writes, in order.
    #[must_use]
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Apply the staged writes and run the commit actions.
    ///
    /// # Errors
    ///
    /// Returns the store error if the writes could not be applied; the
    /// compensating actions have run by the time this returns.
    pub fn commit(mut self, store: &dyn SubscriptionStore) -> Result<(), StoreError> {
        let ops = std::mem::take(&mut self.ops);
        if !ops.is_empty() {
            if let Err(err) = store.apply(&ops) {
                tracing::warn!(error = %err, ops = ops.len(), "Commit failed, rolling back");
                self.run_rollback();
                return Err(err);
            }
        }

        self.on_rollback.clear();
        for action in std::mem::take(&mut self.on_commit) {
            action();
        }
        Ok(())
    }

    /// Discard the staged writes and run the compensating actions.
    pub fn rollback(mut self) {
        self.run_rollback();
    }

    fn run_rollback(&mut self) {
        self.ops.clear();
        self.on_commit.clear();
        while let Some(action) = self.on_rollback.pop() {
            action();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.on_rollback.is_empty() || !self.ops.is_empty() {
            tracing::debug!(ops = self.ops.len(), "Transaction dropped without commit");
            self.run_rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("ops", &self.ops)
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NeighbourRecord};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use uuid::Uuid;

    fn put_neighbour() -> StoreOp {
        StoreOp::PutNeighbour(NeighbourRecord {
            id: Uuid::new_v4(),
            bus: "bus-a".to_string(),
        })
    }

    #[test]
    fn commit_runs_commit_actions_only() {
        let store = MemoryStore::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Transaction::new();
        txn.stage(put_neighbour());
        let commit_log = Arc::clone(&log);
        txn.on_commit(move || commit_log.lock().push("commit"));
        let rollback_log = Arc::clone(&log);
        txn.on_rollback(move || rollback_log.lock().push("rollback"));

        txn.commit(&store).unwrap();

        assert_eq!(*log.lock(), vec!["commit"]);
        assert_eq!(store.neighbour_count(), 1);
    }

    #[test]
    fn rollback_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Transaction::new();
        for step in 1..=3 {
            let log = Arc::clone(&log);
            txn.on_rollback(move || log.lock().push(step));
        }
        txn.rollback();

        assert_eq!(*log.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn failed_commit_compensates() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Transaction::new();
        txn.stage(put_neighbour());
        let rollback_log = Arc::clone(&log);
        txn.on_rollback(move || rollback_log.lock().push("rollback"));

        assert!(txn.commit(&store).is_err());
        assert_eq!(*log.lock(), vec!["rollback"]);
        assert_eq!(store.neighbour_count(), 0);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let mut txn = Transaction::new();
            let log = Arc::clone(&log);
            txn.on_rollback(move || log.lock().push("rollback"));
        }

        assert_eq!(*log.lock(), vec!["rollback"]);
    }
}
