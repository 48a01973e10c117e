//! Persistence collaborator.
//!
//! Subscription state is persisted as neighbour rows plus one row per proxy
//! subscription a neighbour holds. Writes are staged on a
//! [`Transaction`](crate::txn::Transaction) and handed to the store in one
//! [`SubscriptionStore::apply`] call on commit.

use crate::error::StoreError;
use crate::subscription::{ProxySubscription, SubscriptionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Persisted identity of a neighbour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourRecord {
    /// Peer engine identifier
    pub id: Uuid,
    /// Bus the link to the peer belongs to
    pub bus: String,
}

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or replace a neighbour
    PutNeighbour(NeighbourRecord),
    /// Delete a neighbour and every subscription it holds
    RemoveNeighbour(Uuid),
    /// Insert or replace a subscription held by a neighbour
    PutSubscription {
        /// Owning neighbour
        neighbour: Uuid,
        /// The record
        subscription: ProxySubscription,
    },
    /// Delete a subscription held by a neighbour
    RemoveSubscription {
        /// Owning neighbour
        neighbour: Uuid,
        /// Key of the record
        key: SubscriptionKey,
    },
}

/// A neighbour and its subscriptions as read back on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredNeighbour {
    /// The neighbour row
    pub record: NeighbourRecord,
    /// Subscriptions it held
    pub subscriptions: Vec<ProxySubscription>,
}

/// Durable storage for neighbours and their proxy subscriptions.
pub trait SubscriptionStore: Send + Sync {
    /// Apply every op atomically: either all are visible afterwards or none.
    ///
    /// # Errors
    ///
    /// Returns error if any op fails; nothing is applied in that case.
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError>;

    /// Read back every persisted neighbour with its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if persisted state cannot be read.
    fn recover(&self) -> Result<Vec<RecoveredNeighbour>, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<BTreeMap<Uuid, Entry>>,
    failing: AtomicBool,
}

#[derive(Debug, Clone)]
struct Entry {
    bus: String,
    subscriptions: BTreeMap<SubscriptionKey, ProxySubscription>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent [`apply`](SubscriptionStore::apply) fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of persisted neighbours.
    #[must_use]
    pub fn neighbour_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Number of subscriptions persisted for a neighbour.
    #[must_use]
    pub fn subscription_count(&self, neighbour: Uuid) -> usize {
        self.state
            .lock()
            .get(&neighbour)
            .map_or(0, |entry| entry.subscriptions.len())
    }
}

impl SubscriptionStore for MemoryStore {
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Write("store is failing writes".to_string()));
        }

        let mut state = self.state.lock();
        let mut staged = state.clone();

        for op in ops {
            match op {
                StoreOp::PutNeighbour(record) => {
                    staged
                        .entry(record.id)
                        .and_modify(|entry| entry.bus.clone_from(&record.bus))
                        .or_insert_with(|| Entry {
                            bus: record.bus.clone(),
                            subscriptions: BTreeMap::new(),
                        });
                }
                StoreOp::RemoveNeighbour(id) => {
                    staged.remove(id);
                }
                StoreOp::PutSubscription {
                    neighbour,
                    subscription,
                } => {
                    let entry = staged.get_mut(neighbour).ok_or_else(|| {
                        StoreError::Write(format!("unknown neighbour {neighbour}"))
                    })?;
                    entry
                        .subscriptions
                        .insert(subscription.key().clone(), subscription.clone());
                }
                StoreOp::RemoveSubscription { neighbour, key } => {
                    if let Some(entry) = staged.get_mut(neighbour) {
                        entry.subscriptions.remove(key);
                    }
                }
            }
        }

        *state = staged;
        Ok(())
    }

    fn recover(&self) -> Result<Vec<RecoveredNeighbour>, StoreError> {
        Ok(self
            .state
            .lock()
            .iter()
            .map(|(id, entry)| RecoveredNeighbour {
                record: NeighbourRecord {
                    id: *id,
                    bus: entry.bus.clone(),
                },
                subscriptions: entry.subscriptions.values().cloned().collect(),
            })
            .collect())
    }
}
