//! Directory of neighbours and bus groups.
//!
//! The registry owns every [`Neighbour`] (live, or recovered from storage
//! and not yet re-linked), the [`BusGroup`] of each bus with live
//! neighbours, and the temporary subscription references: records whose
//! topic space does not exist locally yet, parked until it does.

use crate::bus_group::BusGroup;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, StoreError};
use crate::matchspace::MatchSpace;
use crate::message::MessageType;
use crate::neighbour::Neighbour;
use crate::store::{NeighbourRecord, StoreOp, SubscriptionStore};
use crate::subscription::{ProxySubscription, SubscriptionKey};
use crate::transport::Transport;
use crate::txn::Transaction;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

type NeighbourMap = Arc<RwLock<HashMap<Uuid, Arc<Neighbour>>>>;
type BusGroupMap = Arc<RwLock<BTreeMap<String, Arc<BusGroup>>>>;
/// topic space → neighbour → records waiting for the topic space
type TemporaryReferences = Arc<Mutex<HashMap<Uuid, HashMap<Uuid, Vec<ProxySubscription>>>>>;

/// A record together with the neighbour holding it.
pub type HeldSubscription = (Arc<Neighbour>, ProxySubscription);

/// Outcome of [`NeighbourRegistry::add_neighbour`].
#[derive(Debug)]
pub struct LinkedNeighbour {
    /// The live neighbour
    pub neighbour: Arc<Neighbour>,
    /// Records of a promoted recovered neighbour that got bound
    pub bound: Vec<ProxySubscription>,
    /// Whether the neighbour's bus group was created for it
    pub new_group: bool,
}

/// Neighbours, bus groups and deferred bindings of one engine.
pub struct NeighbourRegistry {
    config: Arc<ProxyConfig>,
    match_space: Arc<dyn MatchSpace>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    neighbours: NeighbourMap,
    recovered: NeighbourMap,
    bus_groups: BusGroupMap,
    temporary: TemporaryReferences,
}

impl NeighbourRegistry {
    /// Create an empty registry.
    pub fn new(
        config: Arc<ProxyConfig>,
        match_space: Arc<dyn MatchSpace>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            match_space,
            transport,
            runtime,
            neighbours: Arc::default(),
            recovered: Arc::default(),
            bus_groups: Arc::default(),
            temporary: Arc::default(),
        }
    }

    /// Protocol configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The match space proxy subscriptions are bound into.
    #[must_use]
    pub fn match_space(&self) -> &Arc<dyn MatchSpace> {
        &self.match_space
    }

    /// Live neighbour by id.
    #[must_use]
    pub fn neighbour(&self, id: Uuid) -> Option<Arc<Neighbour>> {
        self.neighbours.read().get(&id).cloned()
    }

    /// Recovered, not yet re-linked neighbour by id.
    #[must_use]
    pub fn recovered_neighbour(&self, id: Uuid) -> Option<Arc<Neighbour>> {
        self.recovered.read().get(&id).cloned()
    }

    /// Every live neighbour, ordered by id.
    #[must_use]
    pub fn neighbours(&self) -> Vec<Arc<Neighbour>> {
        let mut neighbours: Vec<Arc<Neighbour>> = self.neighbours.read().values().cloned().collect();
        neighbours.sort_by_key(|neighbour| neighbour.id());
        neighbours
    }

    /// Number of recovered neighbours not yet re-linked.
    #[must_use]
    pub fn recovered_count(&self) -> usize {
        self.recovered.read().len()
    }

    /// Group of a bus, if it has live neighbours.
    #[must_use]
    pub fn bus_group(&self, bus: &str) -> Option<Arc<BusGroup>> {
        self.bus_groups.read().get(bus).cloned()
    }

    /// Every bus group, ordered by bus name.
    #[must_use]
    pub fn bus_groups(&self) -> Vec<Arc<BusGroup>> {
        self.bus_groups.read().values().cloned().collect()
    }

    /// Load persisted neighbours into the recovered set.
    ///
    /// Their records are restored but not bound until the neighbour is
    /// re-linked with [`add_neighbour`](Self::add_neighbour).
    ///
    /// # Errors
    ///
    /// Returns error if persisted state cannot be read.
    pub fn recover(&self, store: &dyn SubscriptionStore) -> Result<usize, StoreError> {
        let persisted = store.recover()?;
        let mut recovered = self.recovered.write();
        for entry in persisted {
            let neighbour = Neighbour::new(
                entry.record.id,
                entry.record.bus,
                Arc::clone(&self.transport),
                self.runtime.clone(),
                self.config.resync_timeout,
            );
            neighbour.restore(entry.subscriptions);
            tracing::debug!(
                neighbour = %neighbour.id(),
                bus = %neighbour.bus(),
                subscriptions = neighbour.subscription_count(),
                "Recovered neighbour"
            );
            recovered.insert(neighbour.id(), neighbour);
        }
        Ok(recovered.len())
    }

    /// Link a neighbour.
    ///
    /// Idempotent: a live neighbour is returned as is. A recovered one is
    /// promoted and its records re-bound; the records that got bound are
    /// returned alongside. Anything else is created, persisted and added to
    /// its bus group. A bus group created here starts with empty tables.
    ///
    /// # Errors
    ///
    /// Returns error if binding or opening the channel fails; the caller
    /// rolls `txn` back.
    pub fn add_neighbour(
        &self,
        id: Uuid,
        bus: &str,
        txn: &mut Transaction,
    ) -> Result<LinkedNeighbour, ProxyError> {
        if let Some(existing) = self.neighbour(id) {
            return Ok(LinkedNeighbour {
                neighbour: existing,
                bound: Vec::new(),
                new_group: false,
            });
        }

        let promoted = self.recovered.write().remove(&id);
        let (neighbour, bound) = match promoted {
            Some(recovered) if recovered.bus() == bus => {
                let recovered_map = Arc::clone(&self.recovered);
                let restored = Arc::clone(&recovered);
                txn.on_rollback(move || {
                    recovered_map.write().insert(restored.id(), restored);
                });

                let mut bound = Vec::new();
                for subscription in recovered.subscriptions() {
                    if self.create_proxy(id, &subscription, txn)? {
                        bound.push(subscription);
                    }
                }
                tracing::info!(neighbour = %id, bus, rebound = bound.len(), "Promoted recovered neighbour");
                (recovered, bound)
            }
            other => {
                if let Some(stale) = other {
                    tracing::warn!(
                        neighbour = %id,
                        old_bus = %stale.bus(),
                        bus,
                        "Recovered neighbour moved bus, discarding its records"
                    );
                    let recovered_map = Arc::clone(&self.recovered);
                    txn.on_rollback(move || {
                        recovered_map.write().insert(stale.id(), stale);
                    });
                    txn.stage(StoreOp::RemoveNeighbour(id));
                }
                let neighbour = Neighbour::new(
                    id,
                    bus,
                    Arc::clone(&self.transport),
                    self.runtime.clone(),
                    self.config.resync_timeout,
                );
                txn.stage(StoreOp::PutNeighbour(NeighbourRecord {
                    id,
                    bus: bus.to_string(),
                }));
                tracing::info!(neighbour = %id, bus, "Created neighbour");
                (neighbour, Vec::new())
            }
        };

        self.transport.open_channel(id, bus)?;
        let transport = Arc::clone(&self.transport);
        txn.on_rollback(move || transport.close_channel(id));

        self.neighbours.write().insert(id, Arc::clone(&neighbour));
        let (group, new_group) = {
            let mut groups = self.bus_groups.write();
            match groups.get(bus) {
                Some(group) => (Arc::clone(group), false),
                None => {
                    let group = Arc::new(BusGroup::new(bus, Arc::clone(&self.config)));
                    groups.insert(bus.to_string(), Arc::clone(&group));
                    (group, true)
                }
            }
        };
        group.add_neighbour(Arc::clone(&neighbour));

        let neighbours = Arc::clone(&self.neighbours);
        let groups = Arc::clone(&self.bus_groups);
        let bus_name = bus.to_string();
        txn.on_rollback(move || {
            neighbours.write().remove(&id);
            let mut groups = groups.write();
            if let Some(group) = groups.get(&bus_name) {
                group.remove_neighbour(id);
                if group.is_empty() {
                    groups.remove(&bus_name);
                }
            }
        });

        Ok(LinkedNeighbour {
            neighbour,
            bound,
            new_group,
        })
    }

    /// Unlink a neighbour and withdraw everything it held.
    ///
    /// Every record goes through the same deregistration path as an
    /// explicit DELETE. Returns the records that had been bound, which the
    /// caller forwards as withdrawals. Unknown neighbours, or a neighbour on
    /// a different bus, are a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if unbinding fails; the caller rolls `txn` back.
    pub fn remove_neighbour(
        &self,
        id: Uuid,
        bus: &str,
        txn: &mut Transaction,
    ) -> Result<Vec<ProxySubscription>, ProxyError> {
        let neighbour = {
            let mut neighbours = self.neighbours.write();
            match neighbours.get(&id) {
                Some(neighbour) if neighbour.bus() == bus => neighbours.remove(&id),
                _ => None,
            }
        };
        let Some(neighbour) = neighbour else {
            tracing::debug!(neighbour = %id, bus, "Removal of unknown neighbour ignored");
            return Ok(Vec::new());
        };
        let neighbours = Arc::clone(&self.neighbours);
        let restored = Arc::clone(&neighbour);
        txn.on_rollback(move || {
            neighbours.write().insert(restored.id(), restored);
        });

        let group = self.bus_groups.read().get(bus).cloned();
        if let Some(group) = group {
            group.remove_neighbour(id);
            if group.is_empty() {
                self.bus_groups.write().remove(bus);
                tracing::debug!(bus, "Removed empty bus group");
            }
            let groups = Arc::clone(&self.bus_groups);
            let bus_name = bus.to_string();
            let restored = Arc::clone(&neighbour);
            txn.on_rollback(move || {
                let group = Arc::clone(groups.write().entry(bus_name).or_insert(group));
                group.add_neighbour(restored);
            });
        }

        let mut withdrawn = Vec::new();
        for key in neighbour.subscription_keys() {
            if let Some(record) = neighbour.proxy_deregistered(&key, txn) {
                if self.delete_proxy(id, &record, txn)? {
                    withdrawn.push(record);
                }
            }
        }

        txn.stage(StoreOp::RemoveNeighbour(id));
        let transport = Arc::clone(&self.transport);
        let closed = Arc::clone(&neighbour);
        txn.on_commit(move || {
            closed.shutdown();
            transport.close_channel(id);
        });

        tracing::info!(neighbour = %id, bus, withdrawn = withdrawn.len(), "Removed neighbour");
        Ok(withdrawn)
    }

    /// Drop every recovered neighbour that was not re-linked.
    pub fn remove_unused_neighbours(&self, txn: &mut Transaction) -> usize {
        let unused: Vec<Arc<Neighbour>> = self.recovered.write().drain().map(|(_, n)| n).collect();
        for neighbour in &unused {
            tracing::info!(neighbour = %neighbour.id(), bus = %neighbour.bus(), "Dropping unused recovered neighbour");
            txn.stage(StoreOp::RemoveNeighbour(neighbour.id()));
        }
        if !unused.is_empty() {
            let recovered = Arc::clone(&self.recovered);
            let restored = unused.clone();
            txn.on_rollback(move || {
                let mut recovered = recovered.write();
                for neighbour in restored {
                    recovered.insert(neighbour.id(), neighbour);
                }
            });
        }
        unused.len()
    }

    /// Bind a record held by `neighbour` into the match space.
    ///
    /// If the topic space does not exist the record is parked as a
    /// temporary reference instead and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the match space rejects the binding.
    pub fn create_proxy(
        &self,
        neighbour: Uuid,
        subscription: &ProxySubscription,
        txn: &mut Transaction,
    ) -> Result<bool, ProxyError> {
        let topic_space = subscription.topic_space();
        if self.match_space.topic_space_name(topic_space).is_none() {
            self.temporary
                .lock()
                .entry(topic_space)
                .or_default()
                .entry(neighbour)
                .or_default()
                .push(subscription.clone());
            let temporary = Arc::clone(&self.temporary);
            let key = subscription.key().clone();
            txn.on_rollback(move || {
                take_temporary(&mut temporary.lock(), neighbour, &key);
            });
            tracing::debug!(%neighbour, key = %subscription.key(), "Topic space missing, binding deferred");
            return Ok(false);
        }

        if !self.match_space.has_output_binding(topic_space, neighbour) {
            self.match_space.create_output_binding(topic_space, neighbour)?;
            let match_space = Arc::clone(&self.match_space);
            txn.on_rollback(move || match_space.delete_output_binding(topic_space, neighbour));
        }

        self.match_space.bind_proxy(neighbour, subscription)?;
        let match_space = Arc::clone(&self.match_space);
        let key = subscription.key().clone();
        txn.on_rollback(move || {
            if let Err(err) = match_space.unbind_proxy(neighbour, &key) {
                tracing::debug!(%neighbour, %key, error = %err, "Unbind on rollback skipped");
            }
        });
        Ok(true)
    }

    /// Detach a record held by `neighbour` from the match space.
    ///
    /// Returns `true` if a live binding was removed, `false` if the record
    /// was only a temporary reference or not bound at all.
    ///
    /// # Errors
    ///
    /// Returns error if the match space rejects the unbind.
    pub fn delete_proxy(
        &self,
        neighbour: Uuid,
        subscription: &ProxySubscription,
        txn: &mut Transaction,
    ) -> Result<bool, ProxyError> {
        let topic_space = subscription.topic_space();
        let parked = take_temporary(&mut self.temporary.lock(), neighbour, subscription.key());
        if let Some(parked) = parked {
            let temporary = Arc::clone(&self.temporary);
            txn.on_rollback(move || {
                temporary
                    .lock()
                    .entry(parked.topic_space())
                    .or_default()
                    .entry(neighbour)
                    .or_default()
                    .push(parked);
            });
            return Ok(false);
        }

        if self.match_space.topic_space_name(topic_space).is_none()
            || !self.match_space.has_output_binding(topic_space, neighbour)
        {
            return Ok(false);
        }

        self.match_space.unbind_proxy(neighbour, subscription.key())?;
        let binding_removed = self.match_space.bound_topics(topic_space, neighbour).is_empty();
        if binding_removed {
            self.match_space.delete_output_binding(topic_space, neighbour);
        }

        let match_space = Arc::clone(&self.match_space);
        let restored = subscription.clone();
        txn.on_rollback(move || {
            let rebound = if binding_removed {
                match_space.create_output_binding(topic_space, neighbour)
            } else {
                Ok(())
            }
            .and_then(|()| match_space.bind_proxy(neighbour, &restored));
            if let Err(err) = rebound {
                tracing::warn!(%neighbour, key = %restored.key(), error = %err, "Rebind on rollback failed");
            }
        });
        Ok(true)
    }

    /// Bind every temporary reference waiting for `topic_space`.
    ///
    /// Returns the records that got bound, for forwarding.
    ///
    /// # Errors
    ///
    /// Returns error if a binding fails; the caller rolls `txn` back.
    pub fn topic_space_created(
        &self,
        topic_space: Uuid,
        txn: &mut Transaction,
    ) -> Result<Vec<HeldSubscription>, ProxyError> {
        let Some(pending) = self.temporary.lock().remove(&topic_space) else {
            return Ok(Vec::new());
        };
        let temporary = Arc::clone(&self.temporary);
        let restored = pending.clone();
        txn.on_rollback(move || {
            temporary.lock().insert(topic_space, restored);
        });

        let mut realized = Vec::new();
        for (id, subscriptions) in pending {
            let Some(neighbour) = self.neighbour(id) else {
                tracing::debug!(neighbour = %id, "Temporary references of departed neighbour dropped");
                continue;
            };
            for subscription in subscriptions {
                if self.create_proxy(id, &subscription, txn)? {
                    realized.push((Arc::clone(&neighbour), subscription));
                }
            }
        }
        tracing::info!(%topic_space, realized = realized.len(), "Bound deferred subscriptions");
        Ok(realized)
    }

    /// Park every record on a deleted topic space as a temporary reference.
    ///
    /// The match space has already dropped the bindings. Returns the records
    /// that were detached, for forwarding as withdrawals.
    pub fn topic_space_deleted(&self, topic_space: Uuid, txn: &mut Transaction) -> Vec<HeldSubscription> {
        let mut detached = Vec::new();
        let mut parked: HashMap<Uuid, Vec<ProxySubscription>> = HashMap::new();
        {
            let temporary = self.temporary.lock();
            let already = temporary.get(&topic_space);
            for neighbour in self.neighbours() {
                for subscription in neighbour.subscriptions() {
                    if subscription.topic_space() != topic_space {
                        continue;
                    }
                    let is_parked = already
                        .and_then(|by_neighbour| by_neighbour.get(&neighbour.id()))
                        .is_some_and(|records| records.iter().any(|r| r.key() == subscription.key()));
                    if is_parked {
                        continue;
                    }
                    parked.entry(neighbour.id()).or_default().push(subscription.clone());
                    detached.push((Arc::clone(&neighbour), subscription));
                }
            }
        }

        if !parked.is_empty() {
            let mut temporary = self.temporary.lock();
            let entry = temporary.entry(topic_space).or_default();
            for (id, records) in &parked {
                entry.entry(*id).or_default().extend(records.iter().cloned());
            }
            drop(temporary);

            let temporary = Arc::clone(&self.temporary);
            txn.on_rollback(move || {
                let mut temporary = temporary.lock();
                for (id, records) in parked {
                    for record in records {
                        take_temporary(&mut temporary, id, record.key());
                    }
                }
            });
        }
        tracing::info!(%topic_space, detached = detached.len(), "Detached subscriptions of deleted topic space");
        detached
    }

    /// Whether `neighbour`'s record for `key` is parked as a temporary reference.
    #[must_use]
    pub fn is_pending(&self, neighbour: Uuid, key: &SubscriptionKey) -> bool {
        self.temporary
            .lock()
            .get(&key.topic_space)
            .and_then(|by_neighbour| by_neighbour.get(&neighbour))
            .is_some_and(|records| records.iter().any(|record| record.key() == key))
    }

    /// Number of parked records across every topic space.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.temporary
            .lock()
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Recompute a bus group's tables from live state.
    ///
    /// Local entries come from the match space's consumers; remote entries
    /// from the bound records of neighbours on every other bus.
    pub fn rebuild_bus_group(&self, group: &BusGroup) {
        let local: Vec<ProxySubscription> = self
            .match_space
            .local_subscriptions()
            .iter()
            .map(ProxySubscription::from_local)
            .collect();
        let remote: Vec<ProxySubscription> = self
            .neighbours()
            .into_iter()
            .filter(|neighbour| neighbour.bus() != group.name())
            .flat_map(|neighbour| {
                neighbour
                    .subscriptions()
                    .into_iter()
                    .filter(|record| self.is_bound(neighbour.id(), record))
                    .collect::<Vec<_>>()
            })
            .collect();
        group.rebuild(&local, &remote);
    }

    fn is_bound(&self, neighbour: Uuid, record: &ProxySubscription) -> bool {
        self.match_space.topic_space_name(record.topic_space()).is_some()
            && !self.is_pending(neighbour, record.key())
    }

    /// Rebuild every bus group and send its full state to each member.
    ///
    /// `message_type` is RESET for an unsolicited resync or REQUEST to also
    /// ask each neighbour for its state. Failed sends are retried from the
    /// neighbour's timer rather than reported.
    pub fn reset_bus_subscription_list(&self, message_type: MessageType) {
        for group in self.bus_groups() {
            self.rebuild_bus_group(&group);
            let message = match message_type {
                MessageType::Request => group.generate_request_subscription_message(self.config.engine_id),
                MessageType::Reply => group.generate_reply_subscription_message(self.config.engine_id),
                _ => group.generate_reset_subscription_message(self.config.engine_id),
            };
            tracing::info!(
                bus = %group.name(),
                message_type = ?message.message_type,
                entries = message.entries.len(),
                neighbours = group.neighbour_count(),
                "Sending full subscription state"
            );
            for neighbour in group.neighbours() {
                if message.message_type == MessageType::Request {
                    neighbour.send_request_proxy_subscriptions(message.clone());
                } else {
                    neighbour.send_full_state(message.clone());
                }
            }
        }
    }

    /// Cancel every neighbour's pending resync.
    pub fn shutdown(&self) {
        for neighbour in self.neighbours() {
            neighbour.shutdown();
        }
    }
}

/// Remove a parked record, dropping emptied entries.
fn take_temporary(
    temporary: &mut HashMap<Uuid, HashMap<Uuid, Vec<ProxySubscription>>>,
    neighbour: Uuid,
    key: &SubscriptionKey,
) -> Option<ProxySubscription> {
    let by_neighbour = temporary.get_mut(&key.topic_space)?;
    let records = by_neighbour.get_mut(&neighbour)?;
    let index = records.iter().position(|record| record.key() == key)?;
    let record = records.remove(index);
    if records.is_empty() {
        by_neighbour.remove(&neighbour);
    }
    if by_neighbour.is_empty() {
        temporary.remove(&key.topic_space);
    }
    Some(record)
}

impl fmt::Debug for NeighbourRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeighbourRegistry")
            .field("engine_id", &self.config.engine_id)
            .field("neighbours", &self.neighbours.read().len())
            .field("recovered", &self.recovered_count())
            .field("bus_groups", &self.bus_groups.read().len())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchspace::InMemoryMatchSpace;
    use crate::message::SubscriptionMessage;
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;

    struct Fixture {
        match_space: Arc<InMemoryMatchSpace>,
        transport: Arc<MemoryTransport>,
        store: MemoryStore,
        registry: NeighbourRegistry,
    }

    fn fixture() -> Fixture {
        let match_space = Arc::new(InMemoryMatchSpace::new());
        let transport = Arc::new(MemoryTransport::new());
        let config = Arc::new(ProxyConfig::new(Uuid::new_v4(), "home"));
        let registry = NeighbourRegistry::new(
            config,
            match_space.clone(),
            transport.clone(),
            Handle::current(),
        );
        Fixture {
            match_space,
            transport,
            store: MemoryStore::new(),
            registry,
        }
    }

    fn sub(ts: Uuid, topic: &str) -> ProxySubscription {
        ProxySubscription::new(SubscriptionKey::new(ts, topic), "prices")
    }

    #[tokio::test]
    async fn add_neighbour_is_idempotent() {
        let f = fixture();
        let id = Uuid::new_v4();

        let mut txn = Transaction::new();
        let first = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        txn.commit(&f.store).unwrap();

        let mut txn = Transaction::new();
        let second = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        assert!(txn.ops().is_empty());
        txn.commit(&f.store).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.store.neighbour_count(), 1);
        assert!(f.transport.is_open(id));
        assert_eq!(f.registry.bus_group("home").unwrap().neighbour_count(), 1);
    }

    #[tokio::test]
    async fn rolled_back_add_leaves_nothing() {
        let f = fixture();
        let id = Uuid::new_v4();

        let mut txn = Transaction::new();
        f.registry.add_neighbour(id, "home", &mut txn).unwrap();
        txn.rollback();

        assert!(f.registry.neighbour(id).is_none());
        assert!(f.registry.bus_group("home").is_none());
        assert!(!f.transport.is_open(id));
    }

    #[tokio::test]
    async fn missing_topic_space_defers_binding() {
        let f = fixture();
        let id = Uuid::new_v4();
        let ts = Uuid::new_v4();
        let mut txn = Transaction::new();
        f.registry.add_neighbour(id, "home", &mut txn).unwrap();

        assert!(!f.registry.create_proxy(id, &sub(ts, "t"), &mut txn).unwrap());
        assert!(f.registry.is_pending(id, &SubscriptionKey::new(ts, "t")));

        assert!(!f.registry.delete_proxy(id, &sub(ts, "t"), &mut txn).unwrap());
        assert_eq!(f.registry.pending_count(), 0);
        txn.commit(&f.store).unwrap();
    }

    #[tokio::test]
    async fn topic_space_creation_binds_pending_records() {
        let f = fixture();
        let id = Uuid::new_v4();
        let ts = Uuid::new_v4();
        let mut txn = Transaction::new();
        let neighbour = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        let record = neighbour.proxy_registered(&sub(ts, "t"), &mut txn).unwrap();
        f.registry.create_proxy(id, &record, &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        f.match_space.create_topic_space(ts, "prices");
        let mut txn = Transaction::new();
        let realized = f.registry.topic_space_created(ts, &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        assert_eq!(realized.len(), 1);
        assert_eq!(f.match_space.bound_topics(ts, id), vec!["t".to_string()]);
        assert_eq!(f.registry.pending_count(), 0);

        f.match_space.delete_topic_space(ts);
        let mut txn = Transaction::new();
        let detached = f.registry.topic_space_deleted(ts, &mut txn);
        txn.commit(&f.store).unwrap();
        assert_eq!(detached.len(), 1);
        assert!(f.registry.is_pending(id, record.key()));
    }

    #[tokio::test]
    async fn remove_neighbour_withdraws_bound_records() {
        let f = fixture();
        let id = Uuid::new_v4();
        let ts = Uuid::new_v4();
        f.match_space.create_topic_space(ts, "prices");

        let mut txn = Transaction::new();
        let neighbour = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        for topic in ["t1", "t2"] {
            let record = neighbour.proxy_registered(&sub(ts, topic), &mut txn).unwrap();
            f.registry.create_proxy(id, &record, &mut txn).unwrap();
        }
        txn.commit(&f.store).unwrap();
        assert_eq!(f.store.subscription_count(id), 2);

        let mut txn = Transaction::new();
        let withdrawn = f.registry.remove_neighbour(id, "home", &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        assert_eq!(withdrawn.len(), 2);
        assert_eq!(neighbour.subscription_count(), 0);
        assert!(!f.match_space.has_output_binding(ts, id));
        assert!(f.registry.bus_group("home").is_none());
        assert_eq!(f.store.neighbour_count(), 0);
        assert!(!f.transport.is_open(id));
    }

    #[tokio::test]
    async fn rolled_back_removal_restores_neighbour() {
        let f = fixture();
        let id = Uuid::new_v4();
        let ts = Uuid::new_v4();
        f.match_space.create_topic_space(ts, "prices");
        let mut txn = Transaction::new();
        let neighbour = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        let record = neighbour.proxy_registered(&sub(ts, "t"), &mut txn).unwrap();
        f.registry.create_proxy(id, &record, &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        let mut txn = Transaction::new();
        f.registry.remove_neighbour(id, "home", &mut txn).unwrap();
        txn.rollback();

        assert!(f.registry.neighbour(id).is_some());
        assert_eq!(f.registry.bus_group("home").unwrap().neighbour_count(), 1);
        assert_eq!(neighbour.subscription_count(), 1);
        assert_eq!(f.match_space.bound_topics(ts, id), vec!["t".to_string()]);
        assert!(f.transport.is_open(id));
    }

    #[tokio::test]
    async fn pending_request_survives_rolled_back_removal() {
        let f = fixture();
        let id = Uuid::new_v4();
        let mut txn = Transaction::new();
        let neighbour = f.registry.add_neighbour(id, "home", &mut txn).unwrap().neighbour;
        txn.commit(&f.store).unwrap();
        neighbour.send_request_proxy_subscriptions(SubscriptionMessage::new(
            MessageType::Request,
            f.registry.config().engine_id,
            "home",
        ));

        let mut txn = Transaction::new();
        f.registry.remove_neighbour(id, "home", &mut txn).unwrap();
        txn.rollback();
        assert!(neighbour.is_awaiting_response());

        let mut txn = Transaction::new();
        f.registry.remove_neighbour(id, "home", &mut txn).unwrap();
        txn.commit(&f.store).unwrap();
        assert!(!neighbour.is_awaiting_response());
    }

    #[tokio::test]
    async fn only_first_member_creates_bus_group() {
        let f = fixture();

        let mut txn = Transaction::new();
        let first = f.registry.add_neighbour(Uuid::new_v4(), "home", &mut txn).unwrap();
        let second = f.registry.add_neighbour(Uuid::new_v4(), "home", &mut txn).unwrap();
        let again = f.registry.add_neighbour(first.neighbour.id(), "home", &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        assert!(first.new_group);
        assert!(!second.new_group);
        assert!(!again.new_group);
        assert_eq!(f.registry.bus_group("home").unwrap().neighbour_count(), 2);
    }

    #[tokio::test]
    async fn recovered_neighbour_is_promoted() {
        let f = fixture();
        let id = Uuid::new_v4();
        let ts = Uuid::new_v4();
        f.match_space.create_topic_space(ts, "prices");
        f.store
            .apply(&[
                StoreOp::PutNeighbour(NeighbourRecord {
                    id,
                    bus: "home".to_string(),
                }),
                StoreOp::PutSubscription {
                    neighbour: id,
                    subscription: sub(ts, "t").with_ref_count(1),
                },
            ])
            .unwrap();

        assert_eq!(f.registry.recover(&f.store).unwrap(), 1);
        assert!(f.registry.neighbour(id).is_none());

        let mut txn = Transaction::new();
        let LinkedNeighbour { neighbour, bound, .. } =
            f.registry.add_neighbour(id, "home", &mut txn).unwrap();
        txn.commit(&f.store).unwrap();

        assert_eq!(bound.len(), 1);
        assert_eq!(neighbour.subscription_count(), 1);
        assert_eq!(f.registry.recovered_count(), 0);
        assert_eq!(f.match_space.bound_topics(ts, id), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn unused_recovered_neighbours_are_dropped() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.store
            .apply(&[StoreOp::PutNeighbour(NeighbourRecord {
                id,
                bus: "home".to_string(),
            })])
            .unwrap();
        f.registry.recover(&f.store).unwrap();

        let mut txn = Transaction::new();
        assert_eq!(f.registry.remove_unused_neighbours(&mut txn), 1);
        txn.commit(&f.store).unwrap();

        assert_eq!(f.registry.recovered_count(), 0);
        assert_eq!(f.store.neighbour_count(), 0);
    }
}
