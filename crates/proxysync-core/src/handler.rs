//! The proxy handler: entry point for local and structural events.
//!
//! The handler moves through `stopped → started → (reconciling) → started`.
//! While stopped, local subscribe/unsubscribe events are dropped. While
//! reconciling (after recovery, until [`ProxyHandler::reconcile_complete`]),
//! events update the bus group tables but are not advertised; the full
//! resync that ends reconciliation carries them.

use crate::bus_group::BusGroup;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::lock::ProxyLock;
use crate::matchspace::MatchSpace;
use crate::message::{MessageBuilder, MessageType};
use crate::neighbour::Neighbour;
use crate::registry::{HeldSubscription, LinkedNeighbour, NeighbourRegistry};
use crate::store::SubscriptionStore;
use crate::subscription::{LocalSubscription, ProxySubscription};
use crate::transport::Transport;
use crate::txn::Transaction;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

/// Point-in-time view of a handler, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerSnapshot {
    /// This engine
    pub engine_id: Uuid,
    /// Home bus
    pub home_bus: String,
    /// Whether events are processed
    pub started: bool,
    /// Whether advertisement is held back pending a full resync
    pub reconciling: bool,
    /// Live neighbours
    pub neighbours: Vec<NeighbourSnapshot>,
    /// Recovered neighbours not yet re-linked
    pub recovered: usize,
    /// Bus groups
    pub bus_groups: Vec<BusGroupSnapshot>,
    /// Records parked until their topic space exists
    pub pending_references: usize,
}

/// One neighbour in a [`HandlerSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighbourSnapshot {
    /// Peer engine
    pub id: Uuid,
    /// Bus of the link
    pub bus: String,
    /// Records held
    pub subscriptions: usize,
    /// Whether a REQUEST is unanswered
    pub awaiting_response: bool,
}

/// One bus group in a [`HandlerSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusGroupSnapshot {
    /// Bus name
    pub name: String,
    /// Member count
    pub neighbours: usize,
    /// Distinct local keys
    pub local: usize,
    /// Distinct remote keys
    pub remote: usize,
}

/// Coordinator of proxy subscription propagation on one engine.
pub struct ProxyHandler {
    config: Arc<ProxyConfig>,
    registry: NeighbourRegistry,
    store: Arc<dyn SubscriptionStore>,
    lock: ProxyLock,
    started: AtomicBool,
    reconciling: AtomicBool,
}

impl ProxyHandler {
    /// Create a stopped handler.
    ///
    /// Resync timers are spawned on `runtime`.
    pub fn new(
        config: ProxyConfig,
        match_space: Arc<dyn MatchSpace>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SubscriptionStore>,
        runtime: Handle,
    ) -> Self {
        let config = Arc::new(config);
        let registry = NeighbourRegistry::new(Arc::clone(&config), match_space, transport, runtime);
        Self {
            config,
            registry,
            store,
            lock: ProxyLock::new(),
            started: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
        }
    }

    /// Protocol configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The neighbour registry.
    #[must_use]
    pub fn registry(&self) -> &NeighbourRegistry {
        &self.registry
    }

    /// The coordinator lock.
    #[must_use]
    pub fn lock(&self) -> &ProxyLock {
        &self.lock
    }

    /// The store transactions commit to.
    #[must_use]
    pub fn store(&self) -> &dyn SubscriptionStore {
        self.store.as_ref()
    }

    /// Whether the handler processes events.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether advertisement is held back pending a full resync.
    #[must_use]
    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::SeqCst)
    }

    fn advertising(&self) -> bool {
        self.is_started() && !self.is_reconciling()
    }

    /// Load persisted neighbours.
    ///
    /// If any were found the handler reconciles once started: nothing is
    /// advertised until [`reconcile_complete`](Self::reconcile_complete).
    ///
    /// # Errors
    ///
    /// Returns error if persisted state cannot be read.
    pub fn recover(&self) -> Result<usize, ProxyError> {
        let _guard = self.lock.lock_exclusive();
        let recovered = self.registry.recover(self.store.as_ref())?;
        if recovered > 0 {
            self.reconciling.store(true, Ordering::SeqCst);
        }
        tracing::info!(recovered, "Recovered persisted neighbours");
        Ok(recovered)
    }

    /// Start processing events.
    ///
    /// Without recovered state this sends a REQUEST with the full state to
    /// every neighbour right away.
    pub fn start(&self) {
        let _guard = self.lock.lock_exclusive();
        self.started.store(true, Ordering::SeqCst);
        let reconciling = self.is_reconciling();
        tracing::info!(engine_id = %self.config.engine_id, reconciling, "Proxy handler started");
        if !reconciling {
            self.registry.reset_bus_subscription_list(MessageType::Request);
        }
    }

    /// End reconciliation after recovered links have been re-created.
    ///
    /// Recovered neighbours that were not re-linked are dropped, then every
    /// neighbour is sent a REQUEST with the full state.
    ///
    /// # Errors
    ///
    /// Returns error if dropping unused neighbours cannot be committed.
    pub fn reconcile_complete(&self) -> Result<(), ProxyError> {
        let _guard = self.lock.lock_exclusive();
        if !self.is_reconciling() {
            return Ok(());
        }
        let mut txn = Transaction::new();
        let dropped = self.registry.remove_unused_neighbours(&mut txn);
        txn.commit(self.store.as_ref())?;

        self.reconciling.store(false, Ordering::SeqCst);
        tracing::info!(dropped, "Reconciliation complete");
        if self.is_started() {
            self.registry.reset_bus_subscription_list(MessageType::Request);
        }
        Ok(())
    }

    /// Stop processing events and cancel pending resyncs.
    pub fn stop(&self) {
        let _guard = self.lock.lock_exclusive();
        self.started.store(false, Ordering::SeqCst);
        self.registry.shutdown();
        tracing::info!(engine_id = %self.config.engine_id, "Proxy handler stopped");
    }

    /// A local consumer subscribed.
    ///
    /// The consumer must already be registered in the match space: bus
    /// group tables are rebuilt from the match space's consumers whenever a
    /// full state is generated.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Internal`] if the topic space does not exist or
    /// the consumer is not registered in the match space.
    pub fn subscribe_event(&self, subscription: &LocalSubscription) -> Result<(), ProxyError> {
        self.local_event(subscription, MessageType::Create, true)
    }

    /// A local consumer unsubscribed.
    ///
    /// `send_proxy = false` updates the tables without advertising.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Internal`] if the topic space does not exist.
    pub fn unsubscribe_event(
        &self,
        subscription: &LocalSubscription,
        send_proxy: bool,
    ) -> Result<(), ProxyError> {
        self.local_event(subscription, MessageType::Delete, send_proxy)
    }

    fn local_event(
        &self,
        subscription: &LocalSubscription,
        message_type: MessageType,
        send_proxy: bool,
    ) -> Result<(), ProxyError> {
        if !self.is_started() {
            tracing::debug!(key = %subscription.key, ?message_type, "Handler stopped, local event dropped");
            return Ok(());
        }
        let _guard = self.lock.lock();
        self.require_topic_space(subscription.key.topic_space)?;
        if message_type == MessageType::Create
            && !self.registry.match_space().has_local_subscription(&subscription.key)
        {
            tracing::error!(key = %subscription.key, "Local subscription not registered in the match space");
            return Err(ProxyError::Internal(format!(
                "no local consumer registered on {}",
                subscription.key
            )));
        }

        let record = ProxySubscription::from_local(subscription);
        let advertise = send_proxy && !self.is_reconciling();
        let mut builder = MessageBuilder::new(self.config.engine_id);
        for group in self.registry.bus_groups() {
            builder.begin(message_type, group.name());
            if message_type == MessageType::Create {
                group.add_local_subscription(&record, &mut builder, advertise);
            } else {
                group.remove_local_subscription(record.key(), &mut builder, advertise);
            }
            flush(&group, &mut builder);
        }
        Ok(())
    }

    /// Re-advertise records learned on `origin_bus` onto every other bus.
    ///
    /// Dropped while the handler is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Internal`] if a topic space does not exist.
    pub fn remote_subscribe_event(
        &self,
        subscriptions: &[ProxySubscription],
        origin_bus: &str,
        send_proxy: bool,
    ) -> Result<(), ProxyError> {
        if !self.is_started() {
            tracing::debug!(origin_bus, count = subscriptions.len(), "Handler stopped, remote event dropped");
            return Ok(());
        }
        let _guard = self.lock.lock();
        self.forward(subscriptions, origin_bus, MessageType::Create, send_proxy)
    }

    /// Withdraw records learned on `origin_bus` from every other bus.
    ///
    /// Dropped while the handler is stopped.
    ///
    /// # Errors
    ///
    /// Withdrawals do not resolve topic spaces and do not fail.
    pub fn remote_unsubscribe_event(
        &self,
        subscriptions: &[ProxySubscription],
        origin_bus: &str,
        send_proxy: bool,
    ) -> Result<(), ProxyError> {
        if !self.is_started() {
            tracing::debug!(origin_bus, count = subscriptions.len(), "Handler stopped, remote event dropped");
            return Ok(());
        }
        let _guard = self.lock.lock();
        self.forward(subscriptions, origin_bus, MessageType::Delete, send_proxy)
    }

    /// Update remote tables of every bus but `origin_bus`. Caller holds the lock.
    pub(crate) fn forward(
        &self,
        subscriptions: &[ProxySubscription],
        origin_bus: &str,
        message_type: MessageType,
        send_proxy: bool,
    ) -> Result<(), ProxyError> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        if message_type == MessageType::Create {
            for subscription in subscriptions {
                self.require_topic_space(subscription.topic_space())?;
            }
        }

        let advertise = send_proxy && self.advertising();
        let mut builder = MessageBuilder::new(self.config.engine_id);
        for group in self.registry.bus_groups() {
            if group.name() == origin_bus {
                continue;
            }
            builder.begin(message_type, group.name());
            for subscription in subscriptions {
                if message_type == MessageType::Create {
                    group.add_remote_subscription(subscription, &mut builder, advertise);
                } else {
                    group.remove_remote_subscription(subscription.key(), &mut builder, advertise);
                }
            }
            flush(&group, &mut builder);
        }
        Ok(())
    }

    fn forward_by_origin(
        &self,
        held: Vec<HeldSubscription>,
        message_type: MessageType,
    ) -> Result<(), ProxyError> {
        let mut by_bus: BTreeMap<String, Vec<ProxySubscription>> = BTreeMap::new();
        for (neighbour, subscription) in held {
            by_bus.entry(neighbour.bus().to_string()).or_default().push(subscription);
        }
        for (bus, subscriptions) in by_bus {
            self.forward(&subscriptions, &bus, message_type, true)?;
        }
        Ok(())
    }

    fn require_topic_space(&self, topic_space: Uuid) -> Result<(), ProxyError> {
        if self.registry.match_space().topic_space_name(topic_space).is_some() {
            return Ok(());
        }
        tracing::error!(%topic_space, "Topic space missing while advertising");
        Err(ProxyError::Internal(format!("topic space {topic_space} does not exist")))
    }

    /// Link a neighbour.
    ///
    /// Records of a promoted recovered neighbour are re-advertised to the
    /// other buses. Once started and not reconciling, the new neighbour is
    /// sent a REQUEST with this bus's full state.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be committed.
    pub fn create_neighbour(&self, id: Uuid, bus: &str) -> Result<Arc<Neighbour>, ProxyError> {
        let _guard = self.lock.lock_exclusive();
        self.create_neighbour_locked(id, bus, true)
    }

    /// Link a neighbour first heard from through an inbound full-state message.
    pub(crate) fn adopt_neighbour(
        &self,
        id: Uuid,
        bus: &str,
        send_request: bool,
    ) -> Result<Arc<Neighbour>, ProxyError> {
        let _guard = self.lock.lock_exclusive();
        self.create_neighbour_locked(id, bus, send_request)
    }

    fn create_neighbour_locked(
        &self,
        id: Uuid,
        bus: &str,
        send_request: bool,
    ) -> Result<Arc<Neighbour>, ProxyError> {
        let mut txn = Transaction::new();
        let LinkedNeighbour {
            neighbour,
            bound,
            new_group,
        } = self.registry.add_neighbour(id, bus, &mut txn)?;
        txn.commit(self.store.as_ref())?;

        let Some(group) = self.registry.bus_group(bus) else {
            return Err(ProxyError::Internal(format!("bus group {bus} missing after adding {id}")));
        };
        // Existing groups keep their counts; the new member learns them from the REQUEST
        if new_group {
            self.registry.rebuild_bus_group(&group);
        }

        if self.advertising() {
            self.forward(&bound, bus, MessageType::Create, true)?;
            if send_request {
                neighbour.send_request_proxy_subscriptions(
                    group.generate_request_subscription_message(self.config.engine_id),
                );
            }
        }
        Ok(neighbour)
    }

    /// Unlink a neighbour, withdrawing everything it held from the other buses.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be committed.
    pub fn delete_neighbour_forced(&self, id: Uuid, bus: &str) -> Result<(), ProxyError> {
        let _guard = self.lock.lock_exclusive();
        let mut txn = Transaction::new();
        let withdrawn = self.registry.remove_neighbour(id, bus, &mut txn)?;
        txn.commit(self.store.as_ref())?;
        self.forward(&withdrawn, bus, MessageType::Delete, true)
    }

    /// A topic space was created: bind deferred records and advertise them.
    ///
    /// # Errors
    ///
    /// Returns error if binding fails or cannot be committed.
    pub fn topic_space_created_event(&self, topic_space: Uuid) -> Result<(), ProxyError> {
        let _guard = self.lock.lock_exclusive();
        let mut txn = Transaction::new();
        let realized = self.registry.topic_space_created(topic_space, &mut txn)?;
        txn.commit(self.store.as_ref())?;
        self.forward_by_origin(realized, MessageType::Create)
    }

    /// A topic space was deleted: park its records and withdraw them.
    ///
    /// Local consumers on the topic space are gone with it and are withdrawn
    /// from every bus.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be committed.
    pub fn topic_space_deleted_event(&self, topic_space: Uuid) -> Result<(), ProxyError> {
        let _guard = self.lock.lock_exclusive();
        let mut txn = Transaction::new();
        let detached = self.registry.topic_space_deleted(topic_space, &mut txn);
        txn.commit(self.store.as_ref())?;
        self.forward_by_origin(detached, MessageType::Delete)?;

        let advertise = self.advertising();
        let mut builder = MessageBuilder::new(self.config.engine_id);
        for group in self.registry.bus_groups() {
            builder.begin(MessageType::Delete, group.name());
            group.purge_topic_space(topic_space, &mut builder, advertise);
            flush(&group, &mut builder);
        }
        Ok(())
    }

    /// Send an unsolicited RESET with the full state to every neighbour.
    pub fn reset_bus_subscription_list(&self) {
        let _guard = self.lock.lock_exclusive();
        self.registry.reset_bus_subscription_list(MessageType::Reset);
    }

    /// Current state, for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> HandlerSnapshot {
        let _guard = self.lock.lock();
        HandlerSnapshot {
            engine_id: self.config.engine_id,
            home_bus: self.config.home_bus.clone(),
            started: self.is_started(),
            reconciling: self.is_reconciling(),
            neighbours: self
                .registry
                .neighbours()
                .iter()
                .map(|neighbour| NeighbourSnapshot {
                    id: neighbour.id(),
                    bus: neighbour.bus().to_string(),
                    subscriptions: neighbour.subscription_count(),
                    awaiting_response: neighbour.is_awaiting_response(),
                })
                .collect(),
            recovered: self.registry.recovered_count(),
            bus_groups: self
                .registry
                .bus_groups()
                .iter()
                .map(|group| {
                    let (local, remote) = group.table_sizes();
                    BusGroupSnapshot {
                        name: group.name().to_string(),
                        neighbours: group.neighbour_count(),
                        local,
                        remote,
                    }
                })
                .collect(),
            pending_references: self.registry.pending_count(),
        }
    }
}

/// Send the builder's batch, if any, to the group's members.
fn flush(group: &BusGroup, builder: &mut MessageBuilder) {
    if let Some(message) = builder.take() {
        group.send_to_neighbours(&message);
    }
}

impl fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("engine_id", &self.config.engine_id)
            .field("started", &self.is_started())
            .field("reconciling", &self.is_reconciling())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchspace::InMemoryMatchSpace;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionKey;
    use crate::transport::MemoryTransport;

    struct Fixture {
        match_space: Arc<InMemoryMatchSpace>,
        transport: Arc<MemoryTransport>,
        handler: ProxyHandler,
        topic_space: Uuid,
    }

    fn fixture() -> Fixture {
        let match_space = Arc::new(InMemoryMatchSpace::new());
        let transport = Arc::new(MemoryTransport::new());
        let topic_space = Uuid::new_v4();
        match_space.create_topic_space(topic_space, "prices");
        let handler = ProxyHandler::new(
            ProxyConfig::new(Uuid::new_v4(), "home"),
            match_space.clone(),
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Handle::current(),
        );
        Fixture {
            match_space,
            transport,
            handler,
            topic_space,
        }
    }

    #[tokio::test]
    async fn stopped_handler_drops_local_events() {
        let f = fixture();
        f.handler.create_neighbour(Uuid::new_v4(), "home").unwrap();

        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        f.handler.subscribe_event(&local).unwrap();

        assert!(f.transport.drain().is_empty());
        assert_eq!(f.handler.snapshot().bus_groups[0].local, 0);
    }

    #[tokio::test]
    async fn missing_topic_space_is_internal_error() {
        let f = fixture();
        f.handler.start();

        let local = LocalSubscription::new(Uuid::new_v4(), "gone", "t");
        assert!(matches!(
            f.handler.subscribe_event(&local),
            Err(ProxyError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_local_subscription_is_rejected() {
        let f = fixture();
        f.handler.start();
        f.handler.create_neighbour(Uuid::new_v4(), "home").unwrap();
        f.transport.drain();

        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        assert!(matches!(
            f.handler.subscribe_event(&local),
            Err(ProxyError::Internal(_))
        ));
        assert!(f.transport.drain().is_empty());
    }

    #[tokio::test]
    async fn stopped_handler_drops_remote_events() {
        let f = fixture();
        f.handler.create_neighbour(Uuid::new_v4(), "home").unwrap();
        f.handler.create_neighbour(Uuid::new_v4(), "partner").unwrap();
        let key = SubscriptionKey::new(f.topic_space, "t");
        let record = ProxySubscription::new(key.clone(), "prices");

        f.handler.remote_subscribe_event(&[record.clone()], "home", true).unwrap();
        let partner = f.handler.registry().bus_group("partner").unwrap();
        assert_eq!(partner.remote_ref_count(&key), 0);

        f.handler.start();
        f.handler.remote_subscribe_event(&[record.clone()], "home", true).unwrap();
        assert_eq!(partner.remote_ref_count(&key), 1);

        f.handler.stop();
        f.handler.remote_unsubscribe_event(&[record], "home", true).unwrap();
        assert_eq!(partner.remote_ref_count(&key), 1);
    }

    #[tokio::test]
    async fn joining_neighbour_keeps_local_counts() {
        let f = fixture();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        f.handler.start();
        f.handler.create_neighbour(n1, "home").unwrap();
        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        f.match_space.add_local_subscription(local.clone()).unwrap();
        f.handler.subscribe_event(&local).unwrap();
        f.transport.drain();

        f.handler.create_neighbour(n2, "home").unwrap();
        let home = f.handler.registry().bus_group("home").unwrap();
        assert_eq!(home.local_ref_count(&local.key), 1);
        let to_n2 = f.transport.drain_for(n2);
        assert_eq!(to_n2[0].message_type, MessageType::Request);
        assert_eq!(to_n2[0].topics().collect::<Vec<_>>(), vec!["t"]);

        f.match_space.remove_local_subscription(&local);
        f.handler.unsubscribe_event(&local, true).unwrap();

        for target in [n1, n2] {
            let sent = f.transport.drain_for(target);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].message_type, MessageType::Delete);
        }
    }

    #[tokio::test]
    async fn local_subscription_is_advertised_to_every_bus() {
        let f = fixture();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        f.handler.start();
        f.handler.create_neighbour(n1, "home").unwrap();
        f.handler.create_neighbour(n2, "partner").unwrap();
        f.transport.drain();

        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        f.match_space.add_local_subscription(local.clone()).unwrap();
        f.handler.subscribe_event(&local).unwrap();

        let sent = f.transport.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, message)| message.message_type == MessageType::Create));
        let home = f.handler.registry().bus_group("home").unwrap();
        assert_eq!(home.local_ref_count(&SubscriptionKey::new(f.topic_space, "t")), 1);
    }

    #[tokio::test]
    async fn new_neighbour_is_asked_for_its_state() {
        let f = fixture();
        f.handler.start();
        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        f.match_space.add_local_subscription(local).unwrap();

        let id = Uuid::new_v4();
        let neighbour = f.handler.create_neighbour(id, "home").unwrap();

        let sent = f.transport.drain_for(id);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Request);
        assert_eq!(sent[0].topics().collect::<Vec<_>>(), vec!["t"]);
        assert!(neighbour.is_awaiting_response());
    }

    #[tokio::test]
    async fn reconciling_holds_back_advertisement() {
        let f = fixture();
        let store = Arc::new(MemoryStore::new());
        let peer = Uuid::new_v4();
        store
            .apply(&[crate::StoreOp::PutNeighbour(crate::NeighbourRecord {
                id: peer,
                bus: "home".to_string(),
            })])
            .unwrap();
        let handler = ProxyHandler::new(
            ProxyConfig::new(Uuid::new_v4(), "home"),
            f.match_space.clone(),
            f.transport.clone(),
            store.clone(),
            Handle::current(),
        );

        assert_eq!(handler.recover().unwrap(), 1);
        handler.start();
        assert!(handler.is_reconciling());
        handler.create_neighbour(peer, "home").unwrap();

        let local = LocalSubscription::new(f.topic_space, "prices", "t");
        f.match_space.add_local_subscription(local.clone()).unwrap();
        handler.subscribe_event(&local).unwrap();
        assert!(f.transport.drain().is_empty());

        handler.reconcile_complete().unwrap();
        let sent = f.transport.drain_for(peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Request);
        assert_eq!(sent[0].topics().collect::<Vec<_>>(), vec!["t"]);
        assert!(!handler.is_reconciling());
    }

    #[tokio::test]
    async fn admin_reset_sends_full_state() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.handler.start();
        f.handler.create_neighbour(id, "home").unwrap();
        f.transport.drain();

        f.handler.reset_bus_subscription_list();

        let sent = f.transport.drain_for(id);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Reset);
    }

    #[tokio::test]
    async fn snapshot_reports_state() {
        let f = fixture();
        f.handler.start();
        f.handler.create_neighbour(Uuid::new_v4(), "home").unwrap();

        let snapshot = f.handler.snapshot();
        assert!(snapshot.started);
        assert_eq!(snapshot.neighbours.len(), 1);
        assert_eq!(snapshot.bus_groups[0].name, "home");
    }
}
