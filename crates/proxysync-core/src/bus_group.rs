//! Per-bus aggregation.
//!
//! A [`BusGroup`] tracks what this engine advertises onto one bus: the
//! *local* table counts this engine's own consumers per key, the *remote*
//! table counts the neighbours on other buses holding the key. A key is
//! advertised while it is present in either table.

use crate::config::ProxyConfig;
use crate::message::{MessageBuilder, MessageType, SubscriptionMessage, TopicEntry};
use crate::neighbour::Neighbour;
use crate::subscription::{ProxySubscription, SubscriptionKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Local,
    Remote,
}

#[derive(Debug, Default)]
struct Tables {
    local: HashMap<SubscriptionKey, ProxySubscription>,
    remote: HashMap<SubscriptionKey, ProxySubscription>,
}

impl Tables {
    /// The table written to and the one consulted for presence on the bus.
    fn split(
        &mut self,
        table: Table,
    ) -> (
        &mut HashMap<SubscriptionKey, ProxySubscription>,
        &HashMap<SubscriptionKey, ProxySubscription>,
    ) {
        match table {
            Table::Local => (&mut self.local, &self.remote),
            Table::Remote => (&mut self.remote, &self.local),
        }
    }
}

/// Neighbours on one bus and the interest advertised to them.
pub struct BusGroup {
    name: String,
    config: Arc<ProxyConfig>,
    neighbours: RwLock<Vec<Arc<Neighbour>>>,
    tables: Mutex<Tables>,
}

impl BusGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new(name: impl Into<String>, config: Arc<ProxyConfig>) -> Self {
        Self {
            name: name.into(),
            config,
            neighbours: RwLock::new(Vec::new()),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a neighbour. Returns `false` if it was already a member.
    pub fn add_neighbour(&self, neighbour: Arc<Neighbour>) -> bool {
        let mut neighbours = self.neighbours.write();
        if neighbours.iter().any(|member| member.id() == neighbour.id()) {
            return false;
        }
        neighbours.push(neighbour);
        true
    }

    /// Remove a neighbour, returning it if it was a member.
    pub fn remove_neighbour(&self, id: Uuid) -> Option<Arc<Neighbour>> {
        let mut neighbours = self.neighbours.write();
        let index = neighbours.iter().position(|member| member.id() == id)?;
        Some(neighbours.remove(index))
    }

    /// Current members.
    #[must_use]
    pub fn neighbours(&self) -> Vec<Arc<Neighbour>> {
        self.neighbours.read().clone()
    }

    /// Number of members.
    #[must_use]
    pub fn neighbour_count(&self) -> usize {
        self.neighbours.read().len()
    }

    /// Whether the group has no members left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbours.read().is_empty()
    }

    /// Count a local consumer of `subscription`.
    ///
    /// Returns `true` if the key became present on the bus; a CREATE entry
    /// is then pushed onto `builder` when `advertise` is set.
    pub fn add_local_subscription(
        &self,
        subscription: &ProxySubscription,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        self.add(Table::Local, subscription, builder, advertise)
    }

    /// Count a neighbour on another bus holding `subscription`.
    pub fn add_remote_subscription(
        &self,
        subscription: &ProxySubscription,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        self.add(Table::Remote, subscription, builder, advertise)
    }

    /// Release a local consumer of `key`.
    ///
    /// Returns `true` if the key left the bus; a DELETE entry is then pushed
    /// onto `builder` when `advertise` is set. Unknown keys are ignored.
    pub fn remove_local_subscription(
        &self,
        key: &SubscriptionKey,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        self.remove(Table::Local, key, builder, advertise)
    }

    /// Release a neighbour on another bus holding `key`.
    pub fn remove_remote_subscription(
        &self,
        key: &SubscriptionKey,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        self.remove(Table::Remote, key, builder, advertise)
    }

    fn add(
        &self,
        table: Table,
        subscription: &ProxySubscription,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        let mut tables = self.tables.lock();
        let (target, other) = tables.split(table);
        let first = target
            .entry(subscription.key().clone())
            .or_insert_with(|| subscription.clone().with_ref_count(0))
            .increment();
        let appeared = first && !other.contains_key(subscription.key());
        if appeared && advertise {
            builder.push(self.entry(subscription));
        }
        appeared
    }

    fn remove(
        &self,
        table: Table,
        key: &SubscriptionKey,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> bool {
        let mut tables = self.tables.lock();
        let (target, other) = tables.split(table);
        let Some(record) = target.get_mut(key) else {
            return false;
        };
        if !record.decrement() {
            return false;
        }
        let Some(record) = target.remove(key) else {
            return false;
        };
        let vanished = !other.contains_key(key);
        if vanished && advertise {
            builder.push(self.entry(&record));
        }
        vanished
    }

    fn entry(&self, subscription: &ProxySubscription) -> TopicEntry {
        let foreign_name = self
            .config
            .foreign_topic_space_name(&self.name, subscription.topic_space_name());
        TopicEntry::from_subscription(subscription, foreign_name)
    }

    /// Drop every local entry on a deleted topic space.
    ///
    /// DELETE entries are pushed for keys that leave the bus when `advertise` is set.
    pub fn purge_topic_space(
        &self,
        topic_space: Uuid,
        builder: &mut MessageBuilder,
        advertise: bool,
    ) -> usize {
        let mut tables = self.tables.lock();
        let keys: Vec<SubscriptionKey> = tables
            .local
            .keys()
            .filter(|key| key.topic_space == topic_space)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(record) = tables.local.remove(key) {
                if advertise && !tables.remote.contains_key(key) {
                    builder.push(self.entry(&record));
                }
            }
        }
        keys.len()
    }

    /// Replace both tables with counts rebuilt from live state.
    ///
    /// `local` has one entry per local consumer, `remote` one entry per
    /// neighbour on another bus holding the key.
    pub fn rebuild(&self, local: &[ProxySubscription], remote: &[ProxySubscription]) {
        let mut rebuilt = Tables::default();
        for subscription in local {
            rebuilt
                .local
                .entry(subscription.key().clone())
                .or_insert_with(|| subscription.clone().with_ref_count(0))
                .increment();
        }
        for subscription in remote {
            rebuilt
                .remote
                .entry(subscription.key().clone())
                .or_insert_with(|| subscription.clone().with_ref_count(0))
                .increment();
        }
        *self.tables.lock() = rebuilt;
    }

    /// Send a message to every member.
    ///
    /// Failures are logged per neighbour and do not stop the fan-out.
    /// Returns the number of failed sends.
    pub fn send_to_neighbours(&self, message: &SubscriptionMessage) -> usize {
        let mut failed = 0;
        for neighbour in self.neighbours() {
            if let Err(err) = neighbour.send(message) {
                failed += 1;
                tracing::warn!(
                    neighbour = %neighbour.id(),
                    bus = %self.name,
                    message_type = ?message.message_type,
                    error = %err,
                    "Failed to send subscription update"
                );
            }
        }
        failed
    }

    /// Full state for an unsolicited resync.
    #[must_use]
    pub fn generate_reset_subscription_message(&self, sender: Uuid) -> SubscriptionMessage {
        self.generate_full_state(MessageType::Reset, sender)
    }

    /// Full state answering a REQUEST.
    #[must_use]
    pub fn generate_reply_subscription_message(&self, sender: Uuid) -> SubscriptionMessage {
        self.generate_full_state(MessageType::Reply, sender)
    }

    /// Full state asking for the receiver's full state in return.
    #[must_use]
    pub fn generate_request_subscription_message(&self, sender: Uuid) -> SubscriptionMessage {
        self.generate_full_state(MessageType::Request, sender)
    }

    fn generate_full_state(&self, message_type: MessageType, sender: Uuid) -> SubscriptionMessage {
        let mut builder = MessageBuilder::new(sender);
        builder.begin(message_type, &self.name);
        {
            let tables = self.tables.lock();
            let keys: BTreeSet<&SubscriptionKey> =
                tables.local.keys().chain(tables.remote.keys()).collect();
            for key in keys {
                if let Some(record) = tables.local.get(key).or_else(|| tables.remote.get(key)) {
                    builder.push(self.entry(record));
                }
            }
        }
        builder
            .take()
            .unwrap_or_else(|| SubscriptionMessage::new(message_type, sender, self.name.clone()))
    }

    /// Local consumer count for `key`.
    #[must_use]
    pub fn local_ref_count(&self, key: &SubscriptionKey) -> u32 {
        self.tables.lock().local.get(key).map_or(0, ProxySubscription::ref_count)
    }

    /// Remote holder count for `key`.
    #[must_use]
    pub fn remote_ref_count(&self, key: &SubscriptionKey) -> u32 {
        self.tables.lock().remote.get(key).map_or(0, ProxySubscription::ref_count)
    }

    /// Number of distinct keys in the local and remote tables.
    #[must_use]
    pub fn table_sizes(&self) -> (usize, usize) {
        let tables = self.tables.lock();
        (tables.local.len(), tables.remote.len())
    }
}

impl fmt::Debug for BusGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (local, remote) = self.table_sizes();
        f.debug_struct("BusGroup")
            .field("name", &self.name)
            .field("neighbours", &self.neighbour_count())
            .field("local", &local)
            .field("remote", &remote)
            .finish()
    }
}
