//! Inbound protocol messages.
//!
//! The [`NeighbourListener`] applies one message from a neighbour inside a
//! transaction. Forwarding to other buses happens as soon as each change is
//! decided, before the commit; if the commit (or a later step) fails, the
//! already-forwarded table changes are undone with suppressed inverse events.

use crate::access::{AccessChecker, AccessOperation};
use crate::error::ProxyError;
use crate::handler::ProxyHandler;
use crate::message::{MessageType, SubscriptionMessage, TopicEntry};
use crate::neighbour::Neighbour;
use crate::subscription::{Principal, ProxySubscription, SubscriptionKey};
use crate::txn::Transaction;
use std::fmt;
use std::sync::Arc;

/// Forwarding already applied while a message was processed.
#[derive(Debug, Default)]
struct Applied {
    created: Vec<ProxySubscription>,
    deleted: Vec<ProxySubscription>,
}

/// Applies inbound messages from neighbours.
pub struct NeighbourListener {
    handler: Arc<ProxyHandler>,
    access: Arc<dyn AccessChecker>,
}

impl NeighbourListener {
    /// Create a listener feeding `handler`.
    pub fn new(handler: Arc<ProxyHandler>, access: Arc<dyn AccessChecker>) -> Self {
        Self { handler, access }
    }

    /// Apply one inbound message.
    ///
    /// A full-state message from an unknown engine links it as a new
    /// neighbour; incremental messages from unknown engines are ignored.
    /// Messages from a known neighbour naming a bus other than its link's
    /// are dropped.
    /// After a REQUEST commits, a REPLY with this engine's full state is sent
    /// back. The message may be acknowledged once this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotStarted`] while the handler is stopped, or
    /// the error that made the transaction roll back.
    pub fn on_message(&self, message: &SubscriptionMessage) -> Result<(), ProxyError> {
        if !self.handler.is_started() {
            return Err(ProxyError::NotStarted);
        }
        let engine_id = self.handler.config().engine_id;
        if message.sender == engine_id {
            tracing::debug!(bus = %message.bus, "Ignoring own message");
            return Ok(());
        }

        let neighbour = match self.handler.registry().neighbour(message.sender) {
            Some(neighbour) => neighbour,
            None if message.message_type.is_full_state() => {
                tracing::info!(
                    neighbour = %message.sender,
                    bus = %message.bus,
                    message_type = ?message.message_type,
                    "Full state from unknown engine, linking"
                );
                self.handler.adopt_neighbour(
                    message.sender,
                    &message.bus,
                    message.message_type != MessageType::Request,
                )?
            }
            None => {
                tracing::debug!(
                    neighbour = %message.sender,
                    message_type = ?message.message_type,
                    "Ignoring update from unknown engine"
                );
                return Ok(());
            }
        };

        if message.bus != neighbour.bus() {
            tracing::warn!(
                neighbour = %neighbour.id(),
                bus = %neighbour.bus(),
                message_bus = %message.bus,
                message_type = ?message.message_type,
                "Message bus does not match the neighbour's link, dropped"
            );
            return Ok(());
        }

        let _guard = self.handler.lock().lock();
        let mut txn = Transaction::new();
        let mut applied = Applied::default();

        let outcome = match self.dispatch(&neighbour, message, &mut txn, &mut applied) {
            Ok(()) => txn.commit(self.handler.store()).map_err(ProxyError::from),
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        };

        if let Err(err) = outcome {
            tracing::warn!(
                neighbour = %neighbour.id(),
                message_type = ?message.message_type,
                error = %err,
                "Inbound message rolled back"
            );
            self.compensate(&neighbour, &applied);
            return Err(err);
        }

        tracing::debug!(
            neighbour = %neighbour.id(),
            message_type = ?message.message_type,
            entries = message.entries.len(),
            created = applied.created.len(),
            deleted = applied.deleted.len(),
            "Applied inbound message"
        );

        if message.message_type == MessageType::Request {
            self.reply(&neighbour);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        neighbour: &Arc<Neighbour>,
        message: &SubscriptionMessage,
        txn: &mut Transaction,
        applied: &mut Applied,
    ) -> Result<(), ProxyError> {
        match message.message_type {
            MessageType::Create => {
                let created = self.register(neighbour, message, txn)?;
                self.forward_created(neighbour, created, applied)
            }
            MessageType::Delete => {
                let deleted = self.deregister(neighbour, message, txn)?;
                self.forward_deleted(neighbour, deleted, applied)
            }
            MessageType::Reset | MessageType::Request | MessageType::Reply => {
                neighbour.set_requested_proxy_subscriptions_responded();
                neighbour.mark_all_proxies();
                let created = self.register(neighbour, message, txn)?;

                let registry = self.handler.registry();
                let mut deleted = Vec::new();
                for record in neighbour.sweep_marked_proxies(txn) {
                    if registry.delete_proxy(neighbour.id(), &record, txn)? {
                        deleted.push(record);
                    }
                }

                self.forward_created(neighbour, created, applied)?;
                self.forward_deleted(neighbour, deleted, applied)
            }
        }
    }

    fn forward_created(
        &self,
        neighbour: &Neighbour,
        created: Vec<ProxySubscription>,
        applied: &mut Applied,
    ) -> Result<(), ProxyError> {
        self.handler
            .forward(&created, neighbour.bus(), MessageType::Create, true)?;
        applied.created.extend(created);
        Ok(())
    }

    fn forward_deleted(
        &self,
        neighbour: &Neighbour,
        deleted: Vec<ProxySubscription>,
        applied: &mut Applied,
    ) -> Result<(), ProxyError> {
        self.handler
            .forward(&deleted, neighbour.bus(), MessageType::Delete, true)?;
        applied.deleted.extend(deleted);
        Ok(())
    }

    /// Register every entry; returns the newly bound records.
    fn register(
        &self,
        neighbour: &Neighbour,
        message: &SubscriptionMessage,
        txn: &mut Transaction,
    ) -> Result<Vec<ProxySubscription>, ProxyError> {
        let registry = self.handler.registry();
        let mut created = Vec::new();
        for entry in &message.entries {
            let Some(candidate) = self.resolve(neighbour, entry, true) else {
                continue;
            };
            if let Some(record) = neighbour.proxy_registered(&candidate, txn) {
                if registry.create_proxy(neighbour.id(), &record, txn)? {
                    created.push(record);
                }
            }
        }
        Ok(created)
    }

    /// Deregister every entry; returns the records whose binding was removed.
    fn deregister(
        &self,
        neighbour: &Neighbour,
        message: &SubscriptionMessage,
        txn: &mut Transaction,
    ) -> Result<Vec<ProxySubscription>, ProxyError> {
        let registry = self.handler.registry();
        let mut deleted = Vec::new();
        for entry in &message.entries {
            let Some(candidate) = self.resolve(neighbour, entry, false) else {
                continue;
            };
            if let Some(record) = neighbour.proxy_deregistered(candidate.key(), txn) {
                if registry.delete_proxy(neighbour.id(), &record, txn)? {
                    deleted.push(record);
                }
            }
        }
        Ok(deleted)
    }

    /// Turn an entry into a record keyed on this engine's topic spaces.
    ///
    /// The neighbour's configured bus decides how an entry is treated.
    /// Home-bus entries share topic space identifiers. Foreign-bus entries
    /// are resolved by name; unresolvable ones are skipped until a later
    /// full state reconciles them. On a secured link, entries made under a
    /// user principal are access checked when `check` is set.
    fn resolve(
        &self,
        neighbour: &Neighbour,
        entry: &TopicEntry,
        check: bool,
    ) -> Option<ProxySubscription> {
        let config = self.handler.config();
        let bus = neighbour.bus();
        if !config.is_foreign(bus) {
            return Some(ProxySubscription::new(entry.key(), entry.topic_space_name.clone()));
        }

        let local_name = entry
            .foreign_topic_space_name
            .as_deref()
            .unwrap_or(&entry.topic_space_name);
        let Some(topic_space) = self.handler.registry().match_space().topic_space_by_name(local_name) else {
            tracing::warn!(
                neighbour = %neighbour.id(),
                bus,
                topic_space = local_name,
                topic = %entry.topic,
                "Foreign subscription on unknown topic space skipped"
            );
            return None;
        };

        let secured = config.is_secured(bus);
        if check && secured {
            if let Principal::User(user) = &entry.principal {
                if !self
                    .access
                    .check_access(local_name, &entry.topic, user, AccessOperation::Receive)
                {
                    tracing::warn!(
                        target: "proxysync::audit",
                        neighbour = %neighbour.id(),
                        bus,
                        topic_space = local_name,
                        topic = %entry.topic,
                        principal = %user,
                        "Proxy subscription denied"
                    );
                    return None;
                }
            }
        }

        Some(
            ProxySubscription::new(SubscriptionKey::new(topic_space, entry.topic.clone()), local_name)
                .with_foreign_name(Some(entry.topic_space_name.clone()))
                .with_security(secured, entry.principal.clone()),
        )
    }

    /// Undo forwarded table changes without advertising the reversal.
    fn compensate(&self, neighbour: &Neighbour, applied: &Applied) {
        let bus = neighbour.bus();
        if let Err(err) = self
            .handler
            .forward(&applied.created, bus, MessageType::Delete, false)
            .and_then(|()| {
                self.handler
                    .forward(&applied.deleted, bus, MessageType::Create, false)
            })
        {
            tracing::error!(neighbour = %neighbour.id(), error = %err, "Compensation failed");
        }
    }

    fn reply(&self, neighbour: &Neighbour) {
        let Some(group) = self.handler.registry().bus_group(neighbour.bus()) else {
            return;
        };
        let reply = group.generate_reply_subscription_message(self.handler.config().engine_id);
        tracing::debug!(neighbour = %neighbour.id(), entries = reply.entries.len(), "Replying with full state");
        neighbour.send_full_state(reply);
    }
}

impl fmt::Debug for NeighbourListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeighbourListener")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::config::{ForeignBusConfig, ProxyConfig};
    use crate::matchspace::{InMemoryMatchSpace, MatchSpace};
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;
    use std::collections::HashMap;
    use tokio::runtime::Handle;
    use uuid::Uuid;

    struct Fixture {
        match_space: Arc<InMemoryMatchSpace>,
        transport: Arc<MemoryTransport>,
        handler: Arc<ProxyHandler>,
        listener: NeighbourListener,
        topic_space: Uuid,
    }

    fn fixture(config: ProxyConfig, access: Arc<dyn AccessChecker>) -> Fixture {
        let match_space = Arc::new(InMemoryMatchSpace::new());
        let transport = Arc::new(MemoryTransport::new());
        let topic_space = Uuid::new_v4();
        match_space.create_topic_space(topic_space, "prices");
        let handler = Arc::new(ProxyHandler::new(
            config,
            match_space.clone(),
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Handle::current(),
        ));
        handler.start();
        let listener = NeighbourListener::new(Arc::clone(&handler), access);
        Fixture {
            match_space,
            transport,
            handler,
            listener,
            topic_space,
        }
    }

    fn message(kind: MessageType, sender: Uuid, bus: &str, ts: Uuid, topics: &[&str]) -> SubscriptionMessage {
        let mut message = SubscriptionMessage::new(kind, sender, bus);
        message.entries = topics
            .iter()
            .map(|topic| TopicEntry {
                topic: (*topic).to_string(),
                topic_space: ts,
                topic_space_name: "prices".to_string(),
                foreign_topic_space_name: None,
                principal: Principal::SystemDefault,
            })
            .collect();
        message
    }

    #[tokio::test]
    async fn stopped_handler_rejects_messages() {
        let f = fixture(ProxyConfig::new(Uuid::new_v4(), "home"), Arc::new(AllowAll));
        f.handler.stop();

        let inbound = message(MessageType::Create, Uuid::new_v4(), "home", f.topic_space, &["t"]);
        assert!(matches!(f.listener.on_message(&inbound), Err(ProxyError::NotStarted)));
    }

    #[tokio::test]
    async fn unknown_sender_create_is_ignored() {
        let f = fixture(ProxyConfig::new(Uuid::new_v4(), "home"), Arc::new(AllowAll));
        let sender = Uuid::new_v4();

        let inbound = message(MessageType::Create, sender, "home", f.topic_space, &["t"]);
        f.listener.on_message(&inbound).unwrap();

        assert!(f.handler.registry().neighbour(sender).is_none());
    }

    #[tokio::test]
    async fn request_from_unknown_sender_links_and_replies() {
        let f = fixture(ProxyConfig::new(Uuid::new_v4(), "home"), Arc::new(AllowAll));
        let sender = Uuid::new_v4();

        let inbound = message(MessageType::Request, sender, "home", f.topic_space, &["t"]);
        f.listener.on_message(&inbound).unwrap();

        let neighbour = f.handler.registry().neighbour(sender).unwrap();
        assert_eq!(neighbour.subscription_count(), 1);
        let sent = f.transport.drain_for(sender);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Reply);
        assert_eq!(f.match_space.bound_topics(f.topic_space, sender), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let engine = Uuid::new_v4();
        let f = fixture(ProxyConfig::new(engine, "home"), Arc::new(AllowAll));

        let inbound = message(MessageType::Reset, engine, "home", f.topic_space, &["t"]);
        f.listener.on_message(&inbound).unwrap();

        assert!(f.handler.registry().neighbours().is_empty());
    }

    fn secured_config() -> ProxyConfig {
        let mut config = ProxyConfig::new(Uuid::new_v4(), "home");
        config.foreign_buses.insert(
            "partner".to_string(),
            ForeignBusConfig {
                secured: true,
                topic_space_mappings: HashMap::new(),
            },
        );
        config
    }

    #[tokio::test]
    async fn denied_foreign_entry_is_skipped() {
        let access: Arc<dyn AccessChecker> =
            Arc::new(|_: &str, topic: &str, _: &str, _: AccessOperation| topic != "secret");
        let f = fixture(secured_config(), access);
        let peer = Uuid::new_v4();
        f.handler.create_neighbour(peer, "partner").unwrap();

        let mut inbound = message(MessageType::Create, peer, "partner", Uuid::new_v4(), &["open", "secret"]);
        for entry in &mut inbound.entries {
            entry.principal = Principal::User("mallory".to_string());
        }
        f.listener.on_message(&inbound).unwrap();

        let neighbour = f.handler.registry().neighbour(peer).unwrap();
        let topics: Vec<String> = neighbour.subscription_keys().into_iter().map(|key| key.topic).collect();
        assert_eq!(topics, vec!["open"]);
        let record = neighbour
            .subscription(&SubscriptionKey::new(f.topic_space, "open"))
            .unwrap();
        assert!(record.is_foreign_secured());
        assert_eq!(record.foreign_topic_space_name(), Some("prices"));
    }

    #[tokio::test]
    async fn message_claiming_another_bus_is_dropped() {
        let access: Arc<dyn AccessChecker> = Arc::new(|_: &str, _: &str, _: &str, _: AccessOperation| false);
        let f = fixture(secured_config(), access);
        let peer = Uuid::new_v4();
        let home_peer = Uuid::new_v4();
        f.handler.create_neighbour(peer, "partner").unwrap();
        f.handler.create_neighbour(home_peer, "home").unwrap();
        f.transport.drain();

        let mut inbound = message(MessageType::Create, peer, "home", f.topic_space, &["secret"]);
        inbound.entries[0].principal = Principal::User("mallory".to_string());
        f.listener.on_message(&inbound).unwrap();

        assert_eq!(f.handler.registry().neighbour(peer).unwrap().subscription_count(), 0);
        assert!(f.match_space.bound_topics(f.topic_space, peer).is_empty());
        assert!(f.transport.drain().is_empty());

        inbound.bus = "partner".to_string();
        f.listener.on_message(&inbound).unwrap();
        assert_eq!(f.handler.registry().neighbour(peer).unwrap().subscription_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_foreign_topic_space_is_skipped() {
        let f = fixture(secured_config(), Arc::new(AllowAll));
        let peer = Uuid::new_v4();
        f.handler.create_neighbour(peer, "partner").unwrap();

        let mut inbound = message(MessageType::Create, peer, "partner", Uuid::new_v4(), &["t"]);
        inbound.entries[0].topic_space_name = "unknown".to_string();
        f.listener.on_message(&inbound).unwrap();

        assert_eq!(f.handler.registry().neighbour(peer).unwrap().subscription_count(), 0);
        assert!(f.match_space.topic_space_by_name("unknown").is_none());
    }
}
