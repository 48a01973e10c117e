//! Protocol messages exchanged between neighbours.
//!
//! The wire encoding lives in `proxysync-proto`; this module only defines
//! the logical shape and the builder that batches subscription changes.

use crate::subscription::{Principal, ProxySubscription, SubscriptionKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Incremental: interests the sender gained
    Create,
    /// Incremental: interests the sender lost
    Delete,
    /// Unsolicited full state
    Reset,
    /// Full state plus a request for the receiver's full state
    Request,
    /// Full state sent in answer to a request
    Reply,
}

impl MessageType {
    /// Whether the message carries the sender's complete state.
    #[must_use]
    pub fn is_full_state(self) -> bool {
        matches!(self, Self::Reset | Self::Request | Self::Reply)
    }
}

/// One advertised interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntry {
    /// Topic string
    pub topic: String,
    /// Topic space identifier on the sender's bus
    pub topic_space: Uuid,
    /// Topic space name on the sender's bus
    pub topic_space_name: String,
    /// Topic space name on the receiver's bus, for cross-bus links
    pub foreign_topic_space_name: Option<String>,
    /// Principal the interest is held under
    pub principal: Principal,
}

impl TopicEntry {
    /// Build an entry from a record, with an optional foreign name.
    #[must_use]
    pub fn from_subscription(sub: &ProxySubscription, foreign_topic_space_name: Option<String>) -> Self {
        Self {
            topic: sub.topic().to_string(),
            topic_space: sub.topic_space(),
            topic_space_name: sub.topic_space_name().to_string(),
            foreign_topic_space_name,
            principal: sub.principal().clone(),
        }
    }

    /// Key of the entry as seen on the sender's bus.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.topic_space, self.topic.clone())
    }
}

/// A proxy subscription protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message kind
    pub message_type: MessageType,
    /// Engine that sent the message
    pub sender: Uuid,
    /// Bus the message travels on
    pub bus: String,
    /// Advertised interests
    pub entries: Vec<TopicEntry>,
}

impl SubscriptionMessage {
    /// Create an empty message.
    #[must_use]
    pub fn new(message_type: MessageType, sender: Uuid, bus: impl Into<String>) -> Self {
        Self {
            message_type,
            sender,
            bus: bus.into(),
            entries: Vec::new(),
        }
    }

    /// Whether the message has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Topics carried by the message, in order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.topic.as_str())
    }
}

/// Batches incremental changes into one message per bus.
///
/// [`begin`](Self::begin) starts a batch; the message itself is only
/// created by the first [`push`](Self::push), so a batch with no changes
/// yields nothing from [`take`](Self::take).
#[derive(Debug)]
pub struct MessageBuilder {
    sender: Uuid,
    message_type: MessageType,
    bus: String,
    message: Option<SubscriptionMessage>,
}

impl MessageBuilder {
    /// Create a builder for messages sent by `sender`.
    #[must_use]
    pub fn new(sender: Uuid) -> Self {
        Self {
            sender,
            message_type: MessageType::Create,
            bus: String::new(),
            message: None,
        }
    }

    /// Start a new batch, discarding anything not yet taken.
    pub fn begin(&mut self, message_type: MessageType, bus: &str) {
        self.message_type = message_type;
        self.bus.clear();
        self.bus.push_str(bus);
        self.message = None;
    }

    /// Append an entry to the current batch.
    pub fn push(&mut self, entry: TopicEntry) {
        self.message
            .get_or_insert_with(|| SubscriptionMessage::new(self.message_type, self.sender, self.bus.clone()))
            .entries
            .push(entry);
    }

    /// Finish the batch.
    ///
    /// Returns `None` if nothing was pushed since [`begin`](Self::begin).
    pub fn take(&mut self) -> Option<SubscriptionMessage> {
        self.message.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(topic: &str) -> TopicEntry {
        let sub = ProxySubscription::new(SubscriptionKey::new(Uuid::new_v4(), topic), "space");
        TopicEntry::from_subscription(&sub, None)
    }

    #[test]
    fn builder_yields_nothing_without_changes() {
        let mut builder = MessageBuilder::new(Uuid::new_v4());
        builder.begin(MessageType::Create, "bus-a");

        assert!(builder.take().is_none());
    }

    #[test]
    fn builder_batches_entries_per_bus() {
        let sender = Uuid::new_v4();
        let mut builder = MessageBuilder::new(sender);

        builder.begin(MessageType::Create, "bus-a");
        builder.push(entry("t1"));
        builder.push(entry("t2"));
        let first = builder.take().unwrap();

        builder.begin(MessageType::Delete, "bus-b");
        builder.push(entry("t3"));
        let second = builder.take().unwrap();

        assert_eq!(first.message_type, MessageType::Create);
        assert_eq!(first.bus, "bus-a");
        assert_eq!(first.sender, sender);
        assert_eq!(first.topics().collect::<Vec<_>>(), vec!["t1", "t2"]);

        assert_eq!(second.message_type, MessageType::Delete);
        assert_eq!(second.bus, "bus-b");
        assert_eq!(second.topics().collect::<Vec<_>>(), vec!["t3"]);
    }

    #[test]
    fn begin_discards_untaken_batch() {
        let mut builder = MessageBuilder::new(Uuid::new_v4());
        builder.begin(MessageType::Create, "bus-a");
        builder.push(entry("t1"));

        builder.begin(MessageType::Create, "bus-b");

        assert!(builder.take().is_none());
    }

    #[test]
    fn full_state_types() {
        assert!(MessageType::Reset.is_full_state());
        assert!(MessageType::Request.is_full_state());
        assert!(MessageType::Reply.is_full_state());
        assert!(!MessageType::Create.is_full_state());
        assert!(!MessageType::Delete.is_full_state());
    }
}
