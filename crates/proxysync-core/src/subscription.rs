//! Proxy subscription records.
//!
//! A [`ProxySubscription`] is one (topic space, topic) interest. Neighbours
//! hold one record per interest their peer advertised; bus groups hold
//! records counting how many local consumers or remote sources share an
//! interest.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies an interest: a topic within a topic space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Topic space identifier
    pub topic_space: Uuid,
    /// Topic string (may contain wildcards understood by the match space)
    pub topic: String,
}

impl SubscriptionKey {
    /// Create a new key.
    #[must_use]
    pub fn new(topic_space: Uuid, topic: impl Into<String>) -> Self {
        Self {
            topic_space,
            topic: topic.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_space, self.topic)
    }
}

/// Security principal carried with a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// Sentinel meaning no access check is required
    #[default]
    SystemDefault,
    /// A named user on the originating bus
    User(String),
}

impl Principal {
    /// Whether an access check has to be made for this principal.
    #[must_use]
    pub fn requires_check(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

/// A local consumer's subscription, as reported by the destination layer.
///
/// Every call to [`ProxyHandler::subscribe_event`](crate::ProxyHandler::subscribe_event)
/// represents one consumer; two consumers on the same key are two events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSubscription {
    /// Topic space and topic
    pub key: SubscriptionKey,
    /// Name of the topic space on this engine's bus
    pub topic_space_name: String,
    /// Principal of the consumer
    #[serde(default)]
    pub principal: Principal,
}

impl LocalSubscription {
    /// Create a local subscription without a principal.
    #[must_use]
    pub fn new(topic_space: Uuid, topic_space_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            key: SubscriptionKey::new(topic_space, topic),
            topic_space_name: topic_space_name.into(),
            principal: Principal::SystemDefault,
        }
    }
}

/// A reference-counted proxy subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySubscription {
    key: SubscriptionKey,
    topic_space_name: String,
    /// Name of the topic space on the peer's bus, when the peer is on a foreign bus
    foreign_topic_space_name: Option<String>,
    ref_count: u32,
    #[serde(skip)]
    marked: bool,
    foreign_secured: bool,
    principal: Principal,
}

impl ProxySubscription {
    /// Create a record with a zero reference count.
    #[must_use]
    pub fn new(key: SubscriptionKey, topic_space_name: impl Into<String>) -> Self {
        Self {
            key,
            topic_space_name: topic_space_name.into(),
            foreign_topic_space_name: None,
            ref_count: 0,
            marked: false,
            foreign_secured: false,
            principal: Principal::SystemDefault,
        }
    }

    /// Create a record describing a local consumer's interest.
    #[must_use]
    pub fn from_local(local: &LocalSubscription) -> Self {
        Self::new(local.key.clone(), local.topic_space_name.clone())
            .with_security(false, local.principal.clone())
    }

    /// Set the topic-space name used on the peer's bus.
    #[must_use]
    pub fn with_foreign_name(mut self, name: Option<String>) -> Self {
        self.foreign_topic_space_name = name;
        self
    }

    /// Set the cross-bus security attributes.
    #[must_use]
    pub fn with_security(mut self, foreign_secured: bool, principal: Principal) -> Self {
        self.foreign_secured = foreign_secured;
        self.principal = principal;
        self
    }

    /// Restore a persisted reference count.
    #[must_use]
    pub fn with_ref_count(mut self, ref_count: u32) -> Self {
        self.ref_count = ref_count;
        self
    }

    /// The (topic space, topic) key.
    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Topic space identifier.
    #[must_use]
    pub fn topic_space(&self) -> Uuid {
        self.key.topic_space
    }

    /// Topic string.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.key.topic
    }

    /// Topic space name on this engine's bus.
    #[must_use]
    pub fn topic_space_name(&self) -> &str {
        &self.topic_space_name
    }

    /// Topic space name on the peer's bus, if it differs.
    #[must_use]
    pub fn foreign_topic_space_name(&self) -> Option<&str> {
        self.foreign_topic_space_name.as_deref()
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the record was learned from a secured foreign bus.
    #[must_use]
    pub fn is_foreign_secured(&self) -> bool {
        self.foreign_secured
    }

    /// Principal the subscription was made under.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Increment the reference count.
    ///
    /// Returns `true` on the 0→1 transition, i.e. when the interest has to
    /// be advertised.
    pub fn increment(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_add(1);
        self.ref_count == 1
    }

    /// Decrement the reference count.
    ///
    /// Returns `true` on the 1→0 transition. Decrementing a zero count is a
    /// no-op returning `false`.
    pub fn decrement(&mut self) -> bool {
        if self.ref_count == 0 {
            return false;
        }
        self.ref_count -= 1;
        self.ref_count == 0
    }

    /// Mark the record ahead of a full-state sweep.
    pub fn mark(&mut self) {
        self.marked = true;
    }

    /// Clear the mark; the record was re-confirmed.
    pub fn unmark(&mut self) {
        self.marked = false;
    }

    /// Whether the record is still marked.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Replace the security attributes and the foreign name.
    ///
    /// Returns `true` if anything changed and the record needs re-persisting.
    pub fn update_attributes(&mut self, other: &ProxySubscription) -> bool {
        let changed = self.foreign_secured != other.foreign_secured
            || self.principal != other.principal
            || self.foreign_topic_space_name != other.foreign_topic_space_name;
        if changed {
            self.foreign_secured = other.foreign_secured;
            self.principal = other.principal.clone();
            self.foreign_topic_space_name = other.foreign_topic_space_name.clone();
        }
        changed
    }
}
