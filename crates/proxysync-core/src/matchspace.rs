//! Destination and match-space collaborator.
//!
//! Publications on a topic space are routed to neighbours through an output
//! binding per (topic space, neighbour); each bound proxy subscription adds
//! its topic to that binding. Topic matching itself is out of scope here.

use crate::error::MatchError;
use crate::subscription::{LocalSubscription, Principal, ProxySubscription, SubscriptionKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Routing structure the registry binds proxy subscriptions into.
pub trait MatchSpace: Send + Sync {
    /// Name of a topic space, or `None` if it does not exist.
    fn topic_space_name(&self, topic_space: Uuid) -> Option<String>;

    /// Identifier of the topic space with the given name.
    fn topic_space_by_name(&self, name: &str) -> Option<Uuid>;

    /// Create the output binding routing `topic_space` to `neighbour`.
    ///
    /// # Errors
    ///
    /// Returns error if the topic space does not exist.
    fn create_output_binding(&self, topic_space: Uuid, neighbour: Uuid) -> Result<(), MatchError>;

    /// Whether an output binding exists.
    fn has_output_binding(&self, topic_space: Uuid, neighbour: Uuid) -> bool;

    /// Remove an output binding and every topic bound through it. Idempotent.
    fn delete_output_binding(&self, topic_space: Uuid, neighbour: Uuid);

    /// Add a proxy subscription's topic to the neighbour's output binding.
    ///
    /// # Errors
    ///
    /// Returns error if the topic space or the binding does not exist.
    fn bind_proxy(&self, neighbour: Uuid, subscription: &ProxySubscription) -> Result<(), MatchError>;

    /// Remove a topic from the neighbour's output binding.
    ///
    /// # Errors
    ///
    /// Returns error if the topic space or the binding does not exist.
    fn unbind_proxy(&self, neighbour: Uuid, key: &SubscriptionKey) -> Result<(), MatchError>;

    /// Topics bound for a neighbour on a topic space.
    fn bound_topics(&self, topic_space: Uuid, neighbour: Uuid) -> Vec<String>;

    /// Every local consumer subscription, one entry per consumer.
    fn local_subscriptions(&self) -> Vec<LocalSubscription>;

    /// Whether at least one local consumer is registered on `key`.
    fn has_local_subscription(&self, key: &SubscriptionKey) -> bool {
        self.local_subscriptions()
            .iter()
            .any(|local| &local.key == key)
    }
}

/// Security attributes a topic was bound with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    /// Whether publications must be access checked before delivery
    pub secured: bool,
    /// Principal checked against
    pub principal: Principal,
}

#[derive(Debug, Default)]
struct TopicSpace {
    name: String,
    bindings: HashMap<Uuid, BTreeMap<String, ProxyBinding>>,
    local: Vec<LocalSubscription>,
}

/// In-memory match space.
#[derive(Debug, Default)]
pub struct InMemoryMatchSpace {
    spaces: RwLock<HashMap<Uuid, TopicSpace>>,
}

impl InMemoryMatchSpace {
    /// Create an empty match space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic space. Returns `false` if it already existed.
    pub fn create_topic_space(&self, id: Uuid, name: impl Into<String>) -> bool {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return false;
        }
        spaces.insert(
            id,
            TopicSpace {
                name: name.into(),
                ..TopicSpace::default()
            },
        );
        true
    }

    /// Delete a topic space with its bindings and local subscriptions.
    pub fn delete_topic_space(&self, id: Uuid) -> bool {
        self.spaces.write().remove(&id).is_some()
    }

    /// Register a local consumer.
    ///
    /// # Errors
    ///
    /// Returns error if the topic space does not exist.
    pub fn add_local_subscription(&self, subscription: LocalSubscription) -> Result<(), MatchError> {
        let topic_space = subscription.key.topic_space;
        self.spaces
            .write()
            .get_mut(&topic_space)
            .ok_or(MatchError::UnknownTopicSpace(topic_space))?
            .local
            .push(subscription);
        Ok(())
    }

    /// Remove one local consumer. Returns `false` if none matched.
    pub fn remove_local_subscription(&self, subscription: &LocalSubscription) -> bool {
        let mut spaces = self.spaces.write();
        let Some(space) = spaces.get_mut(&subscription.key.topic_space) else {
            return false;
        };
        match space.local.iter().position(|local| local == subscription) {
            Some(index) => {
                space.local.remove(index);
                true
            }
            None => false,
        }
    }

    /// Security attributes a topic is bound with for a neighbour.
    #[must_use]
    pub fn binding(&self, key: &SubscriptionKey, neighbour: Uuid) -> Option<ProxyBinding> {
        self.spaces
            .read()
            .get(&key.topic_space)?
            .bindings
            .get(&neighbour)?
            .get(&key.topic)
            .cloned()
    }
}

impl MatchSpace for InMemoryMatchSpace {
    fn topic_space_name(&self, topic_space: Uuid) -> Option<String> {
        self.spaces.read().get(&topic_space).map(|space| space.name.clone())
    }

    fn topic_space_by_name(&self, name: &str) -> Option<Uuid> {
        self.spaces
            .read()
            .iter()
            .find(|(_, space)| space.name == name)
            .map(|(id, _)| *id)
    }

    fn create_output_binding(&self, topic_space: Uuid, neighbour: Uuid) -> Result<(), MatchError> {
        self.spaces
            .write()
            .get_mut(&topic_space)
            .ok_or(MatchError::UnknownTopicSpace(topic_space))?
            .bindings
            .entry(neighbour)
            .or_default();
        Ok(())
    }

    fn has_output_binding(&self, topic_space: Uuid, neighbour: Uuid) -> bool {
        self.spaces
            .read()
            .get(&topic_space)
            .is_some_and(|space| space.bindings.contains_key(&neighbour))
    }

    fn delete_output_binding(&self, topic_space: Uuid, neighbour: Uuid) {
        if let Some(space) = self.spaces.write().get_mut(&topic_space) {
            space.bindings.remove(&neighbour);
        }
    }

    fn bind_proxy(&self, neighbour: Uuid, subscription: &ProxySubscription) -> Result<(), MatchError> {
        let topic_space = subscription.topic_space();
        let mut spaces = self.spaces.write();
        let binding = spaces
            .get_mut(&topic_space)
            .ok_or(MatchError::UnknownTopicSpace(topic_space))?
            .bindings
            .get_mut(&neighbour)
            .ok_or(MatchError::NoBinding {
                topic_space,
                neighbour,
            })?;
        binding.insert(
            subscription.topic().to_string(),
            ProxyBinding {
                secured: subscription.is_foreign_secured(),
                principal: subscription.principal().clone(),
            },
        );
        Ok(())
    }

    fn unbind_proxy(&self, neighbour: Uuid, key: &SubscriptionKey) -> Result<(), MatchError> {
        let mut spaces = self.spaces.write();
        let binding = spaces
            .get_mut(&key.topic_space)
            .ok_or(MatchError::UnknownTopicSpace(key.topic_space))?
            .bindings
            .get_mut(&neighbour)
            .ok_or(MatchError::NoBinding {
                topic_space: key.topic_space,
                neighbour,
            })?;
        binding.remove(&key.topic);
        Ok(())
    }

    fn bound_topics(&self, topic_space: Uuid, neighbour: Uuid) -> Vec<String> {
        self.spaces
            .read()
            .get(&topic_space)
            .and_then(|space| space.bindings.get(&neighbour))
            .map(|binding| binding.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn local_subscriptions(&self) -> Vec<LocalSubscription> {
        self.spaces
            .read()
            .values()
            .flat_map(|space| space.local.iter().cloned())
            .collect()
    }
}
