//! Protocol configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// How long a neighbour has to answer a REQUEST before the topology is
/// reported as inconsistent.
pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration of the proxy handler on one engine.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// This engine's identifier
    pub engine_id: Uuid,

    /// The bus this engine is a member of; every other bus is foreign
    pub home_bus: String,

    /// Resync reply timeout (also the retry delay for failed full-state sends)
    pub resync_timeout: Duration,

    /// Settings of links to foreign buses, keyed by bus name
    pub foreign_buses: HashMap<String, ForeignBusConfig>,
}

/// Settings of a link to a foreign bus.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForeignBusConfig {
    /// Whether subscriptions arriving over the link are access checked
    #[serde(default)]
    pub secured: bool,

    /// Topic space name on this bus → name on the foreign bus
    #[serde(default)]
    pub topic_space_mappings: HashMap<String, String>,
}

impl ProxyConfig {
    /// Create a configuration with default timeouts and no foreign buses.
    #[must_use]
    pub fn new(engine_id: Uuid, home_bus: impl Into<String>) -> Self {
        Self {
            engine_id,
            home_bus: home_bus.into(),
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            foreign_buses: HashMap::new(),
        }
    }

    /// Whether `bus` is reached over a link from another bus.
    #[must_use]
    pub fn is_foreign(&self, bus: &str) -> bool {
        bus != self.home_bus
    }

    /// Settings for a foreign bus, if any were configured.
    #[must_use]
    pub fn foreign_bus(&self, bus: &str) -> Option<&ForeignBusConfig> {
        self.foreign_buses.get(bus)
    }

    /// Whether subscriptions arriving from `bus` must be access checked.
    #[must_use]
    pub fn is_secured(&self, bus: &str) -> bool {
        self.is_foreign(bus) && self.foreign_bus(bus).is_some_and(|link| link.secured)
    }

    /// Name under which a local topic space is known on `bus`.
    ///
    /// `None` for the home bus. Unmapped names are used unchanged.
    #[must_use]
    pub fn foreign_topic_space_name(&self, bus: &str, local_name: &str) -> Option<String> {
        if !self.is_foreign(bus) {
            return None;
        }
        let mapped = self
            .foreign_bus(bus)
            .and_then(|link| link.topic_space_mappings.get(local_name))
            .map_or(local_name, String::as_str);
        Some(mapped.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_bus_is_not_foreign() {
        let config = ProxyConfig::new(Uuid::new_v4(), "home");

        assert!(!config.is_foreign("home"));
        assert!(config.is_foreign("partner"));
        assert_eq!(config.foreign_topic_space_name("home", "prices"), None);
    }

    #[test]
    fn foreign_names_use_mapping_or_identity() {
        let mut config = ProxyConfig::new(Uuid::new_v4(), "home");
        config.foreign_buses.insert(
            "partner".to_string(),
            ForeignBusConfig {
                secured: true,
                topic_space_mappings: HashMap::from([(
                    "prices".to_string(),
                    "partner.prices".to_string(),
                )]),
            },
        );

        assert_eq!(
            config.foreign_topic_space_name("partner", "prices").as_deref(),
            Some("partner.prices")
        );
        assert_eq!(
            config.foreign_topic_space_name("other", "prices").as_deref(),
            Some("prices")
        );
        assert!(config.is_secured("partner"));
        assert!(!config.is_secured("other"));
    }
}
