//! Agent configuration.

use anyhow::{Context, Result};
use proxysync_core::{ForeignBusConfig, ProxyConfig, DEFAULT_RESYNC_TIMEOUT};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Engine unique identifier
    pub engine_id: Option<Uuid>,

    /// Bus this engine is a member of
    pub bus: String,

    /// How long a neighbour has to answer a resync request
    pub resync_timeout: Duration,

    /// Replication configuration
    pub replication: ReplicationConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Links to peer engines
    pub neighbours: Vec<NeighbourConfig>,

    /// Topic spaces hosted by this engine
    pub topic_spaces: Vec<TopicSpaceConfig>,

    /// Local consumers to register at startup
    pub subscriptions: Vec<SubscriptionConfig>,

    /// Settings of links to foreign buses, keyed by bus name
    pub foreign_buses: HashMap<String, ForeignBusConfig>,

    /// Principals allowed to subscribe over secured links; `None` allows all
    pub allowed_principals: Option<HashSet<String>>,
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// MQTT broker URL carrying protocol traffic
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,

    /// How often the status snapshot is published
    pub status_interval: Duration,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

/// A configured link to a peer engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NeighbourConfig {
    /// Peer engine identifier
    pub id: Uuid,

    /// Bus the link belongs to
    pub bus: String,
}

/// A topic space hosted by this engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicSpaceConfig {
    /// Topic space identifier
    pub id: Uuid,

    /// Topic space name on this engine's bus
    pub name: String,
}

/// A local consumer registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionConfig {
    /// Name of a configured topic space
    pub topic_space: String,

    /// Topic, possibly with wildcards
    pub topic: String,

    /// Principal the consumer subscribes under
    #[serde(default)]
    pub principal: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine_id: None,
            bus: "default".to_string(),
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            replication: ReplicationConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
                status_interval: Duration::from_secs(30),
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./proxysync.db"),
            },
            neighbours: Vec::new(),
            topic_spaces: Vec::new(),
            subscriptions: Vec::new(),
            foreign_buses: HashMap::new(),
            allowed_principals: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PROXYSYNC_ENGINE_ID`: Engine UUID
    /// - `PROXYSYNC_BUS`: Bus name
    /// - `PROXYSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `PROXYSYNC_TENANT`: Tenant identifier
    /// - `PROXYSYNC_STORE_TYPE`: "sqlite" or "memory"
    /// - `PROXYSYNC_DB_PATH`: SQLite database path
    /// - `PROXYSYNC_RESYNC_TIMEOUT_SECS`: Resync reply timeout
    /// - `PROXYSYNC_STATUS_INTERVAL_SECS`: Status publish interval
    /// - `PROXYSYNC_NEIGHBOURS`: JSON list of `{id, bus}`
    /// - `PROXYSYNC_TOPIC_SPACES`: JSON list of `{id, name}`
    /// - `PROXYSYNC_SUBSCRIPTIONS`: JSON list of `{topic_space, topic, principal?}`
    /// - `PROXYSYNC_FOREIGN_BUSES`: JSON map of bus name to `{secured, topic_space_mappings}`
    /// - `PROXYSYNC_ALLOWED_PRINCIPALS`: JSON list of principal names
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("PROXYSYNC_ENGINE_ID") {
            config.engine_id = Some(Uuid::parse_str(&id).context("Invalid PROXYSYNC_ENGINE_ID")?);
        }

        if let Ok(bus) = std::env::var("PROXYSYNC_BUS") {
            config.bus = bus;
        }

        if let Ok(mqtt) = std::env::var("PROXYSYNC_MQTT_BROKER") {
            config.replication.mqtt_broker = mqtt;
        }

        if let Ok(tenant) = std::env::var("PROXYSYNC_TENANT") {
            config.replication.tenant = tenant;
        }

        if let Ok(store_type) = std::env::var("PROXYSYNC_STORE_TYPE") {
            config.persistence.store_type = store_type;
        }

        if let Ok(db_path) = std::env::var("PROXYSYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Ok(secs) = std::env::var("PROXYSYNC_RESYNC_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid PROXYSYNC_RESYNC_TIMEOUT_SECS")?;
            config.resync_timeout = Duration::from_secs(secs);
        }

        if let Ok(secs) = std::env::var("PROXYSYNC_STATUS_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid PROXYSYNC_STATUS_INTERVAL_SECS")?;
            config.replication.status_interval = Duration::from_secs(secs.max(1));
        }

        // Structured settings arrive as JSON
        if let Ok(json) = std::env::var("PROXYSYNC_NEIGHBOURS") {
            config.neighbours =
                serde_json::from_str(&json).context("Invalid PROXYSYNC_NEIGHBOURS JSON")?;
        }

        if let Ok(json) = std::env::var("PROXYSYNC_TOPIC_SPACES") {
            config.topic_spaces =
                serde_json::from_str(&json).context("Invalid PROXYSYNC_TOPIC_SPACES JSON")?;
        }

        if let Ok(json) = std::env::var("PROXYSYNC_SUBSCRIPTIONS") {
            config.subscriptions =
                serde_json::from_str(&json).context("Invalid PROXYSYNC_SUBSCRIPTIONS JSON")?;
        }

        if let Ok(json) = std::env::var("PROXYSYNC_FOREIGN_BUSES") {
            config.foreign_buses =
                serde_json::from_str(&json).context("Invalid PROXYSYNC_FOREIGN_BUSES JSON")?;
        }

        if let Ok(json) = std::env::var("PROXYSYNC_ALLOWED_PRINCIPALS") {
            config.allowed_principals = Some(
                serde_json::from_str(&json).context("Invalid PROXYSYNC_ALLOWED_PRINCIPALS JSON")?,
            );
        }

        Ok(config)
    }

    /// Protocol configuration for the proxy handler.
    #[must_use]
    pub fn proxy_config(&self, engine_id: Uuid) -> ProxyConfig {
        let mut proxy = ProxyConfig::new(engine_id, self.bus.clone());
        proxy.resync_timeout = self.resync_timeout;
        proxy.foreign_buses.clone_from(&self.foreign_buses);
        proxy
    }

    /// Find a configured topic space by name.
    #[must_use]
    pub fn topic_space(&self, name: &str) -> Option<&TopicSpaceConfig> {
        self.topic_spaces.iter().find(|space| space.name == name)
    }
}
