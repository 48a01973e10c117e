//! MQTT topic scheme for proxy subscription traffic.
//!
//! Topic structure: `proxysync/v1/{tenant}/{engine_id}/{kind}`
//!
//! Every engine subscribes to its own inbox; a neighbour's channel is a
//! publish to that neighbour's inbox.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "proxysync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme with the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "proxysync".to_string(),
        }
    }

    fn base(&self, engine: Uuid) -> String {
        format!("{}/{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant, engine)
    }

    /// Topic an engine receives protocol messages on.
    #[must_use]
    pub fn inbox(&self, engine: Uuid) -> String {
        format!("{}/inbox", self.base(engine))
    }

    /// Topic an engine publishes its status snapshot on.
    #[must_use]
    pub fn status(&self, engine: Uuid) -> String {
        format!("{}/status", self.base(engine))
    }

    /// Wildcard subscription for every status topic in the tenant.
    #[must_use]
    pub fn status_wildcard(&self) -> String {
        format!("{}/{}/{}/+/status", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Parse a topic into `(engine_id, kind)`.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(Uuid, TopicKind)> {
        let expected_prefix = format!("{}/{}/{}/", self.prefix, PROTOCOL_VERSION, self.tenant);
        let remainder = topic.strip_prefix(&expected_prefix)?;
        let (engine, kind) = remainder.split_once('/')?;

        let engine = Uuid::parse_str(engine).ok()?;
        let kind = match kind {
            "inbox" => TopicKind::Inbox,
            "status" => TopicKind::Status,
            _ => return None,
        };
        Some((engine, kind))
    }
}

/// Kinds of per-engine topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Inbound protocol messages
    Inbox,
    /// Status snapshots
    Status,
}
