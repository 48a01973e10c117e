//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::persistence::SqliteStore;
use crate::transport::MqttTransport;
use anyhow::{Context, Result};
use proxysync_core::{
    AccessChecker, AccessOperation, AllowAll, InMemoryMatchSpace, LocalSubscription, MatchSpace,
    MemoryStore, NeighbourListener, Principal, ProxyHandler, SubscriptionStore, Transport,
};
use proxysync_proto::{ProxyEnvelope, TopicKind, TopicScheme};
use rumqttc::{Event, Packet, Publish};
use std::sync::Arc;
use uuid::Uuid;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    engine_id: Uuid,
    store: Arc<dyn SubscriptionStore>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig, engine_id: Uuid) -> Result<Self> {
        let store: Arc<dyn SubscriptionStore> = if config.persistence.store_type == "sqlite" {
            Arc::new(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            )
        } else {
            tracing::warn!(
                store_type = %config.persistence.store_type,
                "Using in-memory store; subscription state will not survive a restart"
            );
            Arc::new(MemoryStore::new())
        };

        Ok(Self {
            config,
            engine_id,
            store,
        })
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!(engine_id = %self.engine_id, bus = %self.config.bus, "Starting agent runtime");

        let topic_scheme = TopicScheme::new(&self.config.replication.tenant);

        let (transport, mut eventloop) = MqttTransport::connect(
            &self.config.replication.mqtt_broker,
            &format!("proxysync-{}", self.engine_id),
            topic_scheme.clone(),
        )
        .context("Failed to create MQTT transport")?;
        let transport = Arc::new(transport);

        let match_space = Arc::new(InMemoryMatchSpace::new());
        for space in &self.config.topic_spaces {
            match_space.create_topic_space(space.id, space.name.clone());
        }

        let handler = Arc::new(ProxyHandler::new(
            self.config.proxy_config(self.engine_id),
            Arc::clone(&match_space) as Arc<dyn MatchSpace>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&self.store),
            tokio::runtime::Handle::current(),
        ));
        let listener = NeighbourListener::new(Arc::clone(&handler), access_checker(&self.config));

        transport.subscribe_inbox(self.engine_id).await?;

        // Recovered links stay quiet until the configured ones are re-created
        handler.recover().context("Failed to recover subscription state")?;
        handler.start();
        for neighbour in &self.config.neighbours {
            handler
                .create_neighbour(neighbour.id, &neighbour.bus)
                .with_context(|| format!("Failed to create neighbour {}", neighbour.id))?;
        }
        handler
            .reconcile_complete()
            .context("Failed to complete reconciliation")?;

        for sub in &self.config.subscriptions {
            let space = self
                .config
                .topic_space(&sub.topic_space)
                .with_context(|| format!("Unknown topic space '{}'", sub.topic_space))?;
            let mut local = LocalSubscription::new(space.id, space.name.clone(), sub.topic.clone());
            if let Some(principal) = &sub.principal {
                local.principal = Principal::User(principal.clone());
            }
            match_space
                .add_local_subscription(local.clone())
                .context("Failed to register local subscription")?;
            handler
                .subscribe_event(&local)
                .context("Failed to advertise local subscription")?;
        }

        let mut status_ticker = tokio::time::interval(self.config.replication.status_interval);

        tracing::info!("Agent running, press Ctrl+C to stop");

        // Main event loop
        loop {
            tokio::select! {
                // Handle MQTT events
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tracing::debug!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received protocol message"
                            );
                            if handle_publish(&listener, &topic_scheme, self.engine_id, &publish) {
                                if let Err(err) = transport.ack(&publish).await {
                                    tracing::warn!(error = %err, "Failed to acknowledge message");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("Connected to MQTT broker");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }

                // Publish status
                _ = status_ticker.tick() => {
                    match serde_json::to_vec(&handler.snapshot()) {
                        Ok(payload) => {
                            if let Err(err) = transport.publish_status(self.engine_id, payload).await {
                                tracing::warn!(error = %err, "Failed to publish status");
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "Failed to encode status"),
                    }
                }

                // Handle shutdown
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        handler.stop();
        transport.disconnect().await;
        tracing::info!("Agent stopped");
        Ok(())
    }
}

/// Dispatch one inbound publish.
///
/// Returns `true` when the message is done with and can be acknowledged.
/// Messages whose processing was rolled back stay unacknowledged so the
/// broker redelivers them.
fn handle_publish(
    listener: &NeighbourListener,
    topic_scheme: &TopicScheme,
    engine_id: Uuid,
    publish: &Publish,
) -> bool {
    match topic_scheme.parse(&publish.topic) {
        Some((engine, TopicKind::Inbox)) if engine == engine_id => {}
        _ => {
            tracing::debug!(topic = %publish.topic, "Ignoring message on foreign topic");
            return true;
        }
    }

    let message = match ProxyEnvelope::from_cbor(&publish.payload) {
        Ok(envelope) => envelope.into_message(),
        Err(err) => {
            tracing::warn!(error = %err, topic = %publish.topic, "Failed to decode envelope");
            return true;
        }
    };

    match listener.on_message(&message) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(
                error = %err,
                sender = %message.sender,
                message_type = ?message.message_type,
                "Failed to process subscription message"
            );
            false
        }
    }
}

fn access_checker(config: &AgentConfig) -> Arc<dyn AccessChecker> {
    match config.allowed_principals.clone() {
        None => Arc::new(AllowAll),
        Some(allowed) => Arc::new(
            move |_destination: &str, _topic: &str, principal: &str, _op: AccessOperation| {
                allowed.contains(principal)
            },
        ),
    }
}
