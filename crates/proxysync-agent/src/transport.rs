//! MQTT transport for proxy subscription traffic.

use parking_lot::Mutex;
use proxysync_core::{SubscriptionMessage, Transport, TransportError};
use proxysync_proto::{ProxyEnvelope, TopicScheme};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Publish, QoS};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Publishes protocol messages to neighbour inboxes.
///
/// A channel is open while the neighbour is registered; sends to a
/// neighbour without an open channel fail without touching the broker.
pub struct MqttTransport {
    client: AsyncClient,
    topic_scheme: TopicScheme,
    channels: Mutex<HashMap<Uuid, String>>,
}

impl MqttTransport {
    /// Create a transport and the event loop that drives it.
    ///
    /// Incoming publishes are acknowledged manually through [`ack`](Self::ack).
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
    ) -> Result<(Self, EventLoop), MqttError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(false);
        mqtt_options.set_manual_acks(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                topic_scheme,
                channels: Mutex::new(HashMap::new()),
            },
            eventloop,
        ))
    }

    /// Subscribe to an engine's inbox.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe_inbox(&self, engine: Uuid) -> Result<(), MqttError> {
        let topic = self.topic_scheme.inbox(engine);

        tracing::info!(topic, "Subscribing to inbox");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))?;

        Ok(())
    }

    /// Acknowledge an inbound publish once it has been processed.
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement cannot be queued.
    pub async fn ack(&self, publish: &Publish) -> Result<(), MqttError> {
        self.client
            .ack(publish)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    /// Publish a retained status document.
    ///
    /// # Errors
    ///
    /// Returns error if publish fails.
    pub async fn publish_status(&self, engine: Uuid, payload: Vec<u8>) -> Result<(), MqttError> {
        let topic = self.topic_scheme.status(engine);

        tracing::debug!(topic, payload_len = payload.len(), "Publishing status");

        self.client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error = %err, "MQTT disconnect failed");
        }
    }
}

impl Transport for MqttTransport {
    fn open_channel(&self, neighbour: Uuid, bus: &str) -> Result<(), TransportError> {
        tracing::debug!(%neighbour, bus, "Opening channel");
        self.channels.lock().insert(neighbour, bus.to_string());
        Ok(())
    }

    fn close_channel(&self, neighbour: Uuid) {
        if self.channels.lock().remove(&neighbour).is_some() {
            tracing::debug!(%neighbour, "Closed channel");
        }
    }

    fn send(&self, neighbour: Uuid, message: &SubscriptionMessage) -> Result<(), TransportError> {
        if !self.channels.lock().contains_key(&neighbour) {
            return Err(TransportError::NoChannel(neighbour));
        }

        let topic = self.topic_scheme.inbox(neighbour);
        let payload = ProxyEnvelope::new(message.clone())
            .to_cbor()
            .map_err(|e| TransportError::Send(e.to_string()))?;

        tracing::debug!(
            topic,
            message_type = ?message.message_type,
            entries = message.entries.len(),
            payload_len = payload.len(),
            "Publishing subscription message"
        );

        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Parse MQTT URL into host and port.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), MqttError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| MqttError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port
            .parse()
            .map_err(|_| MqttError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(MqttError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for MQTT operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Publish or acknowledgement failed
    #[error("publish error: {0}")]
    Publish(String),
}
