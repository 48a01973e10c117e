//! CBOR envelope for protocol messages.

use proxysync_core::SubscriptionMessage;
use serde::{Deserialize, Serialize};

/// Envelope revision written by this crate.
pub const WIRE_VERSION: u16 = 1;

/// A protocol message as carried over MQTT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEnvelope {
    /// Envelope revision
    pub version: u16,
    /// The carried message
    pub message: SubscriptionMessage,
}

impl ProxyEnvelope {
    /// Wrap a message at the current revision.
    #[must_use]
    pub fn new(message: SubscriptionMessage) -> Self {
        Self {
            version: WIRE_VERSION,
            message,
        }
    }

    /// Unwrap the carried message.
    #[must_use]
    pub fn into_message(self) -> SubscriptionMessage {
        self.message
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not an envelope or carry a revision
    /// this crate does not understand.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Self =
            ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))?;
        if envelope.version != WIRE_VERSION {
            return Err(MessageError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Envelope revision not supported
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u16),
}
