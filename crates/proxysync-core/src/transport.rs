//! Transport collaborator.
//!
//! A transport delivers protocol messages to one neighbour's inbound queue,
//! reliably and in order. Sends are blocking from the protocol's point of
//! view and are never made while a subscription table lock is held.

use crate::error::TransportError;
use crate::message::SubscriptionMessage;
use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

/// Outbound delivery of protocol messages.
pub trait Transport: Send + Sync {
    /// Establish the outbound channel to a neighbour.
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot be created.
    fn open_channel(&self, neighbour: Uuid, bus: &str) -> Result<(), TransportError>;

    /// Tear down the outbound channel to a neighbour. Idempotent.
    fn close_channel(&self, neighbour: Uuid);

    /// Deliver a message to a neighbour's inbound queue.
    ///
    /// # Errors
    ///
    /// Returns error if the message could not be handed over.
    fn send(&self, neighbour: Uuid, message: &SubscriptionMessage) -> Result<(), TransportError>;
}

/// In-process transport that queues sent messages for inspection.
///
/// Useful for wiring engines together inside one process and for tests.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    open: Mutex<HashSet<Uuid>>,
    failing: Mutex<HashSet<Uuid>>,
    outbox: Mutex<Vec<(Uuid, SubscriptionMessage)>>,
}

impl MemoryTransport {
    /// Create a transport with no open channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `neighbour` fail (or succeed again).
    pub fn set_failing(&self, neighbour: Uuid, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(neighbour);
        } else {
            set.remove(&neighbour);
        }
    }

    /// Whether a channel to `neighbour` is open.
    #[must_use]
    pub fn is_open(&self, neighbour: Uuid) -> bool {
        self.open.lock().contains(&neighbour)
    }

    /// Remove and return everything sent so far, oldest first.
    pub fn drain(&self) -> Vec<(Uuid, SubscriptionMessage)> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Remove and return the messages sent to one neighbour, oldest first.
    pub fn drain_for(&self, neighbour: Uuid) -> Vec<SubscriptionMessage> {
        let mut outbox = self.outbox.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *outbox)
            .into_iter()
            .partition(|(target, _)| *target == neighbour);
        *outbox = rest;
        matching.into_iter().map(|(_, message)| message).collect()
    }
}

impl Transport for MemoryTransport {
    fn open_channel(&self, neighbour: Uuid, bus: &str) -> Result<(), TransportError> {
        tracing::debug!(%neighbour, bus, "Opening in-memory channel");
        self.open.lock().insert(neighbour);
        Ok(())
    }

    fn close_channel(&self, neighbour: Uuid) {
        self.open.lock().remove(&neighbour);
    }

    fn send(&self, neighbour: Uuid, message: &SubscriptionMessage) -> Result<(), TransportError> {
        if !self.open.lock().contains(&neighbour) {
            return Err(TransportError::NoChannel(neighbour));
        }
        if self.failing.lock().contains(&neighbour) {
            return Err(TransportError::Send(format!("delivery to {neighbour} refused")));
        }
        self.outbox.lock().push((neighbour, message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn send_requires_open_channel() {
        let transport = MemoryTransport::new();
        let neighbour = Uuid::new_v4();
        let message = SubscriptionMessage::new(MessageType::Reset, Uuid::new_v4(), "bus-a");

        assert!(matches!(
            transport.send(neighbour, &message),
            Err(TransportError::NoChannel(_))
        ));

        transport.open_channel(neighbour, "bus-a").unwrap();
        transport.send(neighbour, &message).unwrap();
        assert_eq!(transport.drain_for(neighbour), vec![message]);
        assert!(transport.drain().is_empty());
    }

    #[test]
    fn failing_neighbour_rejects_sends() {
        let transport = MemoryTransport::new();
        let neighbour = Uuid::new_v4();
        let message = SubscriptionMessage::new(MessageType::Reset, Uuid::new_v4(), "bus-a");
        transport.open_channel(neighbour, "bus-a").unwrap();

        transport.set_failing(neighbour, true);
        assert!(transport.send(neighbour, &message).is_err());

        transport.set_failing(neighbour, false);
        assert!(transport.send(neighbour, &message).is_ok());
    }
}
