//! Per-peer state.
//!
//! A [`Neighbour`] holds the interests its peer advertised to this engine,
//! keyed by (topic space, topic), and the state of a pending full resync
//! with that peer.

use crate::error::TransportError;
use crate::message::{MessageType, SubscriptionMessage};
use crate::store::StoreOp;
use crate::subscription::{ProxySubscription, SubscriptionKey};
use crate::timer::ResyncTimer;
use crate::transport::Transport;
use crate::txn::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use uuid::Uuid;

type SubscriptionTable = Arc<Mutex<HashMap<SubscriptionKey, ProxySubscription>>>;

/// Full-state message awaiting delivery or an answer.
#[derive(Debug, Default)]
struct ResyncState {
    outstanding: Option<SubscriptionMessage>,
    send_failed: bool,
}

/// This engine's view of one peer engine.
pub struct Neighbour {
    id: Uuid,
    bus: String,
    transport: Arc<dyn Transport>,
    subscriptions: SubscriptionTable,
    resync: Mutex<ResyncState>,
    timer: ResyncTimer,
    this: Weak<Neighbour>,
}

impl Neighbour {
    /// Create a neighbour with an empty subscription table.
    pub fn new(
        id: Uuid,
        bus: impl Into<String>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        resync_timeout: Duration,
    ) -> Arc<Self> {
        let bus = bus.into();
        Arc::new_cyclic(|this| Self {
            id,
            bus,
            transport,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            resync: Mutex::new(ResyncState::default()),
            timer: ResyncTimer::new(runtime, resync_timeout),
            this: this.clone(),
        })
    }

    /// Peer engine identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bus the link to the peer belongs to.
    #[must_use]
    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// Record an interest the peer advertised.
    ///
    /// A known key is re-confirmed: unmarked, and its security attributes
    /// updated (and re-persisted if they changed); `None` is returned. An
    /// unknown key gets a new record with a reference count of one, which is
    /// persisted, inserted and returned.
    pub fn proxy_registered(
        &self,
        candidate: &ProxySubscription,
        txn: &mut Transaction,
    ) -> Option<ProxySubscription> {
        let key = candidate.key().clone();
        let mut subscriptions = self.subscriptions.lock();

        if let Some(existing) = subscriptions.get_mut(&key) {
            existing.unmark();
            let previous = existing.clone();
            if existing.update_attributes(candidate) {
                tracing::debug!(neighbour = %self.id, %key, "Subscription attributes changed");
                txn.stage(StoreOp::PutSubscription {
                    neighbour: self.id,
                    subscription: existing.clone(),
                });
                let table = Arc::clone(&self.subscriptions);
                txn.on_rollback(move || {
                    if let Some(record) = table.lock().get_mut(previous.key()) {
                        record.update_attributes(&previous);
                    }
                });
            }
            return None;
        }

        let mut record = candidate.clone().with_ref_count(0);
        record.unmark();
        record.increment();
        subscriptions.insert(key.clone(), record.clone());
        txn.stage(StoreOp::PutSubscription {
            neighbour: self.id,
            subscription: record.clone(),
        });
        let table = Arc::clone(&self.subscriptions);
        txn.on_rollback(move || {
            table.lock().remove(&key);
        });
        Some(record)
    }

    /// Drop an interest the peer withdrew.
    ///
    /// Returns the removed record, or `None` if the key was not held.
    pub fn proxy_deregistered(
        &self,
        key: &SubscriptionKey,
        txn: &mut Transaction,
    ) -> Option<ProxySubscription> {
        let removed = self.subscriptions.lock().remove(key)?;
        self.stage_removal(&removed, txn);
        Some(removed)
    }

    /// Mark every record ahead of a full-state message.
    pub fn mark_all_proxies(&self) {
        for record in self.subscriptions.lock().values_mut() {
            record.mark();
        }
    }

    /// Remove every record left marked after a full-state message.
    ///
    /// Returns the removed records; the caller unbinds them and decides
    /// whether to forward the withdrawal.
    pub fn sweep_marked_proxies(&self, txn: &mut Transaction) -> Vec<ProxySubscription> {
        let swept: Vec<ProxySubscription> = {
            let mut subscriptions = self.subscriptions.lock();
            let marked: Vec<SubscriptionKey> = subscriptions
                .values()
                .filter(|record| record.is_marked())
                .map(|record| record.key().clone())
                .collect();
            marked
                .iter()
                .filter_map(|key| subscriptions.remove(key))
                .collect()
        };

        for record in &swept {
            self.stage_removal(record, txn);
        }
        if !swept.is_empty() {
            tracing::debug!(neighbour = %self.id, swept = swept.len(), "Swept withdrawn subscriptions");
        }
        swept
    }

    fn stage_removal(&self, record: &ProxySubscription, txn: &mut Transaction) {
        txn.stage(StoreOp::RemoveSubscription {
            neighbour: self.id,
            key: record.key().clone(),
        });
        let table = Arc::clone(&self.subscriptions);
        let mut restored = record.clone();
        restored.unmark();
        txn.on_rollback(move || {
            table.lock().insert(restored.key().clone(), restored);
        });
    }

    /// Reinstate persisted records without staging writes.
    pub fn restore(&self, records: impl IntoIterator<Item = ProxySubscription>) {
        let mut subscriptions = self.subscriptions.lock();
        for record in records {
            subscriptions.insert(record.key().clone(), record);
        }
    }

    /// Snapshot of every record, ordered by key.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<ProxySubscription> {
        let mut records: Vec<ProxySubscription> =
            self.subscriptions.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    /// Keys of every record, ordered.
    #[must_use]
    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.subscriptions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of records held.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// The record held for `key`, if any.
    #[must_use]
    pub fn subscription(&self, key: &SubscriptionKey) -> Option<ProxySubscription> {
        self.subscriptions.lock().get(key).cloned()
    }

    /// Send a message to the peer.
    ///
    /// # Errors
    ///
    /// Returns the transport error; the caller decides whether it matters.
    pub fn send(&self, message: &SubscriptionMessage) -> Result<(), TransportError> {
        self.transport.send(self.id, message)
    }

    /// Send a REQUEST and wait for the peer's full state.
    ///
    /// The resync timer is armed whether or not the send succeeded. On
    /// expiry a delivered request that went unanswered is reported; a request
    /// that could not be delivered is sent again.
    pub fn send_request_proxy_subscriptions(&self, message: SubscriptionMessage) {
        let failed = self.try_send(&message);
        let mut resync = self.resync.lock();
        resync.outstanding = Some(message);
        resync.send_failed = failed;
        self.arm_timer();
    }

    /// Send an unsolicited or solicited full state (RESET or REPLY).
    ///
    /// A failed send is retried on the next timer expiry. If a REQUEST was
    /// still outstanding the retry goes out as a REQUEST so the answer is
    /// still awaited.
    pub fn send_full_state(&self, mut message: SubscriptionMessage) {
        if !self.try_send(&message) {
            return;
        }
        let mut resync = self.resync.lock();
        if resync
            .outstanding
            .as_ref()
            .is_some_and(|pending| pending.message_type == MessageType::Request)
        {
            message.message_type = MessageType::Request;
        }
        resync.outstanding = Some(message);
        resync.send_failed = true;
        self.arm_timer();
    }

    /// Returns `true` if the send failed.
    fn try_send(&self, message: &SubscriptionMessage) -> bool {
        match self.transport.send(self.id, message) {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!(
                    neighbour = %self.id,
                    bus = %self.bus,
                    message_type = ?message.message_type,
                    error = %err,
                    "Full-state send failed, retrying on timer"
                );
                true
            }
        }
    }

    fn arm_timer(&self) {
        let this = self.this.clone();
        self.timer.arm(move |generation| {
            if let Some(neighbour) = this.upgrade() {
                neighbour.on_resync_timer(generation);
            }
        });
    }

    /// Handle expiry of the resync timer.
    pub fn on_resync_timer(&self, generation: u64) {
        let mut resync = self.resync.lock();
        if !self.timer.fire(generation) {
            return;
        }
        let Some(message) = resync.outstanding.clone() else {
            return;
        };

        if resync.send_failed {
            match self.transport.send(self.id, &message) {
                Ok(()) => {
                    tracing::info!(
                        neighbour = %self.id,
                        message_type = ?message.message_type,
                        "Resent full state"
                    );
                    resync.send_failed = false;
                    if message.message_type == MessageType::Request {
                        self.arm_timer();
                    } else {
                        resync.outstanding = None;
                    }
                }
                Err(err) => {
                    tracing::warn!(neighbour = %self.id, error = %err, "Full-state resend failed");
                    self.arm_timer();
                }
            }
        } else if message.message_type == MessageType::Request {
            tracing::warn!(
                neighbour = %self.id,
                bus = %self.bus,
                timeout_secs = self.timer.timeout().as_secs(),
                "No reply to subscription request, topology may be inconsistent"
            );
            resync.outstanding = None;
        }
    }

    /// The peer sent its full state; stop waiting for it.
    ///
    /// A request that never reached the peer keeps being retried.
    pub fn set_requested_proxy_subscriptions_responded(&self) {
        let mut resync = self.resync.lock();
        let answered = resync
            .outstanding
            .as_ref()
            .is_some_and(|pending| pending.message_type == MessageType::Request)
            && !resync.send_failed;
        if answered {
            resync.outstanding = None;
            self.timer.cancel();
        }
    }

    /// Whether a delivered REQUEST is still unanswered.
    #[must_use]
    pub fn is_awaiting_response(&self) -> bool {
        let resync = self.resync.lock();
        !resync.send_failed
            && resync
                .outstanding
                .as_ref()
                .is_some_and(|pending| pending.message_type == MessageType::Request)
    }

    /// Whether a full-state send is waiting to be retried.
    #[must_use]
    pub fn has_failed_send(&self) -> bool {
        self.resync.lock().send_failed
    }

    /// Cancel any pending resync.
    pub fn shutdown(&self) {
        let mut resync = self.resync.lock();
        resync.outstanding = None;
        resync.send_failed = false;
        self.timer.cancel();
    }
}

impl fmt::Debug for Neighbour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neighbour")
            .field("id", &self.id)
            .field("bus", &self.bus)
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
