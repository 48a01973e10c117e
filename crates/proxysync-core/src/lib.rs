//! # proxysync core
//!
//! Proxy-subscription propagation between messaging engines.
//!
//! Every engine belongs to one or more buses and keeps a [`Neighbour`] per
//! peer engine it links to. Local consumer interest is advertised to every
//! neighbour so that publications originating anywhere in the topology are
//! routed back to this engine; interest learned from one bus is re-advertised
//! onto every other bus the engine belongs to.
//!
//! This crate provides:
//! - Reference-counted subscription records and the protocol message shape
//! - Per-bus aggregation of local and remote interest ([`BusGroup`])
//! - The neighbour registry with deferred bindings for missing topic spaces
//! - The [`ProxyHandler`] coordinator and the inbound [`NeighbourListener`]
//! - Transactions with commit/rollback callbacks
//!
//! Transport, matching, persistence and access control are collaborators
//! behind the traits in [`transport`], [`matchspace`], [`store`] and
//! [`access`]; each ships an in-memory implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod bus_group;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod lock;
pub mod matchspace;
pub mod message;
pub mod neighbour;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod timer;
pub mod transport;
pub mod txn;

pub use access::{AccessChecker, AccessOperation, AllowAll};
pub use bus_group::BusGroup;
pub use config::{ForeignBusConfig, ProxyConfig, DEFAULT_RESYNC_TIMEOUT};
pub use error::{MatchError, ProxyError, StoreError, TransportError};
pub use handler::{BusGroupSnapshot, HandlerSnapshot, NeighbourSnapshot, ProxyHandler};
pub use listener::NeighbourListener;
pub use lock::ProxyLock;
pub use matchspace::{InMemoryMatchSpace, MatchSpace, ProxyBinding};
pub use message::{MessageBuilder, MessageType, SubscriptionMessage, TopicEntry};
pub use neighbour::Neighbour;
pub use registry::{HeldSubscription, LinkedNeighbour, NeighbourRegistry};
pub use store::{MemoryStore, NeighbourRecord, RecoveredNeighbour, StoreOp, SubscriptionStore};
pub use subscription::{LocalSubscription, Principal, ProxySubscription, SubscriptionKey};
pub use timer::ResyncTimer;
pub use transport::{MemoryTransport, Transport};
pub use txn::Transaction;
