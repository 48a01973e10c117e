//! # proxysync protocol
//!
//! Wire envelope and MQTT topic scheme used by the agent to carry proxy
//! subscription messages between engines.
//!
//! ## Messages
//!
//! - `ProxyEnvelope`: versioned CBOR wrapper around a
//!   [`SubscriptionMessage`](proxysync_core::SubscriptionMessage)
//!
//! ## MQTT Topics
//!
//! Topic scheme: `proxysync/v1/{tenant}/{engine_id}/{kind}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{MessageError, ProxyEnvelope, WIRE_VERSION};
pub use topics::{TopicKind, TopicScheme};
