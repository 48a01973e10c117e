//! Error types for the propagation protocol and its collaborators.

use uuid::Uuid;

/// Errors reported by a [`SubscriptionStore`](crate::store::SubscriptionStore).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A staged write could not be applied
    #[error("store write failed: {0}")]
    Write(String),
    /// Persisted state could not be read back
    #[error("store recovery failed: {0}")]
    Recover(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No outbound channel is open to the neighbour
    #[error("no channel open to neighbour {0}")]
    NoChannel(Uuid),
    /// The message could not be handed to the transport
    #[error("send failed: {0}")]
    Send(String),
    /// The channel could not be opened
    #[error("open failed: {0}")]
    Open(String),
}

/// Errors reported by a [`MatchSpace`](crate::matchspace::MatchSpace).
#[derive(Debug, Clone, thiserror::Error)]
pub enum MatchError {
    /// The topic space does not exist
    #[error("unknown topic space {0}")]
    UnknownTopicSpace(Uuid),
    /// No output binding exists for the neighbour on the topic space
    #[error("no output binding for neighbour {neighbour} on topic space {topic_space}")]
    NoBinding {
        /// Topic space identifier
        topic_space: Uuid,
        /// Neighbour engine identifier
        neighbour: Uuid,
    },
}

/// Errors surfaced by the proxy handler, registry and listener.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Persisting subscription state failed; the transaction was rolled back
    #[error("resource failure: {0}")]
    Resource(#[from] StoreError),
    /// The match space rejected a binding change
    #[error("match space failure: {0}")]
    Match(#[from] MatchError),
    /// A channel to a neighbour could not be established
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// A protocol invariant does not hold; indicates a bug, never retried
    #[error("internal consistency violation: {0}")]
    Internal(String),
    /// Inbound protocol traffic arrived while the handler was stopped
    #[error("proxy handler is not started")]
    NotStarted,
}
