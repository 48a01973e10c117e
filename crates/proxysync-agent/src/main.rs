//! # proxysync Agent
//!
//! Messaging-engine agent that keeps proxy subscriptions in step with its
//! neighbours over MQTT.
//!
//! ## Architecture
//!
//! The agent runs a single event loop around the proxy handler:
//! 1. **Recovery**: Reloads persisted neighbours and reconciles them with the
//!    configured links
//! 2. **Ingress**: Decodes protocol messages from the engine's inbox and hands
//!    them to the neighbour listener, acknowledging after commit
//! 3. **Egress**: Publishes subscription changes to neighbour inboxes
//! 4. **Status**: Periodically publishes a JSON snapshot of the handler state

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod persistence;
mod runtime;
mod transport;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting proxysync agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    let engine_id = config.engine_id.unwrap_or_else(Uuid::new_v4);

    tracing::info!(%engine_id, bus = %config.bus, "Agent initialized");

    let agent = Agent::new(config, engine_id)?;

    // Run agent
    agent.run().await?;

    Ok(())
}
