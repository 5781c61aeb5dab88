use async_trait::async_trait;
use thiserror::Error;

use crate::message::{InboundMessage, OutboundMessage};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("delivery to `{user_id}` failed: {reason}")]
    Delivery { user_id: String, reason: String },
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Outbound half of a platform connector.
///
/// Failures are reported to the caller for logging only; the engine
/// never retries a send and never surfaces the failure to a script.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, user_id: &str, message: OutboundMessage) -> Result<(), ConnectorError>;
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").field("impl", &self.name()).finish()
    }
}

/// Inbound half: a connector pushes every received message into a sink.
/// The engine implements this.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn notify(&self, message: InboundMessage);
}
