use std::sync::Arc;

use async_trait::async_trait;
use connector_plugin::connector::{Connector, ConnectorError, InboundSink};
use connector_plugin::message::{InboundMessage, OutboundMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Stdin/stdout connector for local runs: every line typed is one
/// inbound message from a fixed local user. Platform connectors
/// (Telegram and friends) implement the same contract out of tree.
pub struct ConsoleConnector {
    user_id: String,
    platform: String,
}

impl ConsoleConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            user_id: "local".to_string(),
            platform: "console".to_string(),
        })
    }

    /// Reads stdin until EOF, handing each line to the engine.
    pub async fn listen(&self, sink: Arc<dyn InboundSink>) -> anyhow::Result<()> {
        info!("console connector listening; type a message and press enter");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            sink.notify(InboundMessage::new(&self.user_id, &self.platform, text))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for ConsoleConnector {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, _user_id: &str, message: OutboundMessage) -> Result<(), ConnectorError> {
        println!("{}", message.text);
        if let Some(buttons) = &message.buttons {
            println!("  [{}]", buttons.join(" | "));
        }
        if message.request_contact {
            println!("  (share your contact to continue)");
        }
        Ok(())
    }
}
