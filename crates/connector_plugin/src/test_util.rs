use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use crate::connector::{Connector, ConnectorError};
use crate::message::OutboundMessage;

/// Records every outbound message instead of delivering it.
#[derive(Clone, Default)]
pub struct MockConnector {
    sent: Arc<Mutex<Vec<(String, OutboundMessage)>>>,
    failing: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent `send` fail until called with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().expect("mock connector poisoned").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, m)| m.text).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, user_id: &str, message: OutboundMessage) -> Result<(), ConnectorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectorError::Delivery {
                user_id: user_id.to_string(),
                reason: "mock connector set to fail".to_string(),
            });
        }
        self.sent
            .lock()
            .expect("mock connector poisoned")
            .push((user_id.to_string(), message));
        Ok(())
    }
}
