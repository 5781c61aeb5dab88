use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connector_plugin::connector::{Connector, InboundSink};
use connector_plugin::message::{InboundMessage, OutboundMessage};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, warn};

use crate::context::{CapabilityContext, MAX_CHUNK_CHARS, split_text};
use crate::model::{BotUser, Trace, UserSession, session_key};
use crate::modules::ModuleManager;
use crate::script::{DEFAULT_MAX_SCRIPT_OPS, TurnEvent, run_block};
use crate::storage::{Storage, StorageError};

/// `user_data` key carrying the platform display name.
const USERNAME_KEY: &str = "username";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on chained `go_to` re-entries within one turn.
    pub max_hops: usize,
    /// Deadline for one turn, spanning every block run in it.
    pub turn_timeout: Duration,
    /// Rhai operation cap per script run.
    pub max_script_ops: u64,
    /// The one fixed notice a user sees when a script fails.
    pub error_notice: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops: 16,
            turn_timeout: Duration::from_secs(30),
            max_script_ops: DEFAULT_MAX_SCRIPT_OPS,
            error_notice: "The bot hit an internal error. Please try again.".to_string(),
        }
    }
}

/// Turns one inbound message into zero or more block executions.
///
/// Turns for the same `(user, platform)` pair are serialized on a
/// per-session lock held from the inbound trace to the end of the block
/// loop; turns for different pairs run concurrently.
pub struct ConversationEngine {
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    modules: Arc<ModuleManager>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn Connector>,
        modules: Arc<ModuleManager>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            connector,
            modules,
            session_locks: DashMap::new(),
            config,
        })
    }

    /// Processes one inbound message. Side effects only; every failure
    /// is resolved internally (logged, and for script failures answered
    /// with the fixed notice).
    #[tracing::instrument(name = "process_message", skip(self, text, user_data))]
    pub async fn process(
        &self,
        user_id: &str,
        platform: &str,
        text: &str,
        user_data: Option<HashMap<String, Value>>,
    ) {
        if let Err(err) = self.run_turn(user_id, platform, text, user_data).await {
            error!(user_id, platform, %err, "turn aborted on storage failure");
        }
    }

    async fn run_turn(
        &self,
        user_id: &str,
        platform: &str,
        text: &str,
        user_data: Option<HashMap<String, Value>>,
    ) -> Result<(), StorageError> {
        let user = self.bootstrap_user(user_id, platform, user_data.as_ref())?;
        if !user.is_active {
            debug!(user_id, platform, "ignoring message from inactive user");
            return Ok(());
        }

        let lock = self.session_lock(&session_key(user_id, platform));
        let _guard = lock.lock().await;

        let session = self.storage.find_session(user_id, platform)?;
        let current_block = session.as_ref().map(|s| s.current_block_id);
        self.storage
            .append_trace(Trace::inbound(user_id, platform, current_block, text))?;

        let session = match session {
            Some(session) => session,
            None => {
                let Some(start) = self.storage.find_start_block()? else {
                    error!(user_id, platform, "no start block configured, dropping turn");
                    return Ok(());
                };
                let session = UserSession::new(user_id, platform, start.id);
                self.storage.create_session(session.clone())?;
                session
            }
        };

        let deadline = Instant::now() + self.config.turn_timeout;
        let mut event = TurnEvent::Message;
        let mut hops = 0usize;
        let mut current_block_id = session.current_block_id;

        loop {
            let Some(block) = self.storage.find_block(current_block_id)? else {
                error!(
                    user_id,
                    platform,
                    block_id = current_block_id,
                    "session points at a missing block"
                );
                break;
            };

            let context =
                CapabilityContext::new(user_id, platform, self.storage.clone(), self.modules.clone());
            let script = block.script.clone();
            let input_text = text.to_string();
            let max_ops = self.config.max_script_ops;
            let run = tokio::task::spawn_blocking(move || {
                run_block(&script, &input_text, event, context, max_ops)
            });

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match timeout(remaining, run).await {
                Err(_) => {
                    error!(
                        user_id,
                        platform,
                        block_id = block.id,
                        "block script exceeded the turn timeout"
                    );
                    self.send_error_notice(user_id).await;
                    break;
                }
                Ok(Err(join_err)) => {
                    error!(user_id, platform, block_id = block.id, %join_err, "block script task died");
                    self.send_error_notice(user_id).await;
                    break;
                }
                Ok(Ok(outcome)) => outcome,
            };

            // Messages queued before a failure are still delivered, in
            // call order.
            self.flush_outbox(user_id, platform, outcome.outbox).await?;

            if let Some(script_err) = outcome.error {
                error!(user_id, platform, block_id = block.id, %script_err, "block script failed");
                self.send_error_notice(user_id).await;
                break;
            }

            if !outcome.jumped {
                break;
            }

            hops += 1;
            if hops > self.config.max_hops {
                error!(
                    user_id,
                    platform,
                    block_id = block.id,
                    max_hops = self.config.max_hops,
                    "go_to chain exceeded the hop budget"
                );
                self.send_error_notice(user_id).await;
                break;
            }

            event = TurnEvent::Enter;
            current_block_id = match self.storage.find_session(user_id, platform)? {
                Some(session) => session.current_block_id,
                None => {
                    error!(user_id, platform, "session vanished mid-turn");
                    break;
                }
            };
        }

        Ok(())
    }

    /// Resolves or creates the user, refreshes a changed display name,
    /// and captures the remaining platform attributes as params.
    fn bootstrap_user(
        &self,
        user_id: &str,
        platform: &str,
        user_data: Option<&HashMap<String, Value>>,
    ) -> Result<BotUser, StorageError> {
        let username = user_data
            .and_then(|data| data.get(USERNAME_KEY))
            .and_then(Value::as_str)
            .map(str::to_string);

        let user = match self.storage.find_user(user_id, platform)? {
            None => {
                let user = BotUser::new(user_id, platform, username.clone());
                self.storage.create_user(user.clone())?;
                user
            }
            Some(mut user) => {
                if let Some(name) = &username {
                    if user.username.as_deref() != Some(name.as_str()) {
                        user.username = Some(name.clone());
                        self.storage.update_user(user.clone())?;
                    }
                }
                user
            }
        };

        if let Some(data) = user_data {
            for (key, value) in data {
                if key == USERNAME_KEY || value.is_null() {
                    continue;
                }
                self.storage
                    .set_param(user_id, platform, key, &stringify_attr(value))?;
            }
        }

        Ok(user)
    }

    async fn flush_outbox(
        &self,
        user_id: &str,
        platform: &str,
        outbox: Vec<OutboundMessage>,
    ) -> Result<(), StorageError> {
        for message in outbox {
            if message.text.is_empty() {
                continue;
            }

            let chunks = split_text(&message.text, MAX_CHUNK_CHARS);
            let last = chunks.len() - 1;
            for (index, chunk) in chunks.into_iter().enumerate() {
                // Tag with the session's block at send time; after a
                // go_to that is already the destination block.
                let block_id = self
                    .storage
                    .find_session(user_id, platform)?
                    .map(|s| s.current_block_id);
                self.storage
                    .append_trace(Trace::outbound(user_id, platform, block_id, chunk.clone()))?;

                let is_last = index == last;
                let outbound = OutboundMessage {
                    text: chunk,
                    buttons: if is_last { message.buttons.clone() } else { None },
                    format: message.format,
                    request_contact: message.request_contact && is_last,
                };
                if let Err(err) = self.connector.send(user_id, outbound).await {
                    warn!(user_id, platform, %err, "connector send failed");
                }
            }
        }
        Ok(())
    }

    /// Delivered directly, without chunking or tracing: the notice is
    /// engine output, not script output.
    async fn send_error_notice(&self, user_id: &str) {
        let notice = OutboundMessage::text(self.config.error_notice.clone());
        if let Err(err) = self.connector.send(user_id, notice).await {
            warn!(user_id, %err, "could not deliver the error notice");
        }
    }

    fn session_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl InboundSink for ConversationEngine {
    async fn notify(&self, message: InboundMessage) {
        let InboundMessage {
            user_id,
            platform,
            text,
            user_data,
            ..
        } = message;
        let user_data = if user_data.is_empty() { None } else { Some(user_data) };
        self.process(&user_id, &platform, &text, user_data).await;
    }
}

fn stringify_attr(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
