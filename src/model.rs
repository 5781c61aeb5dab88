use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key under which everything per-conversation is grouped: one session,
/// one lock, one user record per `(platform, user)` pair.
pub fn session_key(user_id: &str, platform: &str) -> String {
    format!("{platform}|{user_id}")
}

/// One unit of conversation logic: a script plus a stable id that other
/// scripts jump to. Authored in the external editor; the engine only
/// reads blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Block {
    pub id: i64,
    pub name: String,
    pub script: String,
    pub is_start: bool,
}

impl Block {
    pub fn new(id: i64, name: impl Into<String>, script: impl Into<String>, is_start: bool) -> Self {
        Self {
            id,
            name: name.into(),
            script: script.into(),
            is_start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotUser {
    pub user_id: String,
    pub platform: String,
    pub username: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl BotUser {
    pub fn new(user_id: impl Into<String>, platform: impl Into<String>, username: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            username,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// The pointer to a user's current block. At most one per
/// `(user, platform)`; only `go_to` moves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserSession {
    pub user_id: String,
    pub platform: String,
    pub current_block_id: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, platform: impl Into<String>, current_block_id: i64) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            current_block_id,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    Inbound,
    Outbound,
}

/// Append-only audit row, one per message direction. `block_id` is the
/// session's block at the time of logging, not necessarily the block
/// that produced the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Trace {
    pub user_id: String,
    pub platform: String,
    pub block_id: Option<i64>,
    pub direction: TraceDirection,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Trace {
    pub fn inbound(
        user_id: impl Into<String>,
        platform: impl Into<String>,
        block_id: Option<i64>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            block_id,
            direction: TraceDirection::Inbound,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn outbound(
        user_id: impl Into<String>,
        platform: impl Into<String>,
        block_id: Option<i64>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            block_id,
            direction: TraceDirection::Outbound,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Stop,
    Run,
    Error,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Stop => "stop",
            ModuleStatus::Run => "run",
            ModuleStatus::Error => "error",
        }
    }
}

/// Registration record for a named plugin. `source_file` is absolute or
/// relative to the plugin root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleRecord {
    pub name: String,
    pub source_file: String,
    pub status: ModuleStatus,
}

impl ModuleRecord {
    pub fn new(name: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_file: source_file.into(),
            status: ModuleStatus::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_format() {
        assert_eq!(session_key("42", "telegram"), "telegram|42");
    }

    #[test]
    fn test_new_user_defaults() {
        let user = BotUser::new("42", "telegram", Some("alice".into()));
        assert!(user.is_active);
        assert_eq!(user.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_module_record_starts_stopped() {
        let record = ModuleRecord::new("assist", "assist.rhai");
        assert_eq!(record.status, ModuleStatus::Stop);
    }

    #[test]
    fn test_trace_directions_serialize_lowercase() {
        let trace = Trace::inbound("42", "telegram", Some(1), "hi");
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["direction"], "inbound");
    }
}
