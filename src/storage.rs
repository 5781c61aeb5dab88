use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;

use crate::model::{Block, BotUser, ModuleRecord, ModuleStatus, Trace, UserSession, session_key};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Data-access contract consumed by the engine. Each method is a single
/// logical operation; implementations decide transactionality.
///
/// The trait is sync because the script capability primitives that call
/// into it run inside the Rhai interpreter on a blocking thread.
pub trait Storage: Send + Sync {
    fn find_user(&self, user_id: &str, platform: &str) -> Result<Option<BotUser>, StorageError>;
    fn create_user(&self, user: BotUser) -> Result<(), StorageError>;
    fn update_user(&self, user: BotUser) -> Result<(), StorageError>;

    fn find_session(&self, user_id: &str, platform: &str) -> Result<Option<UserSession>, StorageError>;
    fn create_session(&self, session: UserSession) -> Result<(), StorageError>;
    fn update_session(&self, session: UserSession) -> Result<(), StorageError>;

    fn get_param(&self, user_id: &str, platform: &str, key: &str) -> Result<Option<String>, StorageError>;
    fn set_param(&self, user_id: &str, platform: &str, key: &str, value: &str) -> Result<(), StorageError>;

    fn append_trace(&self, trace: Trace) -> Result<(), StorageError>;
    fn list_traces(&self, user_id: &str, platform: &str) -> Result<Vec<Trace>, StorageError>;

    fn find_block(&self, id: i64) -> Result<Option<Block>, StorageError>;
    fn insert_block(&self, block: Block) -> Result<(), StorageError>;
    fn find_start_block(&self) -> Result<Option<Block>, StorageError>;

    fn find_module(&self, name: &str) -> Result<Option<ModuleRecord>, StorageError>;
    fn insert_module(&self, module: ModuleRecord) -> Result<(), StorageError>;
    fn update_module_status(&self, name: &str, status: ModuleStatus) -> Result<(), StorageError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("impl", &self.name()).finish()
    }
}

/// Reference store used by the CLI and the test suite. Persistent
/// backends implement [`Storage`] out of tree.
pub struct MemoryStorage {
    users: DashMap<String, BotUser>,
    sessions: DashMap<String, UserSession>,
    params: DashMap<String, String>,
    traces: Mutex<Vec<Trace>>,
    blocks: DashMap<i64, Block>,
    modules: DashMap<String, ModuleRecord>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            users: DashMap::new(),
            sessions: DashMap::new(),
            params: DashMap::new(),
            traces: Mutex::new(Vec::new()),
            blocks: DashMap::new(),
            modules: DashMap::new(),
        })
    }

    fn param_key(user_id: &str, platform: &str, key: &str) -> String {
        format!("{platform}|{user_id}|{key}")
    }
}

impl Storage for MemoryStorage {
    fn find_user(&self, user_id: &str, platform: &str) -> Result<Option<BotUser>, StorageError> {
        Ok(self.users.get(&session_key(user_id, platform)).map(|u| u.value().clone()))
    }

    fn create_user(&self, user: BotUser) -> Result<(), StorageError> {
        self.users.insert(session_key(&user.user_id, &user.platform), user);
        Ok(())
    }

    fn update_user(&self, user: BotUser) -> Result<(), StorageError> {
        self.users.insert(session_key(&user.user_id, &user.platform), user);
        Ok(())
    }

    fn find_session(&self, user_id: &str, platform: &str) -> Result<Option<UserSession>, StorageError> {
        Ok(self.sessions.get(&session_key(user_id, platform)).map(|s| s.value().clone()))
    }

    fn create_session(&self, session: UserSession) -> Result<(), StorageError> {
        self.sessions
            .insert(session_key(&session.user_id, &session.platform), session);
        Ok(())
    }

    fn update_session(&self, session: UserSession) -> Result<(), StorageError> {
        self.sessions
            .insert(session_key(&session.user_id, &session.platform), session);
        Ok(())
    }

    fn get_param(&self, user_id: &str, platform: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .params
            .get(&Self::param_key(user_id, platform, key))
            .map(|v| v.value().clone()))
    }

    fn set_param(&self, user_id: &str, platform: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.params
            .insert(Self::param_key(user_id, platform, key), value.to_string());
        Ok(())
    }

    fn append_trace(&self, trace: Trace) -> Result<(), StorageError> {
        self.traces
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .push(trace);
        Ok(())
    }

    fn list_traces(&self, user_id: &str, platform: &str) -> Result<Vec<Trace>, StorageError> {
        Ok(self
            .traces
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .iter()
            .filter(|t| t.user_id == user_id && t.platform == platform)
            .cloned()
            .collect())
    }

    fn find_block(&self, id: i64) -> Result<Option<Block>, StorageError> {
        Ok(self.blocks.get(&id).map(|b| b.value().clone()))
    }

    fn insert_block(&self, block: Block) -> Result<(), StorageError> {
        self.blocks.insert(block.id, block);
        Ok(())
    }

    fn find_start_block(&self) -> Result<Option<Block>, StorageError> {
        // Lowest id wins so multiple start flags stay deterministic.
        Ok(self
            .blocks
            .iter()
            .filter(|entry| entry.is_start)
            .min_by_key(|entry| entry.id)
            .map(|entry| entry.value().clone()))
    }

    fn find_module(&self, name: &str) -> Result<Option<ModuleRecord>, StorageError> {
        Ok(self.modules.get(name).map(|m| m.value().clone()))
    }

    fn insert_module(&self, module: ModuleRecord) -> Result<(), StorageError> {
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    fn update_module_status(&self, name: &str, status: ModuleStatus) -> Result<(), StorageError> {
        if let Some(mut record) = self.modules.get_mut(name) {
            record.status = status;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryStorage"
    }
}
