use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rhai::{AST, Dynamic, EvalAltResult, Scope};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::ModuleStatus;
use crate::script::plugin_engine;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module `{0}` is not registered")]
    NotFound(String),
    #[error("module `{name}` source missing: {path}")]
    SourceMissing { name: String, path: PathBuf },
    #[error("module `{name}` failed to load: {error}")]
    Load { name: String, error: String },
    #[error("module `{module}` has no function `{function}`")]
    FunctionNotFound { module: String, function: String },
    #[error("module `{module}` function `{function}` failed: {error}")]
    Call {
        module: String,
        function: String,
        error: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A compiled plugin. The AST is immutable after load; every call runs
/// it through a fresh engine and scope.
pub struct LoadedModule {
    name: String,
    ast: AST,
}

impl LoadedModule {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of named Rhai plugins.
///
/// Sources are resolved through the stored [`ModuleRecord`]s, compiled
/// once, and cached for the life of the process. Loads are
/// single-flight per name; a cache hit never re-reads the record or
/// re-touches its status.
///
/// [`ModuleRecord`]: crate::model::ModuleRecord
pub struct ModuleManager {
    plugin_root: PathBuf,
    storage: Arc<dyn Storage>,
    loaded: DashMap<String, Arc<LoadedModule>>,
    load_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ModuleManager {
    pub fn new(storage: Arc<dyn Storage>, plugin_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            plugin_root: plugin_root.into(),
            storage,
            loaded: DashMap::new(),
            load_locks: DashMap::new(),
        })
    }

    /// Returns the cached module, loading it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<LoadedModule>, ModuleError> {
        if let Some(module) = self.loaded.get(name) {
            return Ok(module.clone());
        }
        self.load(name)
    }

    /// Invokes an exported plugin function and returns its result.
    pub fn call(&self, name: &str, function: &str, args: Vec<Dynamic>) -> Result<Dynamic, ModuleError> {
        let module = self.get(name)?;
        let engine = plugin_engine();
        let mut scope = Scope::new();

        engine
            .call_fn::<Dynamic>(&mut scope, &module.ast, function, args)
            .map_err(|err| match *err {
                EvalAltResult::ErrorFunctionNotFound(ref signature, _)
                    if signature_names(signature, function) =>
                {
                    ModuleError::FunctionNotFound {
                        module: name.to_string(),
                        function: function.to_string(),
                    }
                }
                _ => ModuleError::Call {
                    module: name.to_string(),
                    function: function.to_string(),
                    error: err.to_string(),
                },
            })
    }

    fn load(&self, name: &str) -> Result<Arc<LoadedModule>, ModuleError> {
        let lock = self
            .load_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // A concurrent load may have won the race while we waited.
        if let Some(module) = self.loaded.get(name) {
            return Ok(module.clone());
        }

        let record = self
            .storage
            .find_module(name)?
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        match self.compile(name, &record.source_file) {
            Ok(module) => {
                let module = Arc::new(module);
                self.loaded.insert(name.to_string(), module.clone());
                self.storage.update_module_status(name, ModuleStatus::Run)?;
                info!(module = name, "plugin loaded");
                Ok(module)
            }
            Err(err) => {
                if let Err(status_err) = self.storage.update_module_status(name, ModuleStatus::Error) {
                    warn!(module = name, %status_err, "could not record module error status");
                }
                Err(err)
            }
        }
    }

    fn compile(&self, name: &str, source_file: &str) -> Result<LoadedModule, ModuleError> {
        let path = self.resolve(source_file);
        if !path.exists() {
            return Err(ModuleError::SourceMissing {
                name: name.to_string(),
                path,
            });
        }

        let source = fs::read_to_string(&path).map_err(|err| ModuleError::Load {
            name: name.to_string(),
            error: err.to_string(),
        })?;

        let ast = plugin_engine().compile(&source).map_err(|err| ModuleError::Load {
            name: name.to_string(),
            error: err.to_string(),
        })?;

        Ok(LoadedModule {
            name: name.to_string(),
            ast,
        })
    }

    fn resolve(&self, source_file: &str) -> PathBuf {
        let path = Path::new(source_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.plugin_root.join(path)
        }
    }
}

/// Rhai reports a missing function as `"name (type, ...)"`; nested
/// lookups inside the plugin carry the nested name instead.
fn signature_names(signature: &str, function: &str) -> bool {
    signature
        .split('(')
        .next()
        .map(str::trim)
        .is_some_and(|head| head == function)
}
