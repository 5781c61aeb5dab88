use std::collections::HashSet;
use std::fs;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{Block, ModuleRecord};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("could not read flow file {path}: {error}")]
    Io { path: String, error: String },
    #[error("could not parse flow file: {0}")]
    Parse(String),
    #[error("duplicate block id {0}")]
    DuplicateBlockId(i64),
    #[error("duplicate module `{0}`")]
    DuplicateModule(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A declarative conversation flow: the blocks and plugin registrations
/// the engine is seeded with. Authored as YAML, typically exported by
/// the visual editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockDefinition {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub start: bool,
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleDefinition {
    pub name: String,
    pub file: String,
}

impl FlowDefinition {
    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let text = fs::read_to_string(path).map_err(|err| FlowError::Io {
            path: path.display().to_string(),
            error: err.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, FlowError> {
        let flow: FlowDefinition =
            serde_yaml_bw::from_str(text).map_err(|err| FlowError::Parse(err.to_string()))?;
        flow.validate()?;
        Ok(flow)
    }

    /// Exactly one start block is recommended, not enforced: the engine
    /// resolves multiples deterministically and reports the missing
    /// case itself on first contact.
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut ids = HashSet::new();
        for block in &self.blocks {
            if !ids.insert(block.id) {
                return Err(FlowError::DuplicateBlockId(block.id));
            }
        }

        let mut names = HashSet::new();
        for module in &self.modules {
            if !names.insert(module.name.as_str()) {
                return Err(FlowError::DuplicateModule(module.name.clone()));
            }
        }

        let starts = self.blocks.iter().filter(|b| b.start).count();
        if starts != 1 {
            warn!(title = %self.title, starts, "flow does not declare exactly one start block");
        }
        Ok(())
    }

    /// Writes every block and module registration into storage.
    pub fn seed(&self, storage: &dyn Storage) -> Result<(), FlowError> {
        for block in &self.blocks {
            storage.insert_block(Block::new(block.id, &block.name, &block.script, block.start))?;
        }
        for module in &self.modules {
            storage.insert_module(ModuleRecord::new(&module.name, &module.file))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const FLOW: &str = r#"
title: Welcome
description: Smallest useful flow.
blocks:
  - id: 1
    name: menu
    start: true
    script: |
      if event == "enter" {
          send_message("Hello");
      }
  - id: 2
    name: next
    script: |
      go_to(1);
modules:
  - name: calc
    file: calc.rhai
"#;

    #[test]
    fn test_parse_and_seed() {
        let flow = FlowDefinition::from_yaml(FLOW).unwrap();
        assert_eq!(flow.blocks.len(), 2);
        assert!(flow.blocks[0].start);
        assert!(!flow.blocks[1].start);

        let storage = MemoryStorage::new();
        flow.seed(storage.as_ref()).unwrap();

        assert_eq!(storage.find_start_block().unwrap().unwrap().id, 1);
        assert!(storage.find_block(2).unwrap().is_some());
        assert!(storage.find_module("calc").unwrap().is_some());
    }

    #[test]
    fn test_duplicate_block_id_rejected() {
        let text = r#"
title: Broken
blocks:
  - id: 1
    name: a
    script: ""
  - id: 1
    name: b
    script: ""
"#;
        assert!(matches!(
            FlowDefinition::from_yaml(text),
            Err(FlowError::DuplicateBlockId(1))
        ));
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let text = r#"
title: Broken
blocks:
  - id: 1
    name: a
    script: ""
modules:
  - name: calc
    file: a.rhai
  - name: calc
    file: b.rhai
"#;
        assert!(matches!(
            FlowDefinition::from_yaml(text),
            Err(FlowError::DuplicateModule(_))
        ));
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        assert!(matches!(
            FlowDefinition::from_yaml("title: [unclosed"),
            Err(FlowError::Parse(_))
        ));
    }
}
