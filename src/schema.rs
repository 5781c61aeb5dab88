use std::fs;
use std::path::PathBuf;

use anyhow::Error;
use schemars::schema_for;

use crate::flow::FlowDefinition;

/// The entry point invoked by `main.rs` for `Commands::Schema`: emits
/// the JSON Schema editors validate flow files against.
pub fn write_schema(out_dir: PathBuf) -> Result<(), Error> {
    fs::create_dir_all(&out_dir)?;

    let flow_schema = schema_for!(FlowDefinition);
    let flow_json = serde_json::to_string_pretty(&flow_schema)?;
    fs::write(out_dir.join("flow.schema.json"), flow_json)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schema_file_is_written() {
        let dir = TempDir::new().unwrap();
        write_schema(dir.path().to_path_buf()).unwrap();

        let text = fs::read_to_string(dir.path().join("flow.schema.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["properties"]["blocks"].is_object());
    }
}
