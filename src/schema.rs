use std::{fs, path::Path};

use anyhow::Result;
use bridge_core::{HandshakeMeta, UnifiedEvent};
use schemars::schema_for;
use serde_json::Value;

use crate::{api::GetLogParams, config::BridgeConfig, logger::LoggerEvent, notice::Notice};

/// JSON Schemas of everything that crosses the wire or the config file,
/// keyed by file stem.
pub fn schemas() -> Result<Vec<(&'static str, Value)>> {
    Ok(vec![
        ("unified-event", serde_json::to_value(schema_for!(UnifiedEvent))?),
        ("handshake-meta", serde_json::to_value(schema_for!(HandshakeMeta))?),
        ("logger-event", serde_json::to_value(schema_for!(LoggerEvent))?),
        ("get-log", serde_json::to_value(schema_for!(GetLogParams))?),
        ("notice", serde_json::to_value(schema_for!(Notice))?),
        ("config", serde_json::to_value(schema_for!(BridgeConfig))?),
    ])
}

/// Writes every schema as `<out_dir>/<name>.schema.json`.
pub fn write_schema(out_dir: &Path) -> Result<usize> {
    fs::create_dir_all(out_dir)?;
    let all = schemas()?;
    for (name, schema) in &all {
        let json_text = serde_json::to_string_pretty(schema)?;
        fs::write(out_dir.join(format!("{name}.schema.json")), json_text)?;
    }
    Ok(all.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unified_event_schema_names_the_tag_field() {
        let all = schemas().unwrap();
        let (_, event) = all.iter().find(|(name, _)| *name == "unified-event").unwrap();
        assert!(event["properties"]["type"].is_object(), "{event}");
        assert!(event["properties"]["scene"].is_object());
    }

    #[test]
    fn writes_one_file_per_schema() {
        let dir = tempdir().unwrap();
        let written = write_schema(dir.path()).unwrap();
        assert_eq!(written, schemas().unwrap().len());
        assert!(dir.path().join("handshake-meta.schema.json").exists());
    }
}
