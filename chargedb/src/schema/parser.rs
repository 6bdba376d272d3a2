use super::types::SchemaDefinition;
use crate::error::{ChargeDbError, Result};
use std::path::Path;

/// Load a profile declaration from a YAML file on disk
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content).map_err(|e| match e {
        ChargeDbError::Yaml(inner) => {
            ChargeDbError::Schema(format!("{}: {inner}", path.display()))
        }
        other => other,
    })
}

/// Parse a profile declaration. Structural checks happen in `SchemaRegistry::new`.
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    if schema.database.trim().is_empty() {
        return Err(ChargeDbError::Schema("database name is empty".into()));
    }
    Ok(schema)
}
