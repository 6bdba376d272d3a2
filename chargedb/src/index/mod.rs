use crate::error::{ChargeDbError, Result};
use crate::schema::{CollectionDefinition, FieldType, IndexDefinition, IndexKey};
use crate::util::is_safe_path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A fully-resolved index specification, ready to be applied to a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
}

impl IndexSpec {
    /// Build a spec from a declaration, deriving the name when none is given
    pub fn from_definition(def: &IndexDefinition) -> Self {
        IndexSpec {
            name: def
                .name
                .clone()
                .unwrap_or_else(|| default_index_name(&def.keys)),
            keys: def.keys.clone(),
            unique: def.unique,
            expire_after_seconds: def.expire_after_seconds,
        }
    }

    /// Whether the store should expire documents through this index
    pub fn is_retention(&self) -> bool {
        self.expire_after_seconds.is_some()
    }

    /// The date field a retention index watches
    pub fn retention_field(&self) -> Option<&str> {
        match (self.expire_after_seconds, self.keys.as_slice()) {
            (Some(_), [key]) => Some(key.field.as_str()),
            _ => None,
        }
    }

    /// Same keys, directions and behaviour flags. The name is not compared.
    pub fn same_definition(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys
            && self.unique == other.unique
            && self.expire_after_seconds == other.expire_after_seconds
    }

    /// One-line description, e.g. `{playa: 1, vehicle_type: 1}`
    pub fn describe(&self) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|k| format!("{}: {}", k.field, k.direction.suffix()))
            .collect();
        let mut out = format!("{{{}}}", keys.join(", "));
        if self.unique {
            out.push_str(" unique");
        }
        if let Some(secs) = self.expire_after_seconds {
            out.push_str(&format!(" expireAfterSeconds={secs}"));
        }
        out
    }
}

/// Default index name: `field_dir` pairs joined by `_`, e.g. `timestamp_-1`
pub fn default_index_name(keys: &[IndexKey]) -> String {
    keys.iter()
        .map(|k| format!("{}_{}", k.field, k.direction.suffix()))
        .collect::<Vec<_>>()
        .join("_")
}

/// Resolve and check the ordered index list declared for a collection.
pub fn plan(collection: &str, definition: &CollectionDefinition) -> Result<Vec<IndexSpec>> {
    let mut specs: Vec<IndexSpec> = Vec::with_capacity(definition.indexes.len());
    let mut names = HashSet::new();

    for def in &definition.indexes {
        let spec = IndexSpec::from_definition(def);
        let fail = |msg: String| {
            Err(ChargeDbError::Schema(format!(
                "Index '{}' on '{collection}': {msg}",
                spec.name
            )))
        };

        if spec.keys.is_empty() {
            return fail("at least one key is required".into());
        }

        let mut fields = HashSet::new();
        for key in &spec.keys {
            if !is_safe_path(&key.field) {
                return fail(format!("invalid field path '{}'", key.field));
            }
            if !fields.insert(key.field.as_str()) {
                return fail(format!("field '{}' appears twice", key.field));
            }
        }

        if let Some(secs) = spec.expire_after_seconds {
            if spec.keys.len() != 1 {
                return fail("a retention index must have exactly one key".into());
            }
            if secs == 0 {
                return fail("retention horizon must be positive".into());
            }
            let field = &spec.keys[0].field;
            if let Some(field_def) = definition.fields.get(field) {
                if field_def.field_type != FieldType::Date {
                    return fail(format!(
                        "retention field '{field}' is declared as {}, not date",
                        field_def.field_type
                    ));
                }
            }
        }

        if !names.insert(spec.name.clone()) {
            return fail("name declared twice".into());
        }
        if let Some(twin) = specs.iter().find(|s| s.same_definition(&spec)) {
            return fail(format!("same keys as index '{}'", twin.name));
        }

        specs.push(spec);
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use crate::schema::Direction;

    fn plan_for(yaml: &str) -> Result<Vec<IndexSpec>> {
        let schema = parse_schema_str(yaml).unwrap();
        plan("charging_sessions", &schema.collections["charging_sessions"])
    }

    #[test]
    fn test_plan_keeps_declaration_order_and_names() {
        let specs = plan_for(
            r#"
database: test
collections:
  charging_sessions:
    fields:
      timestamp: { type: date, required: true }
    indexes:
      - keys: [playa, vehicle_type]
      - keys: ["-timestamp"]
      - keys: [timestamp]
        expire_after_seconds: 31536000
"#,
        )
        .unwrap();

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["playa_1_vehicle_type_1", "timestamp_-1", "timestamp_1"]);
        assert_eq!(specs[1].keys[0].direction, Direction::Descending);
        assert!(specs[2].is_retention());
        assert_eq!(specs[2].retention_field(), Some("timestamp"));
        assert_eq!(specs[2].expire_after_seconds, Some(31_536_000));
    }

    #[test]
    fn test_retention_index_must_be_single_key() {
        let err = plan_for(
            r#"
database: test
collections:
  charging_sessions:
    indexes:
      - keys: [timestamp, playa]
        expire_after_seconds: 60
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one key"));
    }

    #[test]
    fn test_retention_field_must_be_date() {
        let err = plan_for(
            r#"
database: test
collections:
  charging_sessions:
    fields:
      energy_kwh: { type: number }
    indexes:
      - keys: [energy_kwh]
        expire_after_seconds: 60
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not date"));
    }

    #[test]
    fn test_duplicate_declarations_rejected() {
        let err = plan_for(
            r#"
database: test
collections:
  charging_sessions:
    indexes:
      - keys: [playa]
      - keys: [playa]
        name: by_playa
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("same keys"));
    }

    #[test]
    fn test_unsafe_field_rejected() {
        let err = plan_for(
            r#"
database: test
collections:
  charging_sessions:
    indexes:
      - keys: ["playa') --"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid field path"));
    }

    #[test]
    fn test_same_definition_ignores_name() {
        let a = IndexSpec {
            name: "a".into(),
            keys: vec![IndexKey::asc("playa")],
            unique: false,
            expire_after_seconds: None,
        };
        let mut b = a.clone();
        b.name = "b".into();
        assert!(a.same_definition(&b));
        b.expire_after_seconds = Some(10);
        assert!(!a.same_definition(&b));
        assert_eq!(b.describe(), "{playa: 1} expireAfterSeconds=10");
    }
}
