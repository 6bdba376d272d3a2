use crate::error::{ChargeDbError, Result};
use crate::schema::{CollectionDefinition, FieldDefinition, FieldType};
use crate::util::{lookup_path, type_name};
use regex::Regex;
use serde_json::Value;
use std::fmt;

/// A single constraint a document failed
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: String,
    pub constraint: Constraint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Required,
    Type { expected: FieldType, actual: &'static str },
    Minimum { limit: f64, actual: f64 },
    Maximum { limit: f64, actual: f64 },
    Enum { allowed: Vec<Value>, actual: Value },
    Pattern { pattern: String, actual: String },
    AdditionalProperty,
    NotAnObject,
}

impl Constraint {
    /// Stable constraint keyword, useful for callers matching on the failure
    pub fn keyword(&self) -> &'static str {
        match self {
            Constraint::Required => "required",
            Constraint::Type { .. } => "type",
            Constraint::Minimum { .. } => "minimum",
            Constraint::Maximum { .. } => "maximum",
            Constraint::Enum { .. } => "enum",
            Constraint::Pattern { .. } => "pattern",
            Constraint::AdditionalProperty => "additional_properties",
            Constraint::NotAnObject => "document",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = &self.field;
        match &self.constraint {
            Constraint::Required => write!(f, "'{field}' is required"),
            Constraint::Type { expected, actual } => {
                write!(f, "'{field}' expected {expected}, got {actual}")
            }
            Constraint::Minimum { limit, actual } => {
                write!(f, "'{field}' value {actual} is below minimum {limit}")
            }
            Constraint::Maximum { limit, actual } => {
                write!(f, "'{field}' value {actual} is above maximum {limit}")
            }
            Constraint::Enum { allowed, actual } => {
                let allowed: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                write!(f, "'{field}' value {actual} is not one of [{}]", allowed.join(", "))
            }
            Constraint::Pattern { pattern, actual } => {
                write!(f, "'{field}' value '{actual}' does not match /{pattern}/")
            }
            Constraint::AdditionalProperty => {
                write!(f, "unexpected field '{field}' (additional_properties is false)")
            }
            Constraint::NotAnObject => write!(f, "document must be an object"),
        }
    }
}

/// Result of validating a document
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<Violation>,
    pub warnings: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    fn add_issue(&mut self, strict: bool, violation: Violation) {
        if strict {
            self.errors.push(violation);
        } else {
            self.warnings.push(violation);
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    definition: FieldDefinition,
    pattern: Option<Regex>,
}

/// An executable predicate compiled from a collection's field declarations.
/// Strict validators produce errors; non-strict ones only produce warnings.
#[derive(Debug, Clone)]
pub struct CompiledValidator {
    collection: String,
    strict: bool,
    additional_properties: bool,
    fields: Vec<CompiledField>,
}

impl CompiledValidator {
    /// Compile a collection declaration. Rejects declarations that can never be
    /// satisfied consistently (inverted bounds, bounds or patterns on the wrong type,
    /// enum values of the wrong type, invalid regexes).
    pub fn compile(collection: &str, definition: &CollectionDefinition) -> Result<Self> {
        let mut fields = Vec::with_capacity(definition.fields.len());

        for (name, field_def) in &definition.fields {
            check_declaration(collection, name, field_def)?;
            let pattern = field_def
                .pattern
                .as_deref()
                .map(|p| Regex::new(p))
                .transpose()?;
            fields.push(CompiledField {
                name: name.clone(),
                definition: field_def.clone(),
                pattern,
            });
        }

        Ok(CompiledValidator {
            collection: collection.to_string(),
            strict: definition.strict,
            additional_properties: definition.additional_properties,
            fields,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Validate a document. Only declared fields are constrained; undeclared fields
    /// are accepted unless additional properties are disabled.
    pub fn validate(&self, doc: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();

        let Some(object) = doc.as_object() else {
            result.add_issue(
                self.strict,
                Violation {
                    field: String::new(),
                    constraint: Constraint::NotAnObject,
                },
            );
            return result;
        };

        for field in &self.fields {
            let value = lookup_path(doc, &field.name).filter(|v| !v.is_null());
            match value {
                None if field.definition.required => result.add_issue(
                    self.strict,
                    Violation {
                        field: field.name.clone(),
                        constraint: Constraint::Required,
                    },
                ),
                None => {}
                Some(value) => self.check_value(field, value, &mut result),
            }
        }

        if !self.additional_properties {
            for key in object.keys() {
                let declared = key == "_id"
                    || self
                        .fields
                        .iter()
                        .any(|f| f.name == *key || f.name.starts_with(&format!("{key}.")));
                if !declared {
                    result.add_issue(
                        self.strict,
                        Violation {
                            field: key.clone(),
                            constraint: Constraint::AdditionalProperty,
                        },
                    );
                }
            }
        }

        result
    }

    fn check_value(&self, field: &CompiledField, value: &Value, result: &mut ValidationResult) {
        let def = &field.definition;
        let violation = |constraint| Violation {
            field: field.name.clone(),
            constraint,
        };

        if !matches_type(def.field_type, value) {
            result.add_issue(
                self.strict,
                violation(Constraint::Type {
                    expected: def.field_type,
                    actual: type_name(value),
                }),
            );
            return;
        }

        if let Some(allowed) = &def.enum_values {
            if !allowed.iter().any(|a| enum_matches(a, value)) {
                result.add_issue(
                    self.strict,
                    violation(Constraint::Enum {
                        allowed: allowed.clone(),
                        actual: value.clone(),
                    }),
                );
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(limit) = def.minimum {
                if number < limit {
                    result.add_issue(
                        self.strict,
                        violation(Constraint::Minimum {
                            limit,
                            actual: number,
                        }),
                    );
                }
            }
            if let Some(limit) = def.maximum {
                if number > limit {
                    result.add_issue(
                        self.strict,
                        violation(Constraint::Maximum {
                            limit,
                            actual: number,
                        }),
                    );
                }
            }
        }

        if let (Some(regex), Some(s)) = (&field.pattern, value.as_str()) {
            if !regex.is_match(s) {
                result.add_issue(
                    self.strict,
                    violation(Constraint::Pattern {
                        pattern: regex.as_str().to_string(),
                        actual: s.to_string(),
                    }),
                );
            }
        }
    }

    /// Validate and turn errors into a `Validation` error for the writer.
    /// Returns the warnings of a non-strict validator.
    pub fn enforce(&self, doc: &Value) -> Result<Vec<Violation>> {
        let result = self.validate(doc);
        if !result.is_ok() {
            return Err(ChargeDbError::Validation {
                collection: self.collection.clone(),
                violations: result.errors,
            });
        }
        for warning in &result.warnings {
            log::warn!("{}: accepted with validation warning: {warning}", self.collection);
        }
        Ok(result.warnings)
    }
}

fn check_declaration(collection: &str, name: &str, def: &FieldDefinition) -> Result<()> {
    let fail = |msg: String| Err(ChargeDbError::Schema(format!("{collection}.{name}: {msg}")));

    if (def.minimum.is_some() || def.maximum.is_some()) && !def.field_type.is_numeric() {
        return fail(format!("minimum/maximum need a numeric type, not {}", def.field_type));
    }
    if let (Some(min), Some(max)) = (def.minimum, def.maximum) {
        if min > max {
            return fail(format!("minimum {min} is greater than maximum {max}"));
        }
    }
    if def.pattern.is_some() && def.field_type != FieldType::String {
        return fail(format!("pattern needs a string type, not {}", def.field_type));
    }
    if let Some(values) = &def.enum_values {
        if values.is_empty() {
            return fail("enum must list at least one value".into());
        }
        if let Some(bad) = values.iter().find(|v| !matches_type(def.field_type, v)) {
            return fail(format!("enum value {bad} is not a {}", def.field_type));
        }
    }
    Ok(())
}

fn matches_type(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Int => value.is_i64() || value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date => value
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        FieldType::Object => value.is_object(),
        FieldType::List => value.is_array(),
    }
}

fn enum_matches(allowed: &Value, value: &Value) -> bool {
    match (allowed.as_f64(), value.as_f64()) {
        (Some(a), Some(v)) => a == v,
        _ => allowed == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use serde_json::json;

    fn sessions_validator() -> CompiledValidator {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  charging_sessions:
    fields:
      charger_id: { type: int, required: true, minimum: 1, maximum: 128 }
      vehicle_type: { type: string, required: true, enum: [moto, mototaxi] }
      playa: { type: string, required: true, enum: [Playa_Motos, Playa_Mototaxis] }
      energy_kwh: { type: number, required: true, minimum: 0 }
      duration_minutes: { type: int, minimum: 0 }
      co2_kg: { type: number }
      timestamp: { type: date, required: true }
  events:
    fields:
      kind: { type: string, required: true, pattern: "^[a-z_]+$" }
    additional_properties: false
    strict: false
"#,
        )
        .unwrap();
        CompiledValidator::compile(
            "charging_sessions",
            &schema.collections["charging_sessions"],
        )
        .unwrap()
    }

    fn valid_session() -> Value {
        json!({
            "charger_id": 12,
            "vehicle_type": "moto",
            "playa": "Playa_Motos",
            "energy_kwh": 2.5,
            "timestamp": "2024-06-01T10:00:00Z"
        })
    }

    fn keywords(result: &ValidationResult) -> Vec<(&str, &str)> {
        result
            .errors
            .iter()
            .map(|v| (v.field.as_str(), v.constraint.keyword()))
            .collect()
    }

    #[test]
    fn test_valid_session() {
        let result = sessions_validator().validate(&valid_session());
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_timestamp_rejected() {
        let mut doc = valid_session();
        doc.as_object_mut().unwrap().remove("timestamp");
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("timestamp", "required")]);
    }

    #[test]
    fn test_null_required_field_counts_as_missing() {
        let mut doc = valid_session();
        doc["energy_kwh"] = Value::Null;
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("energy_kwh", "required")]);
    }

    #[test]
    fn test_charger_id_bounds() {
        let validator = sessions_validator();
        for (id, ok) in [(0, false), (1, true), (128, true), (129, false)] {
            let mut doc = valid_session();
            doc["charger_id"] = json!(id);
            assert_eq!(validator.validate(&doc).is_ok(), ok, "charger_id = {id}");
        }

        let mut doc = valid_session();
        doc["charger_id"] = json!(129);
        let result = validator.validate(&doc);
        assert_eq!(keywords(&result), vec![("charger_id", "maximum")]);
    }

    #[test]
    fn test_int_field_rejects_fraction_without_coercion() {
        let mut doc = valid_session();
        doc["charger_id"] = json!(3.5);
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("charger_id", "type")]);
    }

    #[test]
    fn test_enum_rejected() {
        let mut doc = valid_session();
        doc["vehicle_type"] = json!("bus");
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("vehicle_type", "enum")]);
        assert!(result.errors[0].to_string().contains("bus"));
    }

    #[test]
    fn test_negative_energy_rejected() {
        let mut doc = valid_session();
        doc["energy_kwh"] = json!(-0.1);
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("energy_kwh", "minimum")]);
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let mut doc = valid_session();
        doc["timestamp"] = json!("yesterday");
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("timestamp", "type")]);
    }

    #[test]
    fn test_undeclared_fields_allowed() {
        let mut doc = valid_session();
        doc["soc_start_pct"] = json!(20);
        doc["notes"] = json!({ "free": "form" });
        assert!(sessions_validator().validate(&doc).is_ok());
    }

    #[test]
    fn test_optional_field_still_constrained() {
        let mut doc = valid_session();
        doc["duration_minutes"] = json!(-5);
        let result = sessions_validator().validate(&doc);
        assert_eq!(keywords(&result), vec![("duration_minutes", "minimum")]);
    }

    #[test]
    fn test_non_strict_mode_warnings() {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  events:
    fields:
      kind: { type: string, required: true, pattern: "^[a-z_]+$" }
    additional_properties: false
    strict: false
"#,
        )
        .unwrap();
        let validator = CompiledValidator::compile("events", &schema.collections["events"]).unwrap();

        let result = validator.validate(&json!({ "kind": "Not Snake", "extra": 1 }));
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 2);
        assert!(validator.enforce(&json!({ "kind": "Bad Kind" })).is_ok());
    }

    #[test]
    fn test_enforce_reports_collection_and_field() {
        let mut doc = valid_session();
        doc["charger_id"] = json!(0);
        let err = sessions_validator().enforce(&doc).unwrap_err();
        match err {
            ChargeDbError::Validation {
                collection,
                violations,
            } => {
                assert_eq!(collection, "charging_sessions");
                assert_eq!(violations[0].field, "charger_id");
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_non_object_document() {
        let result = sessions_validator().validate(&json!([1, 2, 3]));
        assert_eq!(result.errors[0].constraint, Constraint::NotAnObject);
    }

    #[test]
    fn test_compile_rejects_inverted_bounds() {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  broken:
    fields:
      pct: { type: number, minimum: 100, maximum: 0 }
"#,
        )
        .unwrap();
        let err = CompiledValidator::compile("broken", &schema.collections["broken"]).unwrap_err();
        assert!(err.to_string().contains("broken.pct"));
    }

    #[test]
    fn test_compile_rejects_enum_of_wrong_type() {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  broken:
    fields:
      agent: { type: string, enum: [SAC, 3] }
"#,
        )
        .unwrap();
        assert!(CompiledValidator::compile("broken", &schema.collections["broken"]).is_err());
    }
}
