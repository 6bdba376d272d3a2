use super::types::{CollectionDefinition, SchemaDefinition, UserDefinition};
use crate::error::{ChargeDbError, Result};
use crate::index::{self, IndexSpec};
use crate::util::is_safe_path;
use crate::validation::CompiledValidator;
use crate::view::{build_views, AggregationView};
use std::collections::{BTreeMap, HashSet};

/// Everything the provisioning engine needs to know about one collection
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub definition: CollectionDefinition,
    /// `None` for schema-less collections
    pub validator: Option<CompiledValidator>,
    pub indexes: Vec<IndexSpec>,
}

/// Collection name -> validation rules and required indexes, plus the declared
/// users and views. Built once from a profile and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    definition: SchemaDefinition,
    entries: BTreeMap<String, RegistryEntry>,
    views: Vec<AggregationView>,
}

impl SchemaRegistry {
    /// Check the whole declaration and compile validators and index plans
    pub fn new(definition: SchemaDefinition) -> Result<Self> {
        if !is_plain_name(&definition.database) {
            return Err(ChargeDbError::Schema(format!(
                "Invalid database name '{}'",
                definition.database
            )));
        }

        let mut seen_users = HashSet::new();
        for user in &definition.users {
            if user.name.trim().is_empty() {
                return Err(ChargeDbError::Schema("User name may not be empty".into()));
            }
            if !seen_users.insert(user.name.as_str()) {
                return Err(ChargeDbError::Schema(format!(
                    "User '{}' declared twice",
                    user.name
                )));
            }
        }

        let mut entries = BTreeMap::new();
        for (name, collection) in &definition.collections {
            if !is_plain_name(name) {
                return Err(ChargeDbError::Schema(format!(
                    "Invalid collection name '{name}'"
                )));
            }
            let validator = if collection.has_validator() {
                Some(CompiledValidator::compile(name, collection)?)
            } else {
                None
            };
            let indexes = index::plan(name, collection)?;
            entries.insert(
                name.clone(),
                RegistryEntry {
                    name: name.clone(),
                    definition: collection.clone(),
                    validator,
                    indexes,
                },
            );
        }

        let views = build_views(&definition)?;

        Ok(SchemaRegistry {
            definition,
            entries,
            views,
        })
    }

    pub fn database(&self) -> &str {
        &self.definition.database
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn users(&self) -> &[UserDefinition] {
        &self.definition.users
    }

    /// Collections in provisioning order
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn get(&self, collection: &str) -> Option<&RegistryEntry> {
        self.entries.get(collection)
    }

    pub fn views(&self) -> &[AggregationView] {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&AggregationView> {
        self.views.iter().find(|v| v.name == name)
    }
}

fn is_plain_name(name: &str) -> bool {
    is_safe_path(name) && !name.contains('.')
}
