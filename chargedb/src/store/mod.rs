use crate::error::{AuthFailure, ChargeDbError, Result};
use crate::index::IndexSpec;
use crate::model::Document;
use crate::provision::{AdminTarget, CreateOutcome};
use crate::retention::PurgeEvent;
use crate::schema::{AutoIdStrategy, CollectionDefinition, ViewDefinition};
use crate::system_db::{CatalogKind, CatalogRecord, SystemDb, UserRecord};
use crate::util::{compare_values, lookup_path};
use crate::validation::{CompiledValidator, Constraint, Violation};
use crate::view::execute_pipeline;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Roles a user may be granted
pub const KNOWN_ROLES: &[&str] = &["root", "dbOwner", "readWrite", "read"];

const DATABASE_KEY: &str = "database";

/// Equality filter over document fields, e.g. zone + vehicle class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// Add a `field == value` term. Field paths may be dotted.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((field.into(), value.into()));
        self
    }

    pub fn terms(&self) -> &[(String, Value)] {
        &self.terms
    }

    /// Numbers compare by value, so `5` matches `5.0` as it does in SQLite.
    pub fn matches(&self, doc: &Value) -> bool {
        self.terms.iter().all(|(field, value)| {
            lookup_path(doc, field).is_some_and(|actual| compare_values(actual, value) == Ordering::Equal)
        })
    }
}

/// The embedded document store.
/// One SQLite file holds the catalog (database binding, users, collections,
/// views, indexes) and the documents. Validators are compiled from the stored
/// collection definitions on first use.
pub struct Store {
    db: SystemDb,
    path: Option<PathBuf>,
    validators: RefCell<HashMap<String, Option<Arc<CompiledValidator>>>>,
}

impl Store {
    /// Open or create a store file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = SystemDb::open(path)?;
        Ok(Store {
            db,
            path: Some(path.to_path_buf()),
            validators: RefCell::new(HashMap::new()),
        })
    }

    /// Open a throwaway in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Store {
            db: SystemDb::open_in_memory()?,
            path: None,
            validators: RefCell::new(HashMap::new()),
        })
    }

    /// The file backing this store, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The database this store is bound to, if provisioning has started
    pub fn database(&self) -> Result<Option<String>> {
        self.db.get_meta(DATABASE_KEY)
    }

    // ── Catalog lookups ──────────────────────────────────────────────

    fn catalog(&self, name: &str) -> Result<CatalogRecord> {
        self.db
            .get_catalog(name)?
            .ok_or_else(|| ChargeDbError::CollectionNotFound(name.to_string()))
    }

    /// The stored definition of a writable collection
    fn writable(&self, collection: &str) -> Result<CollectionDefinition> {
        let record = self.catalog(collection)?;
        if record.kind == CatalogKind::View {
            return Err(ChargeDbError::ReadOnlyView(collection.to_string()));
        }
        Ok(serde_json::from_str(&record.definition_json)?)
    }

    fn validator(
        &self,
        collection: &str,
        definition: &CollectionDefinition,
    ) -> Result<Option<Arc<CompiledValidator>>> {
        if let Some(cached) = self.validators.borrow().get(collection) {
            return Ok(cached.clone());
        }
        let compiled = if definition.has_validator() {
            Some(Arc::new(CompiledValidator::compile(collection, definition)?))
        } else {
            None
        };
        self.validators
            .borrow_mut()
            .insert(collection.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .list_catalog(CatalogKind::Collection)?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    pub fn list_views(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .list_catalog(CatalogKind::View)?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    /// The stored definition of a view
    pub fn view_definition(&self, name: &str) -> Result<ViewDefinition> {
        let record = self.catalog(name)?;
        if record.kind != CatalogKind::View {
            return Err(ChargeDbError::Other(format!("'{name}' is a collection, not a view")));
        }
        Ok(serde_json::from_str(&record.definition_json)?)
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.catalog(collection)?;
        self.db.list_indexes(collection)
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.db.list_users()
    }

    /// Check a password against the stored Argon2 hash.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<bool> {
        let Some(record) = self.db.get_user(user)? else {
            return Ok(false);
        };
        let parsed = match PasswordHash::new(&record.password_hash) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(false),
        };
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Insert a document, generating `_id` when absent. Returns the ID.
    pub fn insert(&self, collection: &str, mut doc: Value) -> Result<String> {
        let definition = self.writable(collection)?;

        let Some(object) = doc.as_object_mut() else {
            return Err(ChargeDbError::Validation {
                collection: collection.to_string(),
                violations: vec![Violation {
                    field: String::new(),
                    constraint: Constraint::NotAnObject,
                }],
            });
        };

        let id = match object.get("_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(ChargeDbError::Other(format!(
                    "'_id' must be a string or a number, got {other}"
                )))
            }
            None => {
                let id = generate_id(definition.auto_id());
                object.insert("_id".into(), Value::String(id.clone()));
                id
            }
        };

        if let Some(validator) = self.validator(collection, &definition)? {
            validator.enforce(&doc)?;
        }

        self.db
            .insert_document(collection, &id, &doc)
            .map_err(|e| constraint_to_duplicate(collection, e))?;
        Ok(id)
    }

    /// Insert many documents, all or nothing.
    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<String>> {
        self.db.begin_transaction()?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.insert(collection, doc) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.db.rollback_transaction()?;
                    return Err(e);
                }
            }
        }
        self.db.commit_transaction()?;
        Ok(ids)
    }

    /// Insert a typed document. Returns the ID.
    pub fn insert_document<T: Serialize>(&self, collection: &str, data: &T) -> Result<String> {
        self.insert(collection, serde_json::to_value(data)?)
    }

    /// Delete a document by ID.
    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.writable(collection)?;
        if !self.db.delete_document(collection, id)? {
            return Err(ChargeDbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Get a document by ID.
    pub fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.catalog(collection)?;
        self.db
            .get_document(collection, id)?
            .ok_or_else(|| ChargeDbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?
            .parse_data()
    }

    /// Get a typed document by ID.
    pub fn get_document<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Document<T>> {
        Document::from_value(self.get(collection, id)?)
    }

    /// All documents of a collection (or all rows of a view).
    pub fn list(&self, collection: &str) -> Result<Vec<Value>> {
        let record = self.catalog(collection)?;
        match record.kind {
            CatalogKind::View => self.read_view(collection),
            CatalogKind::Collection => self
                .db
                .list_documents(collection)?
                .iter()
                .map(|r| r.parse_data())
                .collect(),
        }
    }

    /// Documents matching an equality filter. On a collection the lookup runs
    /// through SQLite so declared indexes apply; on a view it filters the rows.
    pub fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        let record = self.catalog(collection)?;
        match record.kind {
            CatalogKind::View => Ok(self
                .read_view(collection)?
                .into_iter()
                .filter(|row| filter.matches(row))
                .collect()),
            CatalogKind::Collection => self
                .db
                .find_documents(collection, filter.terms())?
                .iter()
                .map(|r| r.parse_data())
                .collect(),
        }
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.catalog(collection)?;
        self.db.count_documents(collection)
    }

    /// Compute a view from the current contents of its source collection.
    pub fn read_view(&self, name: &str) -> Result<Vec<Value>> {
        let definition = self.view_definition(name)?;
        let docs = self
            .db
            .list_documents(&definition.source)?
            .iter()
            .map(|r| r.parse_data())
            .collect::<Result<Vec<_>>>()?;
        Ok(execute_pipeline(&definition.pipeline, docs))
    }

    /// Compute a view and deserialize each row.
    pub fn read_view_as<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        self.read_view(name)?
            .into_iter()
            .map(|row| Ok(serde_json::from_value(row)?))
            .collect()
    }

    // ── Retention ────────────────────────────────────────────────────

    /// Delete every document whose retention-indexed date is older than
    /// `now - horizon`. Missing or unparseable dates are left alone.
    /// Returns one event per retention index swept.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<PurgeEvent>> {
        let mut events = Vec::new();

        for collection in self.list_collections()? {
            for spec in self.db.list_indexes(&collection)? {
                let (Some(field), Some(secs)) = (spec.retention_field(), spec.expire_after_seconds)
                else {
                    continue;
                };
                let Some(cutoff) = i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|horizon| now.checked_sub_signed(horizon))
                else {
                    continue;
                };

                let mut expired = Vec::new();
                for record in self.db.list_documents(&collection)? {
                    let doc = record.parse_data()?;
                    let date = lookup_path(&doc, field)
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
                    if let Some(date) = date {
                        if date.with_timezone(&Utc) < cutoff {
                            expired.push(record.id);
                        }
                    }
                }

                let removed = self.db.delete_documents(&collection, &expired)?;
                events.push(PurgeEvent {
                    collection: collection.clone(),
                    index: spec.name.clone(),
                    cutoff,
                    removed,
                });
            }
        }

        Ok(events)
    }

    // ── Operator queries ─────────────────────────────────────────────

    /// Database binding, collection counts and indexes, views and users.
    pub fn status(&self) -> Result<Value> {
        let mut collections = serde_json::Map::new();
        for name in self.list_collections()? {
            let indexes: Vec<String> = self
                .db
                .list_indexes(&name)?
                .iter()
                .map(|s| s.name.clone())
                .collect();
            collections.insert(
                name.clone(),
                serde_json::json!({
                    "count": self.db.count_documents(&name)?,
                    "indexes": indexes,
                }),
            );
        }

        let users: Vec<String> = self.list_users()?.into_iter().map(|u| u.name).collect();

        Ok(serde_json::json!({
            "database": self.database()?,
            "collections": collections,
            "views": self.list_views()?,
            "users": users,
        }))
    }

    /// Re-check stored documents against the current validators.
    /// Returns a report of validation results.
    pub fn validate_all(&self) -> Result<Value> {
        let mut results = serde_json::Map::new();

        for name in self.list_collections()? {
            let definition = self.writable(&name)?;
            let records = self.db.list_documents(&name)?;
            let mut issues = Vec::new();

            if let Some(validator) = self.validator(&name, &definition)? {
                for record in &records {
                    let vr = validator.validate(&record.parse_data()?);
                    if !vr.is_ok() || vr.has_warnings() {
                        let mut entry = serde_json::Map::new();
                        entry.insert("id".into(), Value::String(record.id.clone()));
                        if !vr.errors.is_empty() {
                            entry.insert("errors".into(), violations_json(&vr.errors));
                        }
                        if !vr.warnings.is_empty() {
                            entry.insert("warnings".into(), violations_json(&vr.warnings));
                        }
                        issues.push(Value::Object(entry));
                    }
                }
            }

            results.insert(
                name,
                serde_json::json!({
                    "total": records.len(),
                    "issues": issues,
                }),
            );
        }

        Ok(Value::Object(results))
    }
}

impl AdminTarget for Store {
    fn bind_database(&self, name: &str) -> Result<CreateOutcome> {
        match self.db.get_meta(DATABASE_KEY)? {
            None => {
                self.db.set_meta(DATABASE_KEY, name)?;
                Ok(CreateOutcome::Created)
            }
            Some(bound) if bound == name => Ok(CreateOutcome::Existed),
            Some(bound) => Err(ChargeDbError::Schema(format!(
                "Store is bound to database '{bound}', not '{name}'"
            ))),
        }
    }

    fn create_user(&self, name: &str, roles: &[String], password: &str) -> Result<()> {
        let auth = |reason| ChargeDbError::Auth {
            user: name.to_string(),
            reason,
        };
        if let Some(role) = roles.iter().find(|r| !KNOWN_ROLES.contains(&r.as_str())) {
            return Err(auth(AuthFailure::UnknownRole(role.clone())));
        }
        if self.db.get_user(name)?.is_some() {
            return Err(auth(AuthFailure::AlreadyExists));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| auth(AuthFailure::PasswordHash(e.to_string())))?
            .to_string();

        if !self.db.insert_user(name, &hash, roles)? {
            return Err(auth(AuthFailure::AlreadyExists));
        }
        Ok(())
    }

    fn create_collection(&self, name: &str, definition: &CollectionDefinition) -> Result<CreateOutcome> {
        // compile first so a bad declaration never reaches the catalog
        if definition.has_validator() {
            CompiledValidator::compile(name, definition)?;
        }
        let json = serde_json::to_string(definition)?;
        if self.db.insert_catalog(name, CatalogKind::Collection, &json)? {
            self.validators.borrow_mut().remove(name);
            return Ok(CreateOutcome::Created);
        }

        let existing = self.catalog(name)?;
        if existing.kind == CatalogKind::View {
            return Err(ChargeDbError::Schema(format!(
                "Cannot create collection '{name}': a view with that name exists"
            )));
        }
        let stored: CollectionDefinition = serde_json::from_str(&existing.definition_json)?;
        if stored != *definition {
            log::warn!("Collection '{name}' exists with a different validator; keeping the stored one");
        }
        Ok(CreateOutcome::Existed)
    }

    fn ensure_index(&self, collection: &str, spec: &IndexSpec) -> Result<CreateOutcome> {
        self.writable(collection)?;
        if let Some(existing) = self.db.get_index(collection, &spec.name)? {
            if existing.same_definition(spec) {
                return Ok(CreateOutcome::Existed);
            }
            return Err(ChargeDbError::IndexConflict {
                collection: collection.to_string(),
                name: spec.name.clone(),
                existing: existing.describe(),
                requested: spec.describe(),
            });
        }
        self.db
            .create_index(collection, spec)
            .map_err(|e| constraint_to_duplicate(collection, e))?;
        Ok(CreateOutcome::Created)
    }

    fn insert_seed(&self, collection: &str, doc: &Value) -> Result<CreateOutcome> {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ChargeDbError::Other(format!("Seed for '{collection}' needs a string '_id'")))?;
        self.writable(collection)?;
        if self.db.get_document(collection, id)?.is_some() {
            return Ok(CreateOutcome::Existed);
        }
        self.insert(collection, doc.clone())?;
        Ok(CreateOutcome::Created)
    }

    fn create_view(&self, name: &str, definition: &ViewDefinition) -> Result<CreateOutcome> {
        let source = self.catalog(&definition.source)?;
        if source.kind != CatalogKind::Collection {
            return Err(ChargeDbError::Schema(format!(
                "View '{name}': source '{}' is not a collection",
                definition.source
            )));
        }

        let json = serde_json::to_string(definition)?;
        if self.db.insert_catalog(name, CatalogKind::View, &json)? {
            return Ok(CreateOutcome::Created);
        }

        let existing = self.catalog(name)?;
        if existing.kind == CatalogKind::Collection {
            return Err(ChargeDbError::Schema(format!(
                "Cannot create view '{name}': a collection with that name exists"
            )));
        }
        let stored: ViewDefinition = serde_json::from_str(&existing.definition_json)?;
        if stored != *definition {
            log::warn!("View '{name}' exists with a different pipeline; keeping the stored one");
        }
        Ok(CreateOutcome::Existed)
    }

    fn database_name(&self) -> Result<Option<String>> {
        self.database()
    }

    fn has_user(&self, name: &str) -> Result<bool> {
        Ok(self.db.get_user(name)?.is_some())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(matches!(
            self.db.get_catalog(name)?,
            Some(CatalogRecord { kind: CatalogKind::Collection, .. })
        ))
    }

    fn has_index(&self, collection: &str, name: &str) -> Result<bool> {
        Ok(self.db.get_index(collection, name)?.is_some())
    }

    fn has_document(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.db.get_document(collection, id)?.is_some())
    }

    fn has_view(&self, name: &str) -> Result<bool> {
        Ok(matches!(
            self.db.get_catalog(name)?,
            Some(CatalogRecord { kind: CatalogKind::View, .. })
        ))
    }
}

fn generate_id(strategy: AutoIdStrategy) -> String {
    match strategy {
        AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
        AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
        AutoIdStrategy::Nanoid => nanoid::nanoid!(),
    }
}

fn constraint_to_duplicate(collection: &str, err: ChargeDbError) -> ChargeDbError {
    match err {
        ChargeDbError::Sqlite(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ChargeDbError::DuplicateKey {
                collection: collection.to_string(),
                detail: msg.unwrap_or_else(|| e.to_string()),
            }
        }
        other => other,
    }
}

fn violations_json(violations: &[Violation]) -> Value {
    Value::Array(
        violations
            .iter()
            .map(|v| Value::String(v.to_string()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::model::{Agent, SimulationRun};
    use crate::schema::{IndexKey, SchemaRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// A store with the production collections, indexes and views in place
    fn setup_test_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        let registry = SchemaRegistry::new(Profile::Production.definition().unwrap()).unwrap();
        store.bind_database(registry.database()).unwrap();
        for entry in registry.entries() {
            store.create_collection(&entry.name, &entry.definition).unwrap();
            for spec in &entry.indexes {
                store.ensure_index(&entry.name, spec).unwrap();
            }
        }
        for view in registry.views() {
            store.create_view(&view.name, &view.definition()).unwrap();
        }
        store
    }

    fn session(charger_id: i64, playa: &str, energy: f64, timestamp: &str) -> Value {
        json!({
            "charger_id": charger_id,
            "vehicle_type": if playa == "Playa_Motos" { "moto" } else { "mototaxi" },
            "playa": playa,
            "energy_kwh": energy,
            "timestamp": timestamp,
        })
    }

    fn expect_violation(err: ChargeDbError, field: &str, keyword: &str) {
        match err {
            ChargeDbError::Validation { violations, .. } => {
                assert!(
                    violations
                        .iter()
                        .any(|v| v.field == field && v.constraint.keyword() == keyword),
                    "expected {field}/{keyword}, got {violations:?}"
                );
            }
            other => panic!("expected a validation error, got {other}"),
        }
    }

    #[test]
    fn test_session_without_timestamp_rejected() {
        let store = setup_test_store();
        let mut doc = session(1, "Playa_Motos", 2.0, "2024-03-01T10:00:00Z");
        doc.as_object_mut().unwrap().remove("timestamp");

        let err = store.insert("charging_sessions", doc).unwrap_err();
        expect_violation(err, "timestamp", "required");
        assert_eq!(store.count("charging_sessions").unwrap(), 0);
    }

    #[test]
    fn test_charger_id_boundaries() {
        let store = setup_test_store();
        for id in [0, 129] {
            let err = store
                .insert("charging_sessions", session(id, "Playa_Motos", 1.0, "2024-03-01T10:00:00Z"))
                .unwrap_err();
            expect_violation(err, "charger_id", if id == 0 { "minimum" } else { "maximum" });
        }
        for id in [1, 128] {
            store
                .insert("charging_sessions", session(id, "Playa_Motos", 1.0, "2024-03-01T10:00:00Z"))
                .unwrap();
        }
        assert_eq!(store.count("charging_sessions").unwrap(), 2);
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let store = setup_test_store();
        let err = store
            .insert(
                "simulations",
                json!({ "agent": "DQN", "episodes": 3, "total_reward": 1.5, "timestamp": "2024-03-01T00:00:00Z" }),
            )
            .unwrap_err();
        expect_violation(err, "agent", "enum");
    }

    #[test]
    fn test_simulation_without_timestamp_rejected() {
        let store = setup_test_store();
        let err = store
            .insert(
                "simulations",
                json!({ "_id": "r1", "agent": "SAC", "episodes": 1, "total_reward": 1.0 }),
            )
            .unwrap_err();
        expect_violation(err, "timestamp", "required");
        assert_eq!(store.count("simulations").unwrap(), 0);

        store
            .insert(
                "simulations",
                json!({ "_id": "r1", "agent": "SAC", "episodes": 1, "total_reward": 1.0, "timestamp": "2024-03-01T00:00:00Z" }),
            )
            .unwrap();
        let run: Document<SimulationRun> = store.get_document("simulations", "r1").unwrap();
        assert_eq!(run.data.agent, Agent::Sac);
    }

    #[test]
    fn test_open_schema_accepts_undeclared_fields() {
        let store = setup_test_store();
        let mut doc = session(7, "Playa_Mototaxis", 3.5, "2024-03-01T10:00:00Z");
        doc["power_kw"] = json!(3.0);
        let id = store.insert("charging_sessions", doc).unwrap();

        let stored = store.get("charging_sessions", &id).unwrap();
        assert_eq!(stored["power_kw"], json!(3.0));
        assert_eq!(stored["_id"], json!(id));
    }

    #[test]
    fn test_agent_metrics_are_schemaless() {
        let store = setup_test_store();
        store
            .insert("agent_metrics", json!({ "agent_name": "SAC", "episode": 4, "anything": [1, 2] }))
            .unwrap();
        let found = store
            .find("agent_metrics", &Filter::new().eq("agent_name", "SAC").eq("episode", 4))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_non_object_rejected() {
        let store = setup_test_store();
        let err = store.insert("agent_metrics", json!([1, 2, 3])).unwrap_err();
        expect_violation(err, "", "document");
    }

    #[test]
    fn test_write_to_missing_collection() {
        let store = setup_test_store();
        let err = store.insert("chargers", json!({})).unwrap_err();
        assert!(matches!(err, ChargeDbError::CollectionNotFound(name) if name == "chargers"));
    }

    #[test]
    fn test_views_are_read_only() {
        let store = setup_test_store();
        let err = store.insert("daily_stats", json!({ "sessions": 1 })).unwrap_err();
        assert!(matches!(err, ChargeDbError::ReadOnlyView(_)));
        let err = store.delete("agent_performance", "SAC").unwrap_err();
        assert!(matches!(err, ChargeDbError::ReadOnlyView(_)));
    }

    #[test]
    fn test_daily_stats_groups_by_day_and_zone() {
        let store = setup_test_store();
        store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();
        store
            .insert("charging_sessions", session(2, "Playa_Motos", 3.0, "2024-03-01T19:30:00Z"))
            .unwrap();

        let rows = store.read_view("daily_stats").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_id"], json!({ "date": "2024-03-01", "playa": "Playa_Motos" }));
        assert_eq!(rows[0]["sessions"], json!(2));
        assert_eq!(rows[0]["total_energy_kwh"], json!(5.0));
    }

    #[test]
    fn test_views_reflect_current_data() {
        let store = setup_test_store();
        let id = store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();
        assert_eq!(store.read_view("daily_stats").unwrap().len(), 1);

        store.delete("charging_sessions", &id).unwrap();
        assert!(store.read_view("daily_stats").unwrap().is_empty());
    }

    #[test]
    fn test_agent_performance_orders_by_mean_co2() {
        let store = setup_test_store();
        store
            .insert_many(
                "simulations",
                vec![
                    json!({ "agent": "SAC", "episodes": 10, "total_reward": 100.0, "co2_emissions_kg": 10.0, "timestamp": "2024-03-01T00:00:00Z" }),
                    json!({ "agent": "PPO", "episodes": 10, "total_reward": 80.0, "co2_emissions_kg": 5.0, "timestamp": "2024-03-01T00:00:00Z" }),
                ],
            )
            .unwrap();

        let agents: Vec<Value> = store
            .read_view("agent_performance")
            .unwrap()
            .into_iter()
            .map(|row| row["_id"].clone())
            .collect();
        assert_eq!(agents, vec![json!("PPO"), json!("SAC")]);
    }

    #[test]
    fn test_insert_many_is_all_or_nothing() {
        let store = setup_test_store();
        let err = store
            .insert_many(
                "simulations",
                vec![
                    json!({ "agent": "A2C", "episodes": 1, "total_reward": 1.0, "timestamp": "2024-03-01T00:00:00Z" }),
                    json!({ "agent": "A2C", "episodes": 0, "total_reward": 1.0, "timestamp": "2024-03-01T00:00:00Z" }),
                ],
            )
            .unwrap_err();
        expect_violation(err, "episodes", "minimum");
        assert_eq!(store.count("simulations").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_id_is_duplicate_key() {
        let store = setup_test_store();
        store.insert("agent_metrics", json!({ "_id": "m1" })).unwrap();
        let err = store.insert("agent_metrics", json!({ "_id": "m1" })).unwrap_err();
        assert!(matches!(err, ChargeDbError::DuplicateKey { .. }));
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let store = setup_test_store();
        let spec = IndexSpec {
            name: "run_id_1".into(),
            keys: vec![IndexKey::asc("run_id")],
            unique: true,
            expire_after_seconds: None,
        };
        store.ensure_index("agent_metrics", &spec).unwrap();
        store.insert("agent_metrics", json!({ "run_id": "r1" })).unwrap();
        let err = store.insert("agent_metrics", json!({ "run_id": "r1" })).unwrap_err();
        assert!(matches!(err, ChargeDbError::DuplicateKey { .. }));
    }

    #[test]
    fn test_ensure_index_idempotent_and_conflicting() {
        let store = setup_test_store();
        let existing = store.list_indexes("charging_sessions").unwrap();
        for spec in &existing {
            assert_eq!(
                store.ensure_index("charging_sessions", spec).unwrap(),
                CreateOutcome::Existed
            );
        }
        assert_eq!(store.list_indexes("charging_sessions").unwrap(), existing);

        let mut changed = existing[0].clone();
        changed.keys.reverse();
        let err = store.ensure_index("charging_sessions", &changed).unwrap_err();
        assert!(matches!(err, ChargeDbError::IndexConflict { .. }));
    }

    #[test]
    fn test_find_uses_compound_filter() {
        let store = setup_test_store();
        store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();
        store
            .insert("charging_sessions", session(120, "Playa_Mototaxis", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();

        let found = store
            .find(
                "charging_sessions",
                &Filter::new().eq("playa", "Playa_Mototaxis").eq("vehicle_type", "mototaxi"),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["charger_id"], json!(120));
    }

    #[test]
    fn test_find_numbers_match_across_int_and_float() {
        let store = setup_test_store();
        store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();
        store
            .insert("charging_sessions", session(2, "Playa_Motos", 3.0, "2024-03-01T09:00:00Z"))
            .unwrap();

        let rows = store
            .find("daily_stats", &Filter::new().eq("total_energy_kwh", 5))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["sessions"], json!(2));

        let docs = store
            .find("charging_sessions", &Filter::new().eq("energy_kwh", 3))
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["charger_id"], json!(2));

        assert!(!Filter::new().eq("energy_kwh", 3).matches(&json!({})));
    }

    #[test]
    fn test_purge_expired_with_short_horizon() {
        let store = setup_test_store();
        let now = Utc::now();
        // same collection behind a one-hour horizon
        let store_short = Store::open_in_memory().unwrap();
        store_short
            .create_collection("charging_sessions", &CollectionDefinition::schemaless())
            .unwrap();
        store_short
            .ensure_index(
                "charging_sessions",
                &IndexSpec {
                    name: "timestamp_1".into(),
                    keys: vec![IndexKey::asc("timestamp")],
                    unique: false,
                    expire_after_seconds: Some(3600),
                },
            )
            .unwrap();
        let old = (now - chrono::Duration::hours(2)).to_rfc3339();
        let fresh = (now - chrono::Duration::minutes(5)).to_rfc3339();
        store_short
            .insert_many(
                "charging_sessions",
                vec![
                    json!({ "_id": "old", "timestamp": old }),
                    json!({ "_id": "fresh", "timestamp": fresh }),
                    json!({ "_id": "undated" }),
                    json!({ "_id": "garbled", "timestamp": "yesterday" }),
                ],
            )
            .unwrap();

        let events = store_short.purge_expired(now).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].removed, 1);
        assert_eq!(store_short.count("charging_sessions").unwrap(), 3);
        assert!(store_short.get("charging_sessions", "old").is_err());

        // production horizon is a year: nothing recent expires
        store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, &fresh))
            .unwrap();
        let events = store.purge_expired(now).unwrap();
        assert_eq!(events.iter().map(|e| e.removed).sum::<usize>(), 0);
    }

    #[test]
    fn test_create_user_and_authenticate() {
        let store = Store::open_in_memory().unwrap();
        let roles = vec!["dbOwner".to_string()];
        store.create_user("iquitos_admin", &roles, "s3cret").unwrap();

        assert!(store.authenticate("iquitos_admin", "s3cret").unwrap());
        assert!(!store.authenticate("iquitos_admin", "wrong").unwrap());
        assert!(!store.authenticate("nobody", "s3cret").unwrap());

        let user = &store.list_users().unwrap()[0];
        assert!(user.password_hash.starts_with("$argon2"));

        let err = store.create_user("iquitos_admin", &roles, "other").unwrap_err();
        assert!(matches!(
            err,
            ChargeDbError::Auth { reason: AuthFailure::AlreadyExists, .. }
        ));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .create_user("ops", &["superuser".to_string()], "pw")
            .unwrap_err();
        assert!(matches!(
            err,
            ChargeDbError::Auth { reason: AuthFailure::UnknownRole(role), .. } if role == "superuser"
        ));
    }

    #[test]
    fn test_bind_database() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.bind_database("iquitos_ev").unwrap(), CreateOutcome::Created);
        assert_eq!(store.bind_database("iquitos_ev").unwrap(), CreateOutcome::Existed);
        assert!(store.bind_database("other").is_err());
    }

    #[test]
    fn test_create_collection_keeps_stored_definition() {
        let store = Store::open_in_memory().unwrap();
        let first = CollectionDefinition::schemaless();
        assert_eq!(store.create_collection("infrastructure", &first).unwrap(), CreateOutcome::Created);

        let mut second = first.clone();
        second.additional_properties = false;
        assert_eq!(store.create_collection("infrastructure", &second).unwrap(), CreateOutcome::Existed);

        // still open: the stored definition wins
        store.insert("infrastructure", json!({ "anything": 1 })).unwrap();
    }

    #[test]
    fn test_insert_seed_is_idempotent() {
        let store = setup_test_store();
        let seed = json!({ "_id": "iquitos_ev_mall", "tariff_usd_kwh": 0.2 });
        assert_eq!(store.insert_seed("infrastructure", &seed).unwrap(), CreateOutcome::Created);
        assert_eq!(store.insert_seed("infrastructure", &seed).unwrap(), CreateOutcome::Existed);
        assert_eq!(store.count("infrastructure").unwrap(), 1);
    }

    #[test]
    fn test_validate_all_reports_issues() {
        let store = setup_test_store();
        store
            .insert("charging_sessions", session(1, "Playa_Motos", 2.0, "2024-03-01T08:00:00Z"))
            .unwrap();

        let report = store.validate_all().unwrap();
        assert_eq!(report["charging_sessions"]["total"], json!(1));
        assert_eq!(report["charging_sessions"]["issues"], json!([]));
    }

    #[test]
    fn test_status() {
        let store = setup_test_store();
        let status = store.status().unwrap();
        assert_eq!(status["database"], json!("iquitos_ev"));
        assert_eq!(status["collections"]["charging_sessions"]["count"], json!(0));
        assert_eq!(status["views"], json!(["agent_performance", "daily_stats"]));
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("chargedb.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store
                .create_collection("agent_metrics", &CollectionDefinition::schemaless())
                .unwrap();
            store.insert("agent_metrics", json!({ "_id": "m1", "reward": 3 })).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(store.get("agent_metrics", "m1").unwrap()["reward"], json!(3));
    }
}
