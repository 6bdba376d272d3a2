use crate::error::{ChargeDbError, Result};
use crate::index::IndexSpec;
use crate::schema::Direction;
use crate::util::is_safe_path;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a catalog entry is a stored collection or a read-only view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Collection,
    View,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Collection => "collection",
            CatalogKind::View => "view",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "collection" => Ok(CatalogKind::Collection),
            "view" => Ok(CatalogKind::View),
            other => Err(ChargeDbError::Other(format!("Unknown catalog kind '{other}'"))),
        }
    }
}

/// The SQLite file behind a store: catalog (database name, users, collections,
/// views, indexes) and the documents themselves.
pub struct SystemDb {
    conn: Connection,
}

impl SystemDb {
    /// Open or create the system database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open an in-memory system database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                name TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                roles_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                definition_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS indexes (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                spec_json TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            );

            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            ",
        )?;
        Ok(())
    }

    // ── Meta ─────────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(result)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Insert a user. Returns false when the name is already taken.
    pub fn insert_user(&self, name: &str, password_hash: &str, roles: &[String]) -> Result<bool> {
        let roles_json = serde_json::to_string(roles)?;
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO users (name, password_hash, roles_json) VALUES (?1, ?2, ?3)",
            params![name, password_hash, roles_json],
        )?;
        Ok(changed == 1)
    }

    pub fn get_user(&self, name: &str) -> Result<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, password_hash, roles_json FROM users WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((name, password_hash, roles_json)) => Ok(Some(UserRecord {
                name,
                password_hash,
                roles: serde_json::from_str(&roles_json)?,
            })),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM users ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut users = Vec::with_capacity(names.len());
        for name in names {
            if let Some(user) = self.get_user(&name)? {
                users.push(user);
            }
        }
        Ok(users)
    }

    // ── Catalog ──────────────────────────────────────────────────────

    /// Register a collection or view. Returns false when the name is already taken.
    pub fn insert_catalog(&self, name: &str, kind: CatalogKind, definition_json: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO collections (name, kind, definition_json) VALUES (?1, ?2, ?3)",
            params![name, kind.as_str(), definition_json],
        )?;
        Ok(changed == 1)
    }

    pub fn get_catalog(&self, name: &str) -> Result<Option<CatalogRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, kind, definition_json FROM collections WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((name, kind, definition_json)) => Ok(Some(CatalogRecord {
                name,
                kind: CatalogKind::parse(&kind)?,
                definition_json,
            })),
            None => Ok(None),
        }
    }

    /// Catalog entries of one kind, ordered by name.
    pub fn list_catalog(&self, kind: CatalogKind) -> Result<Vec<CatalogRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, definition_json FROM collections WHERE kind = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok(CatalogRecord {
                name: row.get(0)?,
                kind,
                definition_json: row.get(1)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ── Indexes ──────────────────────────────────────────────────────

    pub fn get_index(&self, collection: &str, name: &str) -> Result<Option<IndexSpec>> {
        let spec_json: Option<String> = self
            .conn
            .query_row(
                "SELECT spec_json FROM indexes WHERE collection = ?1 AND name = ?2",
                params![collection, name],
                |row| row.get(0),
            )
            .optional()?;
        match spec_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Build the SQLite index and record it in the catalog, in one transaction.
    pub fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<()> {
        let ddl = index_ddl(collection, spec)?;
        let spec_json = serde_json::to_string(spec)?;
        log::debug!("{ddl}");

        self.begin_transaction()?;
        let result = self.conn.execute_batch(&ddl).and_then(|_| {
            self.conn.execute(
                "INSERT INTO indexes (collection, name, spec_json) VALUES (?1, ?2, ?3)",
                params![collection, spec.name, spec_json],
            )
        });
        match result {
            Ok(_) => self.commit_transaction(),
            Err(e) => {
                self.rollback_transaction()?;
                Err(e.into())
            }
        }
    }

    /// Index specs recorded for a collection, in creation order.
    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        let mut stmt = self.conn.prepare(
            "SELECT spec_json FROM indexes WHERE collection = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;

        let mut specs = Vec::new();
        for row in rows {
            specs.push(serde_json::from_str(&row?)?);
        }
        Ok(specs)
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Insert a new document. A duplicate `(collection, id)` surfaces as a
    /// SQLite constraint violation.
    pub fn insert_document(&self, collection: &str, id: &str, data: &serde_json::Value) -> Result<()> {
        let data_json = serde_json::to_string(data)?;
        self.conn.execute(
            "INSERT INTO documents (collection, id, data_json) VALUES (?1, ?2, ?3)",
            params![collection, id, data_json],
        )?;
        Ok(())
    }

    /// Get a document by collection and id.
    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<DocumentRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, collection, data_json FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| {
                    Ok(DocumentRecord {
                        id: row.get(0)?,
                        collection: row.get(1)?,
                        data_json: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// List all documents in a collection.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<DocumentRecord>> {
        self.query_documents(
            "SELECT id, collection, data_json FROM documents WHERE collection = ?1 ORDER BY id",
            &[rusqlite::types::Value::Text(collection.to_string())],
        )
    }

    /// Documents whose fields equal the given values. The collection is inlined
    /// as a literal so the partial expression indexes are usable.
    pub fn find_documents(
        &self,
        collection: &str,
        filter: &[(String, serde_json::Value)],
    ) -> Result<Vec<DocumentRecord>> {
        if !is_safe_path(collection) {
            return Err(ChargeDbError::Schema(format!(
                "Invalid collection name '{collection}'"
            )));
        }

        let mut sql = format!(
            "SELECT id, collection, data_json FROM documents WHERE collection = '{collection}'"
        );
        let mut values = Vec::with_capacity(filter.len());
        for (i, (field, value)) in filter.iter().enumerate() {
            if !is_safe_path(field) {
                return Err(ChargeDbError::Schema(format!("Invalid field path '{field}'")));
            }
            sql.push_str(&format!(" AND {} = ?{}", field_expr(field), i + 1));
            values.push(crate::util::json_to_sql(value));
        }
        sql.push_str(" ORDER BY id");

        self.query_documents(&sql, &values)
    }

    fn query_documents(&self, sql: &str, values: &[rusqlite::types::Value]) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok(DocumentRecord {
                id: row.get(0)?,
                collection: row.get(1)?,
                data_json: row.get(2)?,
            })
        })?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    pub fn count_documents(&self, collection: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete a document. Returns whether it existed.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(changed == 1)
    }

    /// Delete many documents in one transaction. Returns how many were removed.
    pub fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.begin_transaction()?;
        let mut removed = 0;
        for id in ids {
            match self.delete_document(collection, id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.rollback_transaction()?;
                    return Err(e);
                }
            }
        }
        self.commit_transaction()?;
        Ok(removed)
    }

    // ── Transaction Support ──────────────────────────────────────────

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

/// A user row. Only the Argon2 PHC hash of the password is kept.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub password_hash: String,
    pub roles: Vec<String>,
}

/// A row from the collections catalog
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub name: String,
    pub kind: CatalogKind,
    pub definition_json: String,
}

/// A record from the documents table
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub collection: String,
    pub data_json: String,
}

impl DocumentRecord {
    /// Parse the stored JSON data
    pub fn parse_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.data_json)?)
    }
}

fn field_expr(field: &str) -> String {
    format!("json_extract(data_json, '$.{field}')")
}

/// SQLite object name for a declared index. Names are global in SQLite, so the
/// collection is part of it.
pub fn sqlite_index_name(collection: &str, index: &str) -> String {
    let sanitized: String = index
        .chars()
        .map(|c| match c {
            '-' => 'm',
            c if c.is_ascii_alphanumeric() => c,
            _ => '_',
        })
        .collect();
    format!("ix_{collection}_{sanitized}")
}

/// `CREATE INDEX` statement for a declared index: a partial expression index
/// over the collection's documents.
pub fn index_ddl(collection: &str, spec: &IndexSpec) -> Result<String> {
    if !is_safe_path(collection) || collection.contains('.') {
        return Err(ChargeDbError::Schema(format!(
            "Invalid collection name '{collection}'"
        )));
    }

    let mut columns = Vec::with_capacity(spec.keys.len());
    for key in &spec.keys {
        if !is_safe_path(&key.field) {
            return Err(ChargeDbError::Schema(format!(
                "Invalid field path '{}'",
                key.field
            )));
        }
        let mut column = field_expr(&key.field);
        if key.direction == Direction::Descending {
            column.push_str(" DESC");
        }
        columns.push(column);
    }

    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS \"{}\" ON documents({}) WHERE collection = '{collection}'",
        if spec.unique { "UNIQUE " } else { "" },
        sqlite_index_name(collection, &spec.name),
        columns.join(", "),
    ))
}
