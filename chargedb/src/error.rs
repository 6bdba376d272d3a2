use crate::validation::Violation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChargeDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Document failed validation for '{collection}': {}", join_violations(.violations))]
    Validation {
        collection: String,
        violations: Vec<Violation>,
    },

    #[error("Not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Collection '{0}' does not exist")]
    CollectionNotFound(String),

    #[error("View '{0}' is read-only")]
    ReadOnlyView(String),

    #[error("Cannot provision user '{user}': {reason}")]
    Auth { user: String, reason: AuthFailure },

    #[error(
        "Index conflict on {collection}.{name}: existing {existing}, requested {requested}"
    )]
    IndexConflict {
        collection: String,
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Duplicate key in '{collection}': {detail}")]
    DuplicateKey { collection: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

/// Why a user could not be provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    AlreadyExists,
    UnknownRole(String),
    PasswordHash(String),
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::AlreadyExists => write!(f, "user already exists"),
            AuthFailure::UnknownRole(role) => write!(f, "unknown role '{role}'"),
            AuthFailure::PasswordHash(msg) => write!(f, "password hashing failed: {msg}"),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ChargeDbError>;
