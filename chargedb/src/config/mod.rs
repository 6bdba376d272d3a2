use crate::error::{ChargeDbError, Result};
use crate::model::{InfrastructureConfig, INFRASTRUCTURE};
use crate::schema::{parse_schema_str, SchemaDefinition};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const ADMIN_PASSWORD_ENV: &str = "CHARGEDB_ADMIN_PASSWORD";
pub const DB_PATH_ENV: &str = "CHARGEDB_DB_PATH";
pub const PROFILE_ENV: &str = "CHARGEDB_PROFILE";

pub const DEFAULT_DB_PATH: &str = "chargedb.sqlite";

/// Used when the admin password variable is unset. Insecure; a warning is
/// logged whenever it is used.
pub const DEFAULT_ADMIN_PASSWORD: &str = "changeme";

const PRODUCTION_YAML: &str = include_str!("../../profiles/production.yaml");
const DEVELOPMENT_YAML: &str = include_str!("../../profiles/development.yaml");

/// A named schema configuration. The two profiles differ on purpose; see
/// `schema::drift` for the report of how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Production,
    Development,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Production => "production",
            Profile::Development => "development",
        }
    }

    pub fn yaml(&self) -> &'static str {
        match self {
            Profile::Production => PRODUCTION_YAML,
            Profile::Development => DEVELOPMENT_YAML,
        }
    }

    /// Parse the embedded declaration for this profile
    pub fn definition(&self) -> Result<SchemaDefinition> {
        parse_schema_str(self.yaml())
    }

    /// Documents inserted once at provisioning time
    pub fn seeds(&self, now: DateTime<Utc>) -> Result<Vec<Seed>> {
        let infrastructure = InfrastructureConfig::iquitos(now);
        if !infrastructure.weights.is_normalized() {
            log::warn!(
                "Objective weights sum to {:.3}, not 1.0",
                infrastructure.weights.total()
            );
        }
        Ok(vec![Seed {
            collection: INFRASTRUCTURE.to_string(),
            document: infrastructure.to_document()?,
        }])
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = ChargeDbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Profile::Production),
            "development" | "dev" => Ok(Profile::Development),
            other => Err(ChargeDbError::Other(format!(
                "Unknown profile '{other}' (expected production or development)"
            ))),
        }
    }
}

/// A document inserted if absent during provisioning
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub collection: String,
    pub document: Value,
}

impl Seed {
    pub fn id(&self) -> Option<&str> {
        self.document.get("_id").and_then(Value::as_str)
    }
}

/// A string that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Credentials for the users declared by a profile
#[derive(Debug, Clone)]
pub struct Credentials {
    pub admin_password: Secret,
    /// True when the built-in default password is in use
    pub insecure_default: bool,
}

impl Credentials {
    /// Read credentials from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read credentials through a lookup function, falling back to the
    /// insecure default password with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(ADMIN_PASSWORD_ENV).filter(|p| !p.is_empty()) {
            Some(password) => Credentials {
                admin_password: Secret::new(password),
                insecure_default: false,
            },
            None => {
                log::warn!(
                    "{ADMIN_PASSWORD_ENV} is not set; using the built-in default admin password. \
                     Set it before exposing this database."
                );
                Credentials {
                    admin_password: Secret::new(DEFAULT_ADMIN_PASSWORD),
                    insecure_default: true,
                }
            }
        }
    }
}
