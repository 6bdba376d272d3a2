use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Top-level profile definition parsed from a profile YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub database: String,
    #[serde(default)]
    pub users: Vec<UserDefinition>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDefinition>,
    #[serde(default)]
    pub views: BTreeMap<String, ViewDefinition>,
}

/// An administrative or application user to create at provisioning time.
/// The password is supplied separately through the credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDefinition {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Definition of a single collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default = "default_true")]
    pub additional_properties: bool,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default)]
    pub id: Option<IdConfig>,
}

fn default_true() -> bool {
    true
}

/// Configuration for document ID generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    Ulid,
    Uuid,
    Nanoid,
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Number,
    Boolean,
    Date,
    Object,
    List,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Object => "object",
            FieldType::List => "list",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Number)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared index on a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub keys: Vec<IndexKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
}

/// Sort direction of an index key or a sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// The conventional `1` / `-1` suffix used in index names
    pub fn suffix(&self) -> &'static str {
        match self {
            Direction::Ascending => "1",
            Direction::Descending => "-1",
        }
    }
}

/// A field path with a direction, written `field` or `-field` in YAML.
/// Used both for index keys and for sort stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

pub type SortKey = IndexKey;

impl IndexKey {
    pub fn asc(field: impl Into<String>) -> Self {
        IndexKey {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        IndexKey {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

impl FromStr for IndexKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (field, direction) = match s.strip_prefix('-') {
            Some(rest) => (rest, Direction::Descending),
            None => (s.strip_prefix('+').unwrap_or(s), Direction::Ascending),
        };
        if field.is_empty() {
            return Err(format!("Empty field in key '{s}'"));
        }
        Ok(IndexKey {
            field: field.to_string(),
            direction,
        })
    }
}

impl TryFrom<String> for IndexKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IndexKey> for String {
    fn from(key: IndexKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => write!(f, "{}", self.field),
            Direction::Descending => write!(f, "-{}", self.field),
        }
    }
}

/// A read-only virtual collection backed by an aggregation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub source: String,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub pipeline: Vec<Stage>,
}

/// One stage of an aggregation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Keep documents whose fields equal the given values
    Match(BTreeMap<String, serde_json::Value>),
    Group(GroupStage),
    Sort(Vec<SortKey>),
    Limit(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStage {
    pub by: GroupBy,
    #[serde(default)]
    pub accumulate: BTreeMap<String, Accumulator>,
}

/// Grouping key: a single field path (scalar `_id`) or a map of named keys (object `_id`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupBy {
    Field(String),
    Keys(BTreeMap<String, GroupKey>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupKey {
    Field(String),
    Bucketed { field: String, bucket: DateBucket },
}

impl GroupKey {
    pub fn field(&self) -> &str {
        match self {
            GroupKey::Field(field) => field,
            GroupKey::Bucketed { field, .. } => field,
        }
    }
}

/// Calendar truncation applied to a date-time grouping key (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateBucket {
    Hour,
    Day,
    Month,
}

impl DateBucket {
    pub fn format(&self) -> &'static str {
        match self {
            DateBucket::Hour => "%Y-%m-%dT%H:00",
            DateBucket::Day => "%Y-%m-%d",
            DateBucket::Month => "%Y-%m",
        }
    }
}

/// Per-group accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accumulator {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Accumulator {
    pub fn field(&self) -> Option<&str> {
        match self {
            Accumulator::Count => None,
            Accumulator::Sum(f)
            | Accumulator::Avg(f)
            | Accumulator::Min(f)
            | Accumulator::Max(f) => Some(f),
        }
    }
}

impl SchemaDefinition {
    /// Look up a collection definition by name
    pub fn collection(&self, name: &str) -> Option<&CollectionDefinition> {
        self.collections.get(name)
    }

    /// Replace the horizon of every retention index on a collection.
    /// Returns the number of indexes changed.
    pub fn set_retention_horizon(&mut self, collection: &str, seconds: u64) -> usize {
        let mut changed = 0;
        if let Some(def) = self.collections.get_mut(collection) {
            for index in &mut def.indexes {
                if index.expire_after_seconds.is_some() {
                    index.expire_after_seconds = Some(seconds);
                    changed += 1;
                }
            }
        }
        changed
    }
}

impl CollectionDefinition {
    /// An open, schema-less collection with no indexes
    pub fn schemaless() -> Self {
        CollectionDefinition {
            fields: BTreeMap::new(),
            indexes: Vec::new(),
            additional_properties: true,
            strict: true,
            id: None,
        }
    }

    /// Whether any field constraint is declared
    pub fn has_validator(&self) -> bool {
        !self.fields.is_empty() || !self.additional_properties
    }

    /// The ID strategy for documents inserted without `_id`
    pub fn auto_id(&self) -> AutoIdStrategy {
        self.id
            .as_ref()
            .and_then(|c| c.auto)
            .unwrap_or(AutoIdStrategy::Ulid)
    }
}
