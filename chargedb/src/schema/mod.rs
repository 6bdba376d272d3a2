mod types;
mod parser;
pub mod drift;
mod registry;

pub use types::*;
pub use parser::{parse_schema, parse_schema_str};
pub use registry::{RegistryEntry, SchemaRegistry};
