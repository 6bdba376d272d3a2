pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod provision;
pub mod retention;
pub mod schema;
pub mod store;
pub mod system_db;
pub mod validation;
pub mod view;
mod util;

pub use config::{Credentials, Profile};
pub use error::{ChargeDbError, Result};
pub use model::Document;
pub use provision::{AdminTarget, ProvisionFailure, ProvisionReport, ProvisionState, Provisioner};
pub use retention::RetentionMonitor;
pub use schema::{SchemaDefinition, SchemaRegistry};
pub use store::{Filter, Store};
