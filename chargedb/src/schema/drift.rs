//! Divergence report between two schema profiles.
//!
//! The production and development profiles intentionally differ (the development
//! profile has no retention index and a lighter session schema). This module lists
//! those differences so drift stays visible; it never changes a database.

use super::types::{CollectionDefinition, SchemaDefinition};
use crate::index::IndexSpec;
use std::collections::BTreeSet;

/// A single difference between a base profile and another profile
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileDrift {
    CollectionOnlyInBase { name: String },
    CollectionOnlyInOther { name: String },
    FieldOnlyInBase { collection: String, field: String },
    FieldOnlyInOther { collection: String, field: String },
    FieldTypeDiffers { collection: String, field: String },
    RequiredDiffers { collection: String, field: String, base_required: bool },
    EnumDiffers { collection: String, field: String },
    BoundsDiffer { collection: String, field: String },
    IndexOnlyInBase { collection: String, index: String },
    IndexOnlyInOther { collection: String, index: String },
    RetentionDiffers {
        collection: String,
        base: Option<u64>,
        other: Option<u64>,
    },
    ViewOnlyInBase { name: String },
    ViewOnlyInOther { name: String },
    ViewDiffers { name: String },
}

impl ProfileDrift {
    /// Human-readable description of this difference.
    pub fn describe(&self) -> String {
        match self {
            ProfileDrift::CollectionOnlyInBase { name } => {
                format!("Collection '{name}' only in base profile")
            }
            ProfileDrift::CollectionOnlyInOther { name } => {
                format!("Collection '{name}' only in other profile")
            }
            ProfileDrift::FieldOnlyInBase { collection, field } => {
                format!("Field '{collection}.{field}' only in base profile")
            }
            ProfileDrift::FieldOnlyInOther { collection, field } => {
                format!("Field '{collection}.{field}' only in other profile")
            }
            ProfileDrift::FieldTypeDiffers { collection, field } => {
                format!("Field '{collection}.{field}' has a different type")
            }
            ProfileDrift::RequiredDiffers {
                collection,
                field,
                base_required,
            } => {
                let (b, o) = if *base_required {
                    ("required", "optional")
                } else {
                    ("optional", "required")
                };
                format!("Field '{collection}.{field}' is {b} in base, {o} in other")
            }
            ProfileDrift::EnumDiffers { collection, field } => {
                format!("Field '{collection}.{field}' enumerates different values")
            }
            ProfileDrift::BoundsDiffer { collection, field } => {
                format!("Field '{collection}.{field}' has different numeric bounds")
            }
            ProfileDrift::IndexOnlyInBase { collection, index } => {
                format!("Index '{collection}.{index}' only in base profile")
            }
            ProfileDrift::IndexOnlyInOther { collection, index } => {
                format!("Index '{collection}.{index}' only in other profile")
            }
            ProfileDrift::RetentionDiffers {
                collection,
                base,
                other,
            } => format!(
                "Retention on '{collection}': base {}, other {}",
                horizon(*base),
                horizon(*other)
            ),
            ProfileDrift::ViewOnlyInBase { name } => format!("View '{name}' only in base profile"),
            ProfileDrift::ViewOnlyInOther { name } => {
                format!("View '{name}' only in other profile")
            }
            ProfileDrift::ViewDiffers { name } => format!("View '{name}' has a different pipeline"),
        }
    }
}

fn horizon(secs: Option<u64>) -> String {
    match secs {
        Some(s) => format!("{s}s"),
        None => "none".to_string(),
    }
}

/// Compare two profiles and list every divergence.
pub fn diff_profiles(base: &SchemaDefinition, other: &SchemaDefinition) -> Vec<ProfileDrift> {
    let mut drift = Vec::new();

    let base_names: BTreeSet<&String> = base.collections.keys().collect();
    let other_names: BTreeSet<&String> = other.collections.keys().collect();

    for name in base_names.difference(&other_names) {
        drift.push(ProfileDrift::CollectionOnlyInBase {
            name: (*name).clone(),
        });
    }
    for name in other_names.difference(&base_names) {
        drift.push(ProfileDrift::CollectionOnlyInOther {
            name: (*name).clone(),
        });
    }
    for name in base_names.intersection(&other_names) {
        diff_collection(
            name,
            &base.collections[*name],
            &other.collections[*name],
            &mut drift,
        );
    }

    let base_views: BTreeSet<&String> = base.views.keys().collect();
    let other_views: BTreeSet<&String> = other.views.keys().collect();
    for name in base_views.difference(&other_views) {
        drift.push(ProfileDrift::ViewOnlyInBase {
            name: (*name).clone(),
        });
    }
    for name in other_views.difference(&base_views) {
        drift.push(ProfileDrift::ViewOnlyInOther {
            name: (*name).clone(),
        });
    }
    for name in base_views.intersection(&other_views) {
        if base.views[*name] != other.views[*name] {
            drift.push(ProfileDrift::ViewDiffers {
                name: (*name).clone(),
            });
        }
    }

    drift
}

fn diff_collection(
    name: &str,
    base: &CollectionDefinition,
    other: &CollectionDefinition,
    drift: &mut Vec<ProfileDrift>,
) {
    let collection = name.to_string();

    let base_fields: BTreeSet<&String> = base.fields.keys().collect();
    let other_fields: BTreeSet<&String> = other.fields.keys().collect();

    for field in base_fields.difference(&other_fields) {
        drift.push(ProfileDrift::FieldOnlyInBase {
            collection: collection.clone(),
            field: (*field).clone(),
        });
    }
    for field in other_fields.difference(&base_fields) {
        drift.push(ProfileDrift::FieldOnlyInOther {
            collection: collection.clone(),
            field: (*field).clone(),
        });
    }
    for field in base_fields.intersection(&other_fields) {
        let b = &base.fields[*field];
        let o = &other.fields[*field];
        let field = (*field).clone();

        if b.field_type != o.field_type {
            drift.push(ProfileDrift::FieldTypeDiffers {
                collection: collection.clone(),
                field: field.clone(),
            });
        }
        if b.required != o.required {
            drift.push(ProfileDrift::RequiredDiffers {
                collection: collection.clone(),
                field: field.clone(),
                base_required: b.required,
            });
        }
        if b.enum_values != o.enum_values {
            drift.push(ProfileDrift::EnumDiffers {
                collection: collection.clone(),
                field: field.clone(),
            });
        }
        if b.minimum != o.minimum || b.maximum != o.maximum {
            drift.push(ProfileDrift::BoundsDiffer {
                collection: collection.clone(),
                field,
            });
        }
    }

    let base_indexes: Vec<IndexSpec> = base.indexes.iter().map(IndexSpec::from_definition).collect();
    let other_indexes: Vec<IndexSpec> =
        other.indexes.iter().map(IndexSpec::from_definition).collect();

    for spec in &base_indexes {
        if !other_indexes.iter().any(|o| o.name == spec.name) {
            drift.push(ProfileDrift::IndexOnlyInBase {
                collection: collection.clone(),
                index: spec.name.clone(),
            });
        }
    }
    for spec in &other_indexes {
        if !base_indexes.iter().any(|b| b.name == spec.name) {
            drift.push(ProfileDrift::IndexOnlyInOther {
                collection: collection.clone(),
                index: spec.name.clone(),
            });
        }
    }

    let base_retention = base_indexes.iter().find_map(|s| s.expire_after_seconds);
    let other_retention = other_indexes.iter().find_map(|s| s.expire_after_seconds);
    if base_retention != other_retention {
        drift.push(ProfileDrift::RetentionDiffers {
            collection,
            base: base_retention,
            other: other_retention,
        });
    }
}
