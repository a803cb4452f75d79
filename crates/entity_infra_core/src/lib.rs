//! Entity infrastructure core.
//!
//! Pure domain logic shared by every storage adapter: the rows of the four
//! infrastructure stores, the cumulative permission scale, the four-source
//! permission resolver and the batch reference resolver. Storage is reached
//! only through the [`PermissionFacts`] and [`NameLookup`] port traits.

pub mod config;
pub mod error;
pub mod level;
pub mod permission;
pub mod reference;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ResolverConfig, DEFAULT_ALL_INSTANCES_ID, MAX_PARENT_VIEW_DEPTH};
pub use error::{EntityError, Result};
pub use level::{level_value, PermissionLevel, NO_ACCESS};
pub use permission::{
    PermissionBreakdown, PermissionFacts, PermissionResolver, PermissionSource, SourceLevel,
};
pub use reference::{
    collect_references, parse_reference_field, NameLookup, ReferenceField, ReferenceKind,
    ReferenceResolver, ReferenceSet, ResolvedName, ResolvedReferences,
};
pub use types::{
    validate_identifier, validate_type_code, EntityInstance, EntityLink, EntityPermission,
    EntityType, InstanceRef, InstanceScope, Payload, PrincipalKind, DEFAULT_RELATIONSHIP,
};
