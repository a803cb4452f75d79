//! Permission resolution: four sources, two inheritance rules, one fold.

mod resolver;
mod sources;

pub use resolver::{PermissionFacts, PermissionResolver};
pub use sources::{
    direct_grant_level, fold_sources, parent_create_rule, parent_view_rule, role_grant_level,
    PermissionBreakdown, PermissionSource, SourceLevel,
};
