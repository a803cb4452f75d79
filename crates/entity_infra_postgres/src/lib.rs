//! PostgreSQL adapter for the entity infrastructure.
//!
//! Read-side stores are cheap `PgPool` wrappers. Writes to the registry,
//! link and permission tables are only reachable through
//! [`PgEntityLifecycle`], which runs them on its own transaction.

mod error;
mod rows;

pub mod facts;
pub mod lifecycle;
pub mod links;
pub mod permissions;
pub mod predicate;
pub mod primary;
pub mod registry;
pub mod types;

pub use facts::{PgPermissionFacts, PgPermissionResolver};
pub use lifecycle::{
    CreateEntity, CreatedEntity, DeleteEntity, DeletedEntity, ParentRef, PgEntityLifecycle,
    UpdateEntity, UpdatedEntity,
};
pub use links::{LinkedInstance, PgLinkStore};
pub use permissions::{GrantRequest, PgPermissionStore};
pub use predicate::{permission_predicate, PermissionPredicate, INSTANCE_ID_COLUMN};
pub use primary::{ConventionalPrimaryTable, PrimaryRecord, PrimaryTable};
pub use registry::PgInstanceRegistry;
pub use types::{NewEntityType, PgEntityTypeStore};
