use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EntityError, Result};
use crate::types::validate_type_code;

/// Default reserved id for type-wide grants: all bits set, never produced by
/// `gen_random_uuid()` or `Uuid::new_v4()`.
pub const DEFAULT_ALL_INSTANCES_ID: Uuid = Uuid::from_u128(u128::MAX);

/// Upper bound on parent-VIEW inheritance depth.
pub const MAX_PARENT_VIEW_DEPTH: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Reserved instance id marking a type-wide grant.
    pub all_instances_id: Uuid,
    /// How many link hops parent-VIEW inheritance may climb. 0 disables it.
    pub parent_view_depth: u8,
    /// Type code of the instances that act as principals.
    pub principal_type: String,
    /// Type code of role instances; role membership is a role → principal link.
    pub role_type: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            all_instances_id: DEFAULT_ALL_INSTANCES_ID,
            parent_view_depth: 1,
            principal_type: "employee".to_string(),
            role_type: "role".to_string(),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parent_view_depth > MAX_PARENT_VIEW_DEPTH {
            return Err(EntityError::validation(format!(
                "parent view depth {} exceeds maximum {MAX_PARENT_VIEW_DEPTH}",
                self.parent_view_depth
            )));
        }
        validate_type_code(&self.principal_type)?;
        validate_type_code(&self.role_type)
    }

    pub fn is_reserved(&self, instance_id: Uuid) -> bool {
        instance_id == self.all_instances_id
    }
}
