//! Rows of the four infrastructure stores and the small value types shared
//! between the resolvers and the Postgres adapter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::{EntityError, Result};
use crate::level::PermissionLevel;

/// Relationship tag used when a child is created under a parent.
pub const DEFAULT_RELATIONSHIP: &str = "contains";

/// Opaque business payload. The core only reads the name/code fields.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Longest identifier Postgres accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub code: String,
    pub name: String,
    pub icon: Option<String>,
    pub child_type_codes: Vec<String>,
    pub active: bool,
}

impl EntityType {
    pub fn allows_child(&self, child_type: &str) -> bool {
        self.child_type_codes.iter().any(|c| c == child_type)
    }
}

/// Registry row: one per live business record, across all types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInstance {
    pub id: Uuid,
    pub type_code: String,
    pub instance_id: Uuid,
    pub display_name: String,
    pub business_code: Option<String>,
}

impl EntityInstance {
    pub fn instance_ref(&self) -> InstanceRef {
        InstanceRef::new(self.type_code.clone(), self.instance_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLink {
    pub id: Uuid,
    pub parent_type_code: String,
    pub parent_instance_id: Uuid,
    pub child_type_code: String,
    pub child_instance_id: Uuid,
    pub relationship_type: String,
}

impl EntityLink {
    pub fn parent(&self) -> InstanceRef {
        InstanceRef::new(self.parent_type_code.clone(), self.parent_instance_id)
    }

    pub fn child(&self) -> InstanceRef {
        InstanceRef::new(self.child_type_code.clone(), self.child_instance_id)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPermission {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub principal_kind: PrincipalKind,
    pub type_code: String,
    /// Either a real instance id or the reserved all-instances id.
    pub instance_id: Uuid,
    pub level: PermissionLevel,
    pub granted_by: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntityPermission {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// A `(type, id)` pair naming one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceRef {
    pub type_code: String,
    pub instance_id: Uuid,
}

impl InstanceRef {
    pub fn new(type_code: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            type_code: type_code.into(),
            instance_id,
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_code, self.instance_id)
    }
}

/// What a permission row (or a permission question) is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceScope {
    Instance(Uuid),
    AllInstances,
}

impl InstanceScope {
    /// Maps the reserved id onto `AllInstances` so callers can pass either.
    pub fn from_id(instance_id: Uuid, all_instances_id: Uuid) -> Self {
        if instance_id == all_instances_id {
            Self::AllInstances
        } else {
            Self::Instance(instance_id)
        }
    }

    pub fn to_id(self, all_instances_id: Uuid) -> Uuid {
        match self {
            Self::Instance(id) => id,
            Self::AllInstances => all_instances_id,
        }
    }
}

/// Type codes end up as literals in generated SQL, so they are restricted to
/// lower-case identifiers.
pub fn validate_type_code(code: &str) -> Result<()> {
    validate_identifier("type code", code)
}

pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && value.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(EntityError::validation(format!(
            "{what} '{value}' must match ^[a-z][a-z0-9_]*$ and be at most {MAX_IDENTIFIER_LEN} characters"
        )))
    }
}
