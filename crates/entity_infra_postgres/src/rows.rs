//! sqlx row shapes and their conversion into core types.

use chrono::{DateTime, Utc};
use entity_infra_core::{
    EntityError, EntityInstance, EntityLink, EntityPermission, EntityType, PermissionLevel,
    PrincipalKind,
};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const TYPE_COLUMNS: &str = "code, name, icon, child_type_codes, active";
pub(crate) const INSTANCE_COLUMNS: &str =
    "id, type_code, instance_id, display_name, business_code";
pub(crate) const LINK_COLUMNS: &str = "id, parent_type_code, parent_instance_id, \
     child_type_code, child_instance_id, relationship_type";
pub(crate) const PERMISSION_COLUMNS: &str = "id, principal_id, principal_kind, type_code, \
     instance_id, level, granted_by, expires_at";

#[derive(Debug, FromRow)]
pub(crate) struct EntityTypeRow {
    pub code: String,
    pub name: String,
    pub icon: Option<String>,
    pub child_type_codes: Vec<String>,
    pub active: bool,
}

impl From<EntityTypeRow> for EntityType {
    fn from(row: EntityTypeRow) -> Self {
        Self {
            code: row.code,
            name: row.name,
            icon: row.icon,
            child_type_codes: row.child_type_codes,
            active: row.active,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct InstanceRow {
    pub id: Uuid,
    pub type_code: String,
    pub instance_id: Uuid,
    pub display_name: String,
    pub business_code: Option<String>,
}

impl From<InstanceRow> for EntityInstance {
    fn from(row: InstanceRow) -> Self {
        Self {
            id: row.id,
            type_code: row.type_code,
            instance_id: row.instance_id,
            display_name: row.display_name,
            business_code: row.business_code,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LinkRow {
    pub id: Uuid,
    pub parent_type_code: String,
    pub parent_instance_id: Uuid,
    pub child_type_code: String,
    pub child_instance_id: Uuid,
    pub relationship_type: String,
}

impl From<LinkRow> for EntityLink {
    fn from(row: LinkRow) -> Self {
        Self {
            id: row.id,
            parent_type_code: row.parent_type_code,
            parent_instance_id: row.parent_instance_id,
            child_type_code: row.child_type_code,
            child_instance_id: row.child_instance_id,
            relationship_type: row.relationship_type,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PermissionRow {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub principal_kind: String,
    pub type_code: String,
    pub instance_id: Uuid,
    pub level: i16,
    pub granted_by: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<PermissionRow> for EntityPermission {
    type Error = EntityError;

    fn try_from(row: PermissionRow) -> Result<Self, Self::Error> {
        let principal_kind: PrincipalKind = row.principal_kind.parse().map_err(|_| {
            EntityError::Transaction(anyhow::anyhow!(
                "permission {} has unknown principal kind '{}'",
                row.id,
                row.principal_kind
            ))
        })?;
        let level = PermissionLevel::from_value(row.level).ok_or_else(|| {
            EntityError::Transaction(anyhow::anyhow!(
                "permission {} has out-of-range level {}",
                row.id,
                row.level
            ))
        })?;
        Ok(Self {
            id: row.id,
            principal_id: row.principal_id,
            principal_kind,
            type_code: row.type_code,
            instance_id: row.instance_id,
            level,
            granted_by: row.granted_by,
            expires_at: row.expires_at,
        })
    }
}

pub(crate) fn into_permissions(rows: Vec<PermissionRow>) -> Result<Vec<EntityPermission>, EntityError> {
    rows.into_iter().map(EntityPermission::try_from).collect()
}
