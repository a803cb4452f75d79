//! Permission grant store. Rows are keyed by principal, type and instance
//! (or the reserved all-instances id for type-wide grants).

use chrono::{DateTime, Utc};
use entity_infra_core::{
    validate_type_code, EntityPermission, InstanceRef, InstanceScope, PermissionLevel,
    PrincipalKind, Result,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::storage_err;
use crate::rows::{into_permissions, PermissionRow, PERMISSION_COLUMNS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub principal_id: Uuid,
    pub principal_kind: PrincipalKind,
    pub type_code: String,
    pub scope: InstanceScope,
    pub level: PermissionLevel,
    #[serde(default)]
    pub granted_by: Option<Uuid>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GrantRequest {
    pub fn user(
        principal_id: Uuid,
        type_code: impl Into<String>,
        scope: InstanceScope,
        level: PermissionLevel,
    ) -> Self {
        Self {
            principal_id,
            principal_kind: PrincipalKind::User,
            type_code: type_code.into(),
            scope,
            level,
            granted_by: None,
            expires_at: None,
        }
    }

    pub fn role(
        role_id: Uuid,
        type_code: impl Into<String>,
        scope: InstanceScope,
        level: PermissionLevel,
    ) -> Self {
        Self {
            principal_kind: PrincipalKind::Role,
            ..Self::user(role_id, type_code, scope, level)
        }
    }

    pub fn granted_by(mut self, granter: Uuid) -> Self {
        self.granted_by = Some(granter);
        self
    }

    pub fn expires_at(mut self, expiry: DateTime<Utc>) -> Self {
        self.expires_at = Some(expiry);
        self
    }
}

#[derive(Clone)]
pub struct PgPermissionStore {
    pool: PgPool,
    all_instances_id: Uuid,
}

impl PgPermissionStore {
    pub fn new(pool: PgPool, all_instances_id: Uuid) -> Self {
        Self {
            pool,
            all_instances_id,
        }
    }

    /// Grants stored against one scope, expired ones included.
    pub async fn for_scope(
        &self,
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<Vec<EntityPermission>> {
        validate_type_code(type_code)?;
        let sql = format!(
            "SELECT {PERMISSION_COLUMNS} FROM entity_infra.entity_permission \
             WHERE type_code = $1 AND instance_id = $2 \
             ORDER BY level DESC, principal_kind, principal_id"
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(type_code)
            .bind(scope.to_id(self.all_instances_id))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        into_permissions(rows)
    }

    pub async fn for_instance(&self, instance: &InstanceRef) -> Result<Vec<EntityPermission>> {
        self.for_scope(&instance.type_code, InstanceScope::Instance(instance.instance_id))
            .await
    }
}

/// Insert or raise the grant for `(kind, principal, type, scope)`.
///
/// An unexpired grant that already sits above the requested level is kept
/// as it is and returned; lowering a grant takes a revoke first.
pub(crate) async fn upsert_grant(
    conn: &mut PgConnection,
    grant: &GrantRequest,
    all_instances_id: Uuid,
) -> Result<EntityPermission> {
    let instance_id = grant.scope.to_id(all_instances_id);
    let sql = format!(
        "INSERT INTO entity_infra.entity_permission \
             (principal_id, principal_kind, type_code, instance_id, level, granted_by, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT ON CONSTRAINT uq_entity_permission DO UPDATE SET \
             level = EXCLUDED.level, \
             granted_by = EXCLUDED.granted_by, \
             granted_at = now(), \
             expires_at = EXCLUDED.expires_at \
         WHERE entity_permission.level <= EXCLUDED.level \
            OR entity_permission.expires_at <= now() \
         RETURNING {PERMISSION_COLUMNS}"
    );
    let written = sqlx::query_as::<_, PermissionRow>(&sql)
        .bind(grant.principal_id)
        .bind(grant.principal_kind.as_ref())
        .bind(&grant.type_code)
        .bind(instance_id)
        .bind(grant.level.value())
        .bind(grant.granted_by)
        .bind(grant.expires_at)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;
    if let Some(row) = written {
        return EntityPermission::try_from(row);
    }

    let sql = format!(
        "SELECT {PERMISSION_COLUMNS} FROM entity_infra.entity_permission \
         WHERE principal_kind = $1 AND principal_id = $2 AND type_code = $3 AND instance_id = $4"
    );
    let kept = sqlx::query_as::<_, PermissionRow>(&sql)
        .bind(grant.principal_kind.as_ref())
        .bind(grant.principal_id)
        .bind(&grant.type_code)
        .bind(instance_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_err)?;
    debug!(
        principal_id = %grant.principal_id,
        type_code = %grant.type_code,
        requested = %grant.level,
        kept = kept.level,
        "Kept higher existing grant"
    );
    EntityPermission::try_from(kept)
}

pub(crate) async fn delete_grant(
    conn: &mut PgConnection,
    kind: PrincipalKind,
    principal_id: Uuid,
    type_code: &str,
    instance_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM entity_infra.entity_permission
        WHERE principal_kind = $1 AND principal_id = $2 AND type_code = $3 AND instance_id = $4
        "#,
    )
    .bind(kind.as_ref())
    .bind(principal_id)
    .bind(type_code)
    .bind(instance_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected())
}

/// Removes every grant on one instance. Type-wide rows are untouched.
pub(crate) async fn delete_instance_grants(
    conn: &mut PgConnection,
    instance: &InstanceRef,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM entity_infra.entity_permission WHERE type_code = $1 AND instance_id = $2",
    )
    .bind(&instance.type_code)
    .bind(instance.instance_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected())
}

/// Unexpired grants for a user or any of their roles over a set of ids.
pub(crate) async fn active_grants(
    pool: &PgPool,
    principal_id: Uuid,
    role_ids: &[Uuid],
    type_code: &str,
    instance_ids: &[Uuid],
) -> Result<Vec<EntityPermission>> {
    let sql = format!(
        "SELECT {PERMISSION_COLUMNS} FROM entity_infra.entity_permission \
         WHERE type_code = $1 \
           AND instance_id = ANY($2) \
           AND (expires_at IS NULL OR expires_at > now()) \
           AND ((principal_kind = 'user' AND principal_id = $3) \
             OR (principal_kind = 'role' AND principal_id = ANY($4)))"
    );
    let rows = sqlx::query_as::<_, PermissionRow>(&sql)
        .bind(type_code)
        .bind(instance_ids)
        .bind(principal_id)
        .bind(role_ids)
        .fetch_all(pool)
        .await
        .map_err(storage_err)?;
    into_permissions(rows)
}
