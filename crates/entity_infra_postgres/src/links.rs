//! Directed, typed parent/child edges between registered instances.

use entity_infra_core::{
    validate_identifier, validate_type_code, EntityError, EntityLink, InstanceRef, Result,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::storage_err;
use crate::registry::lock_instance;
use crate::rows::{LinkRow, LINK_COLUMNS};

/// An edge plus the registry name of the instance at its far end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedInstance {
    pub link: EntityLink,
    pub display_name: Option<String>,
}

#[derive(FromRow)]
struct LinkedRow {
    #[sqlx(flatten)]
    link: LinkRow,
    display_name: Option<String>,
}

impl From<LinkedRow> for LinkedInstance {
    fn from(row: LinkedRow) -> Self {
        Self {
            link: row.link.into(),
            display_name: row.display_name,
        }
    }
}

#[derive(Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn children_of(
        &self,
        parent: &InstanceRef,
        relationship: Option<&str>,
    ) -> Result<Vec<LinkedInstance>> {
        validate_type_code(&parent.type_code)?;
        let rows = sqlx::query_as::<_, LinkedRow>(
            r#"
            SELECT l.id, l.parent_type_code, l.parent_instance_id,
                   l.child_type_code, l.child_instance_id, l.relationship_type,
                   r.display_name
            FROM entity_infra.entity_link l
            LEFT JOIN entity_infra.entity_instance r
              ON r.type_code = l.child_type_code AND r.instance_id = l.child_instance_id
            WHERE l.parent_type_code = $1 AND l.parent_instance_id = $2
              AND ($3::text IS NULL OR l.relationship_type = $3)
            ORDER BY l.child_type_code, r.display_name
            "#,
        )
        .bind(&parent.type_code)
        .bind(parent.instance_id)
        .bind(relationship)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(LinkedInstance::from).collect())
    }

    pub async fn parents_of(&self, child: &InstanceRef) -> Result<Vec<LinkedInstance>> {
        validate_type_code(&child.type_code)?;
        let rows = sqlx::query_as::<_, LinkedRow>(
            r#"
            SELECT l.id, l.parent_type_code, l.parent_instance_id,
                   l.child_type_code, l.child_instance_id, l.relationship_type,
                   r.display_name
            FROM entity_infra.entity_link l
            LEFT JOIN entity_infra.entity_instance r
              ON r.type_code = l.parent_type_code AND r.instance_id = l.parent_instance_id
            WHERE l.child_type_code = $1 AND l.child_instance_id = $2
            ORDER BY l.parent_type_code, r.display_name
            "#,
        )
        .bind(&child.type_code)
        .bind(child.instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(LinkedInstance::from).collect())
    }

    /// Every edge with the instance at either end.
    pub async fn touching(&self, instance: &InstanceRef) -> Result<Vec<EntityLink>> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM entity_infra.entity_link \
             WHERE (parent_type_code = $1 AND parent_instance_id = $2) \
                OR (child_type_code = $1 AND child_instance_id = $2)"
        );
        let rows = sqlx::query_as::<_, LinkRow>(&sql)
            .bind(&instance.type_code)
            .bind(instance.instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.into_iter().map(EntityLink::from).collect())
    }
}

/// Inserts an edge after checking both endpoints are registered. Re-adding an
/// existing edge returns the stored row.
pub(crate) async fn insert_link(
    conn: &mut PgConnection,
    parent: &InstanceRef,
    child: &InstanceRef,
    relationship: &str,
) -> Result<EntityLink> {
    validate_identifier("relationship type", relationship)?;
    if parent == child {
        return Err(EntityError::validation(format!(
            "{parent} cannot be linked to itself"
        )));
    }
    for endpoint in [parent, child] {
        if !lock_instance(conn, endpoint).await? {
            return Err(EntityError::validation(format!(
                "{endpoint} is not a registered instance"
            )));
        }
    }

    // DO UPDATE (not DO NOTHING) so RETURNING yields the existing row.
    let sql = format!(
        "INSERT INTO entity_infra.entity_link \
             (parent_type_code, parent_instance_id, child_type_code, child_instance_id, relationship_type) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT ON CONSTRAINT uq_entity_link \
         DO UPDATE SET relationship_type = EXCLUDED.relationship_type \
         RETURNING {LINK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, LinkRow>(&sql)
        .bind(&parent.type_code)
        .bind(parent.instance_id)
        .bind(&child.type_code)
        .bind(child.instance_id)
        .bind(relationship)
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_err)?;
    Ok(row.into())
}

pub(crate) async fn delete_link(
    conn: &mut PgConnection,
    parent: &InstanceRef,
    child: &InstanceRef,
    relationship: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM entity_infra.entity_link
        WHERE parent_type_code = $1 AND parent_instance_id = $2
          AND child_type_code = $3 AND child_instance_id = $4
          AND ($5::text IS NULL OR relationship_type = $5)
        "#,
    )
    .bind(&parent.type_code)
    .bind(parent.instance_id)
    .bind(&child.type_code)
    .bind(child.instance_id)
    .bind(relationship)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected())
}

/// Drops the child's incoming edges of one relationship type.
pub(crate) async fn delete_parent_links(
    conn: &mut PgConnection,
    child: &InstanceRef,
    relationship: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM entity_infra.entity_link \
         WHERE child_type_code = $1 AND child_instance_id = $2 AND relationship_type = $3",
    )
    .bind(&child.type_code)
    .bind(child.instance_id)
    .bind(relationship)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_links_touching(
    conn: &mut PgConnection,
    instance: &InstanceRef,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM entity_infra.entity_link
        WHERE (parent_type_code = $1 AND parent_instance_id = $2)
           OR (child_type_code = $1 AND child_instance_id = $2)
        "#,
    )
    .bind(&instance.type_code)
    .bind(instance.instance_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected())
}

/// Ids of role instances linked to the principal.
pub(crate) async fn role_ids_of(
    pool: &PgPool,
    role_type: &str,
    principal_type: &str,
    principal_id: Uuid,
) -> Result<Vec<Uuid>> {
    sqlx::query_scalar(
        r#"
        SELECT DISTINCT parent_instance_id
        FROM entity_infra.entity_link
        WHERE parent_type_code = $1 AND child_type_code = $2 AND child_instance_id = $3
        "#,
    )
    .bind(role_type)
    .bind(principal_type)
    .bind(principal_id)
    .fetch_all(pool)
    .await
    .map_err(storage_err)
}
