//! Instance registry: the global `(type, id) -> display name` index.
//!
//! Writes are crate-private and take a connection so that only the lifecycle
//! coordinator can issue them, inside its transaction.

use async_trait::async_trait;
use entity_infra_core::{
    validate_type_code, EntityError, EntityInstance, InstanceRef, NameLookup, ReferenceSet,
    ResolvedName, Result,
};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::storage_err;
use crate::rows::{InstanceRow, INSTANCE_COLUMNS};

#[derive(Clone)]
pub struct PgInstanceRegistry {
    pool: PgPool,
}

impl PgInstanceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, type_code: &str, instance_id: Uuid) -> Result<Option<EntityInstance>> {
        validate_type_code(type_code)?;
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM entity_infra.entity_instance \
             WHERE type_code = $1 AND instance_id = $2"
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(type_code)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(EntityInstance::from))
    }
}

#[derive(FromRow)]
struct NameRow {
    type_code: String,
    instance_id: Uuid,
    display_name: String,
}

#[async_trait]
impl NameLookup for PgInstanceRegistry {
    async fn lookup_names(&self, references: &ReferenceSet) -> Result<Vec<ResolvedName>> {
        let (type_codes, instance_ids): (Vec<String>, Vec<Uuid>) = references
            .iter()
            .flat_map(|(type_code, ids)| ids.iter().map(move |id| (type_code.clone(), *id)))
            .unzip();
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, NameRow>(
            r#"
            SELECT r.type_code, r.instance_id, r.display_name
            FROM entity_infra.entity_instance r
            JOIN UNNEST($1::text[], $2::uuid[]) AS wanted (type_code, instance_id)
              ON r.type_code = wanted.type_code AND r.instance_id = wanted.instance_id
            "#,
        )
        .bind(&type_codes)
        .bind(&instance_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(requested = instance_ids.len(), found = rows.len(), "registry name lookup");
        Ok(rows
            .into_iter()
            .map(|row| ResolvedName {
                type_code: row.type_code,
                instance_id: row.instance_id,
                display_name: row.display_name,
            })
            .collect())
    }
}

pub(crate) async fn insert_instance(
    conn: &mut PgConnection,
    type_code: &str,
    instance_id: Uuid,
    display_name: &str,
    business_code: Option<&str>,
) -> Result<EntityInstance> {
    let sql = format!(
        "INSERT INTO entity_infra.entity_instance \
             (type_code, instance_id, display_name, business_code) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT ON CONSTRAINT uq_entity_instance DO NOTHING \
         RETURNING {INSTANCE_COLUMNS}"
    );
    let row = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(type_code)
        .bind(instance_id)
        .bind(display_name)
        .bind(business_code)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;

    row.map(EntityInstance::from).ok_or_else(|| {
        EntityError::Conflict(format!("{type_code}:{instance_id} is already registered"))
    })
}

/// Registry side of an update. `business_code` is `None` when the payload did
/// not touch the code field, `Some(None)` when it cleared it.
pub(crate) async fn sync_instance(
    conn: &mut PgConnection,
    instance: &InstanceRef,
    display_name: Option<&str>,
    business_code: Option<Option<&str>>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE entity_infra.entity_instance
        SET display_name  = COALESCE($3, display_name),
            business_code = CASE WHEN $4 THEN $5 ELSE business_code END,
            updated_at    = now()
        WHERE type_code = $1 AND instance_id = $2
        "#,
    )
    .bind(&instance.type_code)
    .bind(instance.instance_id)
    .bind(display_name)
    .bind(business_code.is_some())
    .bind(business_code.flatten())
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn delete_instance(conn: &mut PgConnection, instance: &InstanceRef) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM entity_infra.entity_instance WHERE type_code = $1 AND instance_id = $2",
    )
    .bind(&instance.type_code)
    .bind(instance.instance_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected() > 0)
}

/// Existence check that also takes a share lock, so the row cannot be
/// deleted by a concurrent transaction before ours commits.
pub(crate) async fn lock_instance(conn: &mut PgConnection, instance: &InstanceRef) -> Result<bool> {
    let found: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM entity_infra.entity_instance \
         WHERE type_code = $1 AND instance_id = $2 FOR SHARE",
    )
    .bind(&instance.type_code)
    .bind(instance.instance_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(found.is_some())
}
