//! Entity type registry. Types are administrative data: they are created
//! and retired here, never by the lifecycle coordinator.

use entity_infra_core::{validate_type_code, EntityError, EntityType, Result};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::error::storage_err;
use crate::rows::{EntityTypeRow, TYPE_COLUMNS};

/// Input for creating or replacing a type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntityType {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub child_type_codes: Vec<String>,
}

impl NewEntityType {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            icon: None,
            child_type_codes: Vec::new(),
        }
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child_type_codes = children.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> Result<()> {
        validate_type_code(&self.code)?;
        if self.name.trim().is_empty() {
            return Err(EntityError::validation(format!(
                "entity type '{}' needs a name",
                self.code
            )));
        }
        self.child_type_codes
            .iter()
            .try_for_each(|child| validate_type_code(child))
    }
}

#[derive(Clone)]
pub struct PgEntityTypeStore {
    pool: PgPool,
}

impl PgEntityTypeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, code: &str) -> Result<Option<EntityType>> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_type(&mut conn, code).await
    }

    /// Unknown and retired types are both `Validation` failures.
    pub async fn require_active(&self, code: &str) -> Result<EntityType> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        require_active_type(&mut conn, code).await
    }

    pub async fn list(&self, include_inactive: bool) -> Result<Vec<EntityType>> {
        let sql = format!(
            "SELECT {TYPE_COLUMNS} FROM entity_infra.entity_type \
             WHERE active OR $1 ORDER BY code"
        );
        let rows = sqlx::query_as::<_, EntityTypeRow>(&sql)
            .bind(include_inactive)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.into_iter().map(EntityType::from).collect())
    }

    pub async fn create(&self, new_type: &NewEntityType) -> Result<EntityType> {
        new_type.validate()?;
        let sql = format!(
            "INSERT INTO entity_infra.entity_type (code, name, icon, child_type_codes) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (code) DO NOTHING \
             RETURNING {TYPE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EntityTypeRow>(&sql)
            .bind(&new_type.code)
            .bind(&new_type.name)
            .bind(&new_type.icon)
            .bind(&new_type.child_type_codes)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        let Some(row) = row else {
            return Err(EntityError::Conflict(format!(
                "entity type '{}' already exists",
                new_type.code
            )));
        };
        info!(code = %row.code, children = row.child_type_codes.len(), "Created entity type");
        Ok(row.into())
    }

    /// Creates or replaces a definition. An existing type keeps its active flag.
    pub async fn upsert(&self, new_type: &NewEntityType) -> Result<EntityType> {
        new_type.validate()?;
        let sql = format!(
            "INSERT INTO entity_infra.entity_type (code, name, icon, child_type_codes) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (code) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 icon = EXCLUDED.icon, \
                 child_type_codes = EXCLUDED.child_type_codes, \
                 updated_at = now() \
             RETURNING {TYPE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EntityTypeRow>(&sql)
            .bind(&new_type.code)
            .bind(&new_type.name)
            .bind(&new_type.icon)
            .bind(&new_type.child_type_codes)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        info!(code = %row.code, "Upserted entity type");
        Ok(row.into())
    }

    pub async fn set_child_types(&self, code: &str, children: &[String]) -> Result<EntityType> {
        validate_type_code(code)?;
        children.iter().try_for_each(|c| validate_type_code(c))?;
        let sql = format!(
            "UPDATE entity_infra.entity_type \
             SET child_type_codes = $2, updated_at = now() \
             WHERE code = $1 RETURNING {TYPE_COLUMNS}"
        );
        sqlx::query_as::<_, EntityTypeRow>(&sql)
            .bind(code)
            .bind(children)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(EntityType::from)
            .ok_or_else(|| unknown_type(code))
    }

    /// Retires a type. Existing instances stay; new ones are refused.
    pub async fn deactivate(&self, code: &str) -> Result<EntityType> {
        self.set_active(code, false).await
    }

    pub async fn reactivate(&self, code: &str) -> Result<EntityType> {
        self.set_active(code, true).await
    }

    async fn set_active(&self, code: &str, active: bool) -> Result<EntityType> {
        validate_type_code(code)?;
        let sql = format!(
            "UPDATE entity_infra.entity_type \
             SET active = $2, updated_at = now() \
             WHERE code = $1 RETURNING {TYPE_COLUMNS}"
        );
        let entity_type = sqlx::query_as::<_, EntityTypeRow>(&sql)
            .bind(code)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(EntityType::from)
            .ok_or_else(|| unknown_type(code))?;
        info!(code, active, "Changed entity type state");
        Ok(entity_type)
    }
}

pub(crate) async fn fetch_type(conn: &mut PgConnection, code: &str) -> Result<Option<EntityType>> {
    validate_type_code(code)?;
    let sql = format!("SELECT {TYPE_COLUMNS} FROM entity_infra.entity_type WHERE code = $1");
    let row = sqlx::query_as::<_, EntityTypeRow>(&sql)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;
    Ok(row.map(EntityType::from))
}

pub(crate) async fn require_active_type(conn: &mut PgConnection, code: &str) -> Result<EntityType> {
    let entity_type = fetch_type(conn, code)
        .await?
        .ok_or_else(|| EntityError::validation(format!("unknown entity type '{code}'")))?;
    if !entity_type.active {
        return Err(EntityError::validation(format!(
            "entity type '{code}' is inactive"
        )));
    }
    Ok(entity_type)
}

fn unknown_type(code: &str) -> EntityError {
    EntityError::NotFound(format!("entity type '{code}'"))
}
