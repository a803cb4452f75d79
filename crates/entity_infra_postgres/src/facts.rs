use async_trait::async_trait;
use entity_infra_core::{
    EntityPermission, InstanceRef, InstanceScope, PermissionFacts, PermissionResolver,
    ResolverConfig, Result,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::storage_err;
use crate::links::role_ids_of;
use crate::permissions::active_grants;

pub type PgPermissionResolver = PermissionResolver<PgPermissionFacts>;

/// Reads the link, permission and type tables for the resolver.
#[derive(Clone)]
pub struct PgPermissionFacts {
    pool: PgPool,
    config: ResolverConfig,
}

impl PgPermissionFacts {
    pub fn new(pool: PgPool, config: ResolverConfig) -> Self {
        Self { pool, config }
    }

    pub fn into_resolver(self) -> PgPermissionResolver {
        let config = self.config.clone();
        PermissionResolver::new(self, config)
    }
}

#[derive(FromRow)]
struct ParentRow {
    parent_type_code: String,
    parent_instance_id: Uuid,
}

#[async_trait]
impl PermissionFacts for PgPermissionFacts {
    async fn role_ids(&self, principal_id: Uuid) -> Result<Vec<Uuid>> {
        role_ids_of(
            &self.pool,
            &self.config.role_type,
            &self.config.principal_type,
            principal_id,
        )
        .await
    }

    async fn grants(
        &self,
        principal_id: Uuid,
        role_ids: &[Uuid],
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<Vec<EntityPermission>> {
        let all = self.config.all_instances_id;
        let ids = match scope {
            InstanceScope::Instance(id) => vec![id, all],
            InstanceScope::AllInstances => vec![all],
        };
        active_grants(&self.pool, principal_id, role_ids, type_code, &ids).await
    }

    async fn parents(&self, child: &InstanceRef) -> Result<Vec<InstanceRef>> {
        let rows = sqlx::query_as::<_, ParentRow>(
            r#"
            SELECT DISTINCT parent_type_code, parent_instance_id
            FROM entity_infra.entity_link
            WHERE child_type_code = $1 AND child_instance_id = $2
            "#,
        )
        .bind(&child.type_code)
        .bind(child.instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .map(|row| InstanceRef::new(row.parent_type_code, row.parent_instance_id))
            .collect())
    }

    async fn parent_type_codes(&self, child_type: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT code FROM entity_infra.entity_type \
             WHERE active AND $1 = ANY(child_type_codes) ORDER BY code",
        )
        .bind(child_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)
    }
}
