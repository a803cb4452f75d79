#![allow(dead_code)]

use std::sync::Arc;

use entity_infra_core::{InstanceRef, Payload, ResolverConfig};
use entity_infra_postgres::{
    ConventionalPrimaryTable, CreateEntity, ParentRef, PgEntityLifecycle, PgPermissionFacts,
    PgPermissionResolver,
};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

pub struct Harness {
    pub pool: PgPool,
    pub lifecycle: PgEntityLifecycle,
    pub resolver: Arc<PgPermissionResolver>,
}

impl Harness {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, ResolverConfig::default())
    }

    pub fn with_config(pool: PgPool, config: ResolverConfig) -> Self {
        let resolver = Arc::new(PgPermissionFacts::new(pool.clone(), config).into_resolver());
        let primary = Arc::new(ConventionalPrimaryTable::new("app").expect("schema name"));
        let lifecycle = PgEntityLifecycle::new(pool.clone(), primary, resolver.clone());
        Self {
            pool,
            lifecycle,
            resolver,
        }
    }

    pub async fn count(&self, sql: &str, id: Uuid) -> i64 {
        sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .expect("count query")
    }

    /// Registry, permission and link rows that mention the instance.
    pub async fn infra_trace(&self, id: Uuid) -> (i64, i64, i64) {
        let registry = self
            .count(
                "SELECT COUNT(*) FROM entity_infra.entity_instance WHERE instance_id = $1",
                id,
            )
            .await;
        let permissions = self
            .count(
                "SELECT COUNT(*) FROM entity_infra.entity_permission WHERE instance_id = $1",
                id,
            )
            .await;
        let links = self
            .count(
                "SELECT COUNT(*) FROM entity_infra.entity_link \
                 WHERE parent_instance_id = $1 OR child_instance_id = $1",
                id,
            )
            .await;
        (registry, permissions, links)
    }

    pub async fn arm_failpoint(&self, table: &str) {
        sqlx::query("INSERT INTO app.failpoint (step) VALUES ($1)")
            .bind(table)
            .execute(&self.pool)
            .await
            .expect("arm failpoint");
    }

    pub async fn disarm_failpoints(&self) {
        sqlx::query("DELETE FROM app.failpoint")
            .execute(&self.pool)
            .await
            .expect("disarm failpoints");
    }
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn create_request(type_code: &str, creator: Uuid, value: Value) -> CreateEntity {
    CreateEntity {
        type_code: type_code.to_string(),
        creator_id: creator,
        payload: payload(value),
        name_field: "name".to_string(),
        code_field: Some("code".to_string()),
        parent: None,
    }
}

pub fn under(mut request: CreateEntity, parent: InstanceRef) -> CreateEntity {
    request.parent = Some(ParentRef::new(parent));
    request
}
