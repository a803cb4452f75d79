//! The entity service: the six operation families exposed to a request
//! handling layer, wired from one pool and one configuration.
//!
//! Mutations go through the lifecycle coordinator; reads go through the
//! resolvers and read-side stores.

use std::sync::Arc;

use entity_infra_core::{
    EntityError, EntityType, InstanceRef, InstanceScope, PermissionBreakdown, PermissionLevel,
    PrincipalKind, ReferenceResolver, ResolvedReferences, Result,
};
use entity_infra_postgres::{
    permission_predicate, ConventionalPrimaryTable, CreateEntity, CreatedEntity, DeleteEntity,
    DeletedEntity, GrantRequest, LinkedInstance, PermissionPredicate, PgEntityLifecycle,
    PgEntityTypeStore, PgInstanceRegistry, PgLinkStore, PgPermissionFacts, PgPermissionResolver,
    PgPermissionStore, PrimaryTable, UpdateEntity, UpdatedEntity,
};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::config::InfraConfig;

#[derive(Clone)]
pub struct EntityService {
    lifecycle: PgEntityLifecycle,
    resolver: Arc<PgPermissionResolver>,
    references: Arc<ReferenceResolver<PgInstanceRegistry>>,
    types: PgEntityTypeStore,
    registry: PgInstanceRegistry,
    links: PgLinkStore,
    permissions: PgPermissionStore,
}

impl EntityService {
    /// Uses [`ConventionalPrimaryTable`] over the configured schema.
    pub fn new(pool: PgPool, config: &InfraConfig) -> Result<Self> {
        let primary = ConventionalPrimaryTable::new(config.primary_schema.clone())?;
        Self::with_primary_table(pool, config, Arc::new(primary))
    }

    pub fn with_primary_table(
        pool: PgPool,
        config: &InfraConfig,
        primary: Arc<dyn PrimaryTable>,
    ) -> Result<Self> {
        config.resolver.validate()?;
        let resolver_config = config.resolver.clone();
        let all_instances_id = resolver_config.all_instances_id;

        let resolver =
            Arc::new(PgPermissionFacts::new(pool.clone(), resolver_config).into_resolver());
        let registry = PgInstanceRegistry::new(pool.clone());

        Ok(Self {
            lifecycle: PgEntityLifecycle::new(pool.clone(), primary, resolver.clone()),
            resolver,
            references: Arc::new(ReferenceResolver::new(registry.clone(), all_instances_id)),
            types: PgEntityTypeStore::new(pool.clone()),
            registry,
            links: PgLinkStore::new(pool.clone()),
            permissions: PgPermissionStore::new(pool, all_instances_id),
        })
    }

    /// Creates a record after checking the creator may create the type and,
    /// for a child, may edit the parent.
    pub async fn create_entity(&self, request: &CreateEntity) -> Result<CreatedEntity> {
        let all = self.all_instances_id();
        self.resolver
            .require(
                request.creator_id,
                &request.type_code,
                all,
                PermissionLevel::Create,
            )
            .await?;
        if let Some(parent) = &request.parent {
            self.resolver
                .require(
                    request.creator_id,
                    &parent.parent.type_code,
                    parent.parent.instance_id,
                    PermissionLevel::Edit,
                )
                .await?;
        }
        self.lifecycle.create(request).await
    }

    pub async fn update_entity(
        &self,
        requester_id: Uuid,
        request: &UpdateEntity,
    ) -> Result<UpdatedEntity> {
        self.resolver
            .require(
                requester_id,
                &request.type_code,
                request.instance_id,
                PermissionLevel::Edit,
            )
            .await?;
        self.lifecycle.update(request).await
    }

    /// The DELETE check happens in the coordinator unless the request skips it.
    pub async fn delete_entity(&self, request: &DeleteEntity) -> Result<DeletedEntity> {
        self.lifecycle.delete(request).await
    }

    pub async fn check_permission(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
        required: PermissionLevel,
    ) -> Result<bool> {
        self.resolver
            .check(principal_id, type_code, instance_id, required)
            .await
    }

    pub async fn explain_permission(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
    ) -> Result<PermissionBreakdown> {
        self.resolver
            .explain(principal_id, type_code, instance_id)
            .await
    }

    pub fn permission_predicate(
        &self,
        principal_id: Uuid,
        type_code: &str,
        required: PermissionLevel,
        alias: &str,
    ) -> Result<PermissionPredicate> {
        permission_predicate(
            self.resolver.config(),
            principal_id,
            type_code,
            required,
            alias,
        )
    }

    pub async fn resolve_references(&self, rows: &[Value]) -> Result<ResolvedReferences> {
        self.references.resolve(rows).await
    }

    /// Sharing needs SHARE on the target, and nobody hands out more than
    /// they hold.
    pub async fn share(&self, granter_id: Uuid, grant: &GrantRequest) -> Result<()> {
        let target = grant.scope.to_id(self.all_instances_id());
        let held = self
            .resolver
            .effective_level(granter_id, &grant.type_code, target)
            .await?;
        let allowed = held.is_some_and(|level| {
            level.satisfies(PermissionLevel::Share) && level.satisfies(grant.level)
        });
        if !allowed {
            return Err(EntityError::PermissionDenied(format!(
                "{granter_id} cannot grant {} on {} {}",
                grant.level,
                grant.type_code,
                scope_label(grant.scope)
            )));
        }

        let grant = GrantRequest {
            granted_by: Some(granter_id),
            ..grant.clone()
        };
        self.lifecycle.grant(&grant).await?;
        info!(granter_id = %granter_id, principal_id = %grant.principal_id, "Shared entity");
        Ok(())
    }

    pub async fn revoke(
        &self,
        principal_kind: PrincipalKind,
        principal_id: Uuid,
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<u64> {
        self.lifecycle
            .revoke(principal_kind, principal_id, type_code, scope)
            .await
    }

    pub async fn children_of(
        &self,
        parent: &InstanceRef,
        relationship: Option<&str>,
    ) -> Result<Vec<LinkedInstance>> {
        self.links.children_of(parent, relationship).await
    }

    pub async fn parents_of(&self, child: &InstanceRef) -> Result<Vec<LinkedInstance>> {
        self.links.parents_of(child).await
    }

    pub async fn entity_types(&self, include_inactive: bool) -> Result<Vec<EntityType>> {
        self.types.list(include_inactive).await
    }

    pub fn lifecycle(&self) -> &PgEntityLifecycle {
        &self.lifecycle
    }

    pub fn resolver(&self) -> &PgPermissionResolver {
        &self.resolver
    }

    pub fn types(&self) -> &PgEntityTypeStore {
        &self.types
    }

    pub fn registry(&self) -> &PgInstanceRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &PgPermissionStore {
        &self.permissions
    }

    fn all_instances_id(&self) -> Uuid {
        self.resolver.config().all_instances_id
    }
}

fn scope_label(scope: InstanceScope) -> String {
    match scope {
        InstanceScope::Instance(id) => id.to_string(),
        InstanceScope::AllInstances => "(all instances)".to_string(),
    }
}
