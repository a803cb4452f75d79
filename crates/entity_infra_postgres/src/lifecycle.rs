//! Lifecycle Coordinator - atomic create/update/delete of business records
//! together with their registry row, owner grant and parent link.
//!
//! The coordinator is the only writer of the instance registry, the link
//! store and the permission store. Every mutation runs in one transaction:
//! either every step commits or the whole transaction is rolled back and the
//! failing step's error is returned unchanged.

use std::sync::Arc;

use entity_infra_core::{
    validate_type_code, EntityError, EntityInstance, EntityLink, EntityPermission, InstanceRef,
    InstanceScope, Payload, PermissionLevel, PrincipalKind, ResolverConfig, Result,
    DEFAULT_RELATIONSHIP,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::storage_err;
use crate::facts::PgPermissionResolver;
use crate::permissions::{self, GrantRequest};
use crate::primary::{PrimaryRecord, PrimaryTable};
use crate::types::require_active_type;
use crate::{links, registry};

/// Where a newly created instance hangs in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub parent: InstanceRef,
    #[serde(default = "default_relationship")]
    pub relationship: String,
}

impl ParentRef {
    pub fn new(parent: InstanceRef) -> Self {
        Self {
            parent,
            relationship: default_relationship(),
        }
    }
}

fn default_relationship() -> String {
    DEFAULT_RELATIONSHIP.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntity {
    pub type_code: String,
    pub creator_id: Uuid,
    pub payload: Payload,
    /// Payload field copied into the registry display name. Required.
    pub name_field: String,
    #[serde(default)]
    pub code_field: Option<String>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub record: PrimaryRecord,
    pub instance: EntityInstance,
    pub owner_granted: bool,
    pub linked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntity {
    pub type_code: String,
    pub instance_id: Uuid,
    pub payload: Payload,
    pub name_field: String,
    #[serde(default)]
    pub code_field: Option<String>,
    /// Version the caller last read. With `None` the update is
    /// last-write-wins; callers that must not clobber a concurrent write send
    /// it and get `Conflict` on a mismatch.
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedEntity {
    pub record: PrimaryRecord,
    /// False when the payload did not touch the name or code field.
    pub registry_synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntity {
    pub type_code: String,
    pub instance_id: Uuid,
    pub requester_id: Uuid,
    #[serde(default)]
    pub hard_delete: bool,
    /// For callers that have already authorized the delete themselves.
    #[serde(default)]
    pub skip_permission_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedEntity {
    pub success: bool,
    pub registry_deleted: bool,
    pub links_deleted: u64,
    pub permissions_deleted: u64,
}

#[derive(Clone)]
pub struct PgEntityLifecycle {
    pool: PgPool,
    primary: Arc<dyn PrimaryTable>,
    resolver: Arc<PgPermissionResolver>,
}

impl PgEntityLifecycle {
    pub fn new(
        pool: PgPool,
        primary: Arc<dyn PrimaryTable>,
        resolver: Arc<PgPermissionResolver>,
    ) -> Self {
        Self {
            pool,
            primary,
            resolver,
        }
    }

    fn config(&self) -> &ResolverConfig {
        self.resolver.config()
    }

    pub async fn create(&self, request: &CreateEntity) -> Result<CreatedEntity> {
        validate_type_code(&request.type_code)?;
        let display_name = display_value(&request.payload, &request.name_field).ok_or_else(|| {
            EntityError::validation(format!(
                "payload field '{}' must hold a non-empty name",
                request.name_field
            ))
        })?;
        let business_code = request
            .code_field
            .as_deref()
            .and_then(|field| display_value(&request.payload, field));
        if let Some(parent) = &request.parent {
            self.require_real_instance(&parent.parent)?;
        }

        let mut tx = self.begin().await?;
        let outcome = self
            .create_in_tx(&mut tx, request, &display_name, business_code.as_deref())
            .await;
        let created = finish(tx, outcome, "create").await?;

        info!(
            type_code = %request.type_code,
            instance_id = %created.record.id,
            creator_id = %request.creator_id,
            linked = created.linked,
            "Created entity"
        );
        Ok(created)
    }

    async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &CreateEntity,
        display_name: &str,
        business_code: Option<&str>,
    ) -> Result<CreatedEntity> {
        require_active_type(&mut **tx, &request.type_code).await?;
        if let Some(parent) = &request.parent {
            let parent_type = require_active_type(&mut **tx, &parent.parent.type_code).await?;
            if !parent_type.allows_child(&request.type_code) {
                return Err(EntityError::validation(format!(
                    "'{}' instances cannot be created under '{}'",
                    request.type_code, parent_type.code
                )));
            }
        }

        let record = self
            .primary
            .insert(&mut **tx, &request.type_code, &request.payload)
            .await?;
        if self.config().is_reserved(record.id) {
            return Err(EntityError::validation(format!(
                "primary table returned the reserved all-instances id for '{}'",
                request.type_code
            )));
        }

        let instance = registry::insert_instance(
            &mut **tx,
            &request.type_code,
            record.id,
            display_name,
            business_code,
        )
        .await?;

        let owner = GrantRequest::user(
            request.creator_id,
            request.type_code.clone(),
            InstanceScope::Instance(record.id),
            PermissionLevel::Owner,
        )
        .granted_by(request.creator_id);
        permissions::upsert_grant(&mut **tx, &owner, self.config().all_instances_id).await?;

        let linked = match &request.parent {
            Some(parent) => {
                links::insert_link(
                    &mut **tx,
                    &parent.parent,
                    &instance.instance_ref(),
                    &parent.relationship,
                )
                .await?;
                true
            }
            None => false,
        };

        Ok(CreatedEntity {
            record,
            instance,
            owner_granted: true,
            linked,
        })
    }

    pub async fn update(&self, request: &UpdateEntity) -> Result<UpdatedEntity> {
        validate_type_code(&request.type_code)?;
        self.require_real_instance(&InstanceRef::new(&request.type_code, request.instance_id))?;

        let display_name = match request.payload.get(&request.name_field) {
            None => None,
            Some(_) => Some(display_value(&request.payload, &request.name_field).ok_or_else(
                || {
                    EntityError::validation(format!(
                        "payload field '{}' must hold a non-empty name",
                        request.name_field
                    ))
                },
            )?),
        };
        let business_code = request
            .code_field
            .as_deref()
            .filter(|field| request.payload.contains_key(*field))
            .map(|field| display_value(&request.payload, field));

        let mut tx = self.begin().await?;
        let outcome = self
            .update_in_tx(&mut tx, request, display_name.as_deref(), business_code)
            .await;
        let updated = finish(tx, outcome, "update").await?;

        info!(
            type_code = %request.type_code,
            instance_id = %request.instance_id,
            version = ?updated.record.version,
            registry_synced = updated.registry_synced,
            "Updated entity"
        );
        Ok(updated)
    }

    async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &UpdateEntity,
        display_name: Option<&str>,
        business_code: Option<Option<String>>,
    ) -> Result<UpdatedEntity> {
        let record = self
            .primary
            .update(
                &mut **tx,
                &request.type_code,
                request.instance_id,
                &request.payload,
                request.expected_version,
            )
            .await?
            .ok_or_else(|| {
                EntityError::NotFound(format!("{}:{}", request.type_code, request.instance_id))
            })?;

        if display_name.is_none() && business_code.is_none() {
            return Ok(UpdatedEntity {
                record,
                registry_synced: false,
            });
        }

        let instance = InstanceRef::new(&request.type_code, request.instance_id);
        let synced = registry::sync_instance(
            &mut **tx,
            &instance,
            display_name,
            business_code.as_ref().map(Option::as_deref),
        )
        .await?;
        if !synced {
            warn!(instance = %instance, "Business record has no registry row");
        }
        Ok(UpdatedEntity {
            record,
            registry_synced: synced,
        })
    }

    pub async fn delete(&self, request: &DeleteEntity) -> Result<DeletedEntity> {
        validate_type_code(&request.type_code)?;
        let instance = InstanceRef::new(&request.type_code, request.instance_id);
        self.require_real_instance(&instance)?;
        if !request.skip_permission_check {
            self.resolver
                .require(
                    request.requester_id,
                    &request.type_code,
                    request.instance_id,
                    PermissionLevel::Delete,
                )
                .await?;
        }

        let mut tx = self.begin().await?;
        let outcome = self.delete_in_tx(&mut tx, request, &instance).await;
        let deleted = finish(tx, outcome, "delete").await?;

        info!(
            instance = %instance,
            requester_id = %request.requester_id,
            hard_delete = request.hard_delete,
            links_deleted = deleted.links_deleted,
            permissions_deleted = deleted.permissions_deleted,
            "Deleted entity"
        );
        Ok(deleted)
    }

    async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &DeleteEntity,
        instance: &InstanceRef,
    ) -> Result<DeletedEntity> {
        let found = if request.hard_delete {
            self.primary
                .delete(&mut **tx, &request.type_code, request.instance_id)
                .await?
        } else {
            self.primary
                .deactivate(&mut **tx, &request.type_code, request.instance_id)
                .await?
        };
        if !found {
            return Err(EntityError::NotFound(instance.to_string()));
        }

        let registry_deleted = registry::delete_instance(&mut **tx, instance).await?;
        if !registry_deleted {
            warn!(instance = %instance, "Deleted business record had no registry row");
        }
        let links_deleted = links::delete_links_touching(&mut **tx, instance).await?;
        let permissions_deleted = permissions::delete_instance_grants(&mut **tx, instance).await?;

        Ok(DeletedEntity {
            success: true,
            registry_deleted,
            links_deleted,
            permissions_deleted,
        })
    }

    pub async fn link(
        &self,
        parent: &InstanceRef,
        child: &InstanceRef,
        relationship: &str,
    ) -> Result<EntityLink> {
        self.require_real_instance(parent)?;
        self.require_real_instance(child)?;

        let mut tx = self.begin().await?;
        let outcome = links::insert_link(&mut *tx, parent, child, relationship).await;
        let link = finish(tx, outcome, "link").await?;
        info!(parent = %parent, child = %child, relationship, "Linked instances");
        Ok(link)
    }

    pub async fn unlink(
        &self,
        parent: &InstanceRef,
        child: &InstanceRef,
        relationship: Option<&str>,
    ) -> Result<u64> {
        validate_type_code(&parent.type_code)?;
        validate_type_code(&child.type_code)?;

        let mut tx = self.begin().await?;
        let outcome = links::delete_link(&mut *tx, parent, child, relationship).await;
        let removed = finish(tx, outcome, "unlink").await?;
        info!(parent = %parent, child = %child, removed, "Unlinked instances");
        Ok(removed)
    }

    /// Replaces the child's parents of one relationship type with `new_parent`.
    pub async fn reparent(
        &self,
        child: &InstanceRef,
        new_parent: &InstanceRef,
        relationship: &str,
    ) -> Result<EntityLink> {
        self.require_real_instance(child)?;
        self.require_real_instance(new_parent)?;

        let mut tx = self.begin().await?;
        let outcome = async {
            let removed = links::delete_parent_links(&mut *tx, child, relationship).await?;
            let link = links::insert_link(&mut *tx, new_parent, child, relationship).await?;
            Ok::<_, EntityError>((removed, link))
        }
        .await;
        let (removed, link) = finish(tx, outcome, "reparent").await?;
        info!(child = %child, new_parent = %new_parent, removed, "Reparented instance");
        Ok(link)
    }

    /// Grants never lower an unexpired existing level; the returned row is
    /// what the principal holds afterwards.
    pub async fn grant(&self, grant: &GrantRequest) -> Result<EntityPermission> {
        validate_type_code(&grant.type_code)?;
        if let InstanceScope::Instance(id) = grant.scope {
            self.require_real_instance(&InstanceRef::new(&grant.type_code, id))?;
        }

        let all = self.config().all_instances_id;
        let mut tx = self.begin().await?;
        let outcome = async {
            if let InstanceScope::Instance(id) = grant.scope {
                let target = InstanceRef::new(&grant.type_code, id);
                if !registry::lock_instance(&mut *tx, &target).await? {
                    return Err(EntityError::NotFound(target.to_string()));
                }
            }
            permissions::upsert_grant(&mut *tx, grant, all).await
        }
        .await;
        let permission = finish(tx, outcome, "grant").await?;

        info!(
            principal_id = %grant.principal_id,
            principal_kind = %grant.principal_kind,
            type_code = %grant.type_code,
            scope = ?grant.scope,
            requested = %grant.level,
            level = %permission.level,
            "Granted permission"
        );
        Ok(permission)
    }

    pub async fn revoke(
        &self,
        principal_kind: PrincipalKind,
        principal_id: Uuid,
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<u64> {
        validate_type_code(type_code)?;
        let instance_id = scope.to_id(self.config().all_instances_id);

        let mut tx = self.begin().await?;
        let outcome =
            permissions::delete_grant(&mut *tx, principal_kind, principal_id, type_code, instance_id)
                .await;
        let removed = finish(tx, outcome, "revoke").await?;
        info!(%principal_id, %principal_kind, type_code, scope = ?scope, removed, "Revoked permission");
        Ok(removed)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(storage_err)
    }

    fn require_real_instance(&self, instance: &InstanceRef) -> Result<()> {
        validate_type_code(&instance.type_code)?;
        if self.config().is_reserved(instance.instance_id) {
            return Err(EntityError::validation(format!(
                "{} is the reserved all-instances id, not an instance of '{}'",
                instance.instance_id, instance.type_code
            )));
        }
        Ok(())
    }
}

/// Commits on success. On failure rolls back and hands back the original error.
async fn finish<T>(
    tx: Transaction<'_, Postgres>,
    outcome: Result<T>,
    operation: &'static str,
) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(storage_err)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(operation, error = %rollback_err, "Rollback failed");
            }
            warn!(operation, error = %err, "Rolled back entity transaction");
            Err(err)
        }
    }
}

/// Registry text for a payload field: trimmed strings, numbers and booleans.
fn display_value(payload: &Payload, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
