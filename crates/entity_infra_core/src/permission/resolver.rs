//! Effective permission resolution over a [`PermissionFacts`] port.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::sources::{
    direct_grant_level, parent_create_rule, parent_view_rule, role_grant_level,
    PermissionBreakdown, PermissionSource, SourceLevel,
};
use crate::config::ResolverConfig;
use crate::error::{EntityError, Result};
use crate::level::PermissionLevel;
use crate::types::{validate_type_code, EntityPermission, InstanceRef, InstanceScope};

/// Read-only facts the resolver needs. Missing data is an empty result,
/// never an error.
#[async_trait]
pub trait PermissionFacts: Send + Sync {
    /// Ids of the role instances the principal is a member of.
    async fn role_ids(&self, principal_id: Uuid) -> Result<Vec<Uuid>>;

    /// Unexpired grants over `type_code` held by the principal (as a user) or
    /// by any of `role_ids`. For an instance scope this includes type-wide
    /// rows; for `AllInstances` it is only the type-wide rows.
    async fn grants(
        &self,
        principal_id: Uuid,
        role_ids: &[Uuid],
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<Vec<EntityPermission>>;

    async fn parents(&self, child: &InstanceRef) -> Result<Vec<InstanceRef>>;

    /// Active types that list `child_type` among their allowed children.
    async fn parent_type_codes(&self, child_type: &str) -> Result<Vec<String>>;
}

pub struct PermissionResolver<F> {
    facts: F,
    config: ResolverConfig,
}

impl<F: PermissionFacts> PermissionResolver<F> {
    pub fn new(facts: F, config: ResolverConfig) -> Self {
        Self { facts, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn facts(&self) -> &F {
        &self.facts
    }

    pub async fn check(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
        required: PermissionLevel,
    ) -> Result<bool> {
        Ok(self
            .explain(principal_id, type_code, instance_id)
            .await?
            .satisfies(required))
    }

    /// Like [`check`](Self::check) but turns a refusal into `PermissionDenied`.
    pub async fn require(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
        required: PermissionLevel,
    ) -> Result<()> {
        let breakdown = self.explain(principal_id, type_code, instance_id).await?;
        if breakdown.satisfies(required) {
            return Ok(());
        }
        let scope = InstanceScope::from_id(instance_id, self.config.all_instances_id);
        let target = match scope {
            InstanceScope::Instance(id) => format!("{type_code}:{id}"),
            InstanceScope::AllInstances => format!("all {type_code} instances"),
        };
        Err(EntityError::PermissionDenied(format!(
            "{principal_id} needs {required} on {target} (has level {})",
            breakdown.effective_value()
        )))
    }

    pub async fn effective_level(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
    ) -> Result<Option<PermissionLevel>> {
        Ok(self
            .explain(principal_id, type_code, instance_id)
            .await?
            .effective)
    }

    /// Evaluates every source and folds them. Passing the reserved
    /// all-instances id asks about the type as a whole.
    pub async fn explain(
        &self,
        principal_id: Uuid,
        type_code: &str,
        instance_id: Uuid,
    ) -> Result<PermissionBreakdown> {
        validate_type_code(type_code)?;
        let scope = InstanceScope::from_id(instance_id, self.config.all_instances_id);
        let role_ids = self.facts.role_ids(principal_id).await?;

        let grants = self
            .facts
            .grants(principal_id, &role_ids, type_code, scope)
            .await?;
        let direct = direct_grant_level(&grants, principal_id);
        let role = role_grant_level(&grants, &role_ids);

        let (parent_view, parent_create) = match scope {
            InstanceScope::Instance(id) => {
                let target = InstanceRef::new(type_code, id);
                let view = self
                    .parent_view_level(principal_id, &role_ids, &target)
                    .await?;
                (view, None)
            }
            InstanceScope::AllInstances => {
                let create = self
                    .parent_create_level(principal_id, &role_ids, type_code)
                    .await?;
                (None, create)
            }
        };

        let breakdown = PermissionBreakdown::from_sources(vec![
            SourceLevel::new(PermissionSource::DirectGrant, direct),
            SourceLevel::new(PermissionSource::RoleGrant, role),
            SourceLevel::new(PermissionSource::ParentView, parent_view),
            SourceLevel::new(PermissionSource::ParentCreate, parent_create),
        ]);
        debug!(
            principal_id = %principal_id,
            type_code,
            instance_id = %instance_id,
            effective = breakdown.effective_value(),
            "resolved permission"
        );
        Ok(breakdown)
    }

    /// Climbs parent links breadth-first, at most `parent_view_depth` hops,
    /// looking for an ancestor the principal can see through its own grants.
    async fn parent_view_level(
        &self,
        principal_id: Uuid,
        role_ids: &[Uuid],
        target: &InstanceRef,
    ) -> Result<Option<PermissionLevel>> {
        let mut visited = HashSet::from([target.clone()]);
        let mut frontier = vec![target.clone()];

        for _ in 0..self.config.parent_view_depth {
            let mut next = Vec::new();
            for node in &frontier {
                for parent in self.facts.parents(node).await? {
                    if visited.insert(parent.clone()) {
                        next.push(parent);
                    }
                }
            }
            if next.is_empty() {
                break;
            }

            let mut ancestor_levels = Vec::with_capacity(next.len());
            for ancestor in &next {
                let grants = self
                    .facts
                    .grants(
                        principal_id,
                        role_ids,
                        &ancestor.type_code,
                        InstanceScope::Instance(ancestor.instance_id),
                    )
                    .await?;
                ancestor_levels.push(
                    direct_grant_level(&grants, principal_id)
                        .max(role_grant_level(&grants, role_ids)),
                );
            }
            if let Some(level) = parent_view_rule(ancestor_levels) {
                return Ok(Some(level));
            }
            frontier = next;
        }
        Ok(None)
    }

    async fn parent_create_level(
        &self,
        principal_id: Uuid,
        role_ids: &[Uuid],
        type_code: &str,
    ) -> Result<Option<PermissionLevel>> {
        let mut parent_levels = Vec::new();
        for parent_type in self.facts.parent_type_codes(type_code).await? {
            let grants = self
                .facts
                .grants(
                    principal_id,
                    role_ids,
                    &parent_type,
                    InstanceScope::AllInstances,
                )
                .await?;
            parent_levels.push(
                direct_grant_level(&grants, principal_id).max(role_grant_level(&grants, role_ids)),
            );
        }
        Ok(parent_create_rule(parent_levels))
    }
}
