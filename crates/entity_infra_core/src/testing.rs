//! In-memory facts for exercising the resolver without a database.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::ResolverConfig;
use crate::error::Result;
use crate::level::PermissionLevel;
use crate::permission::PermissionFacts;
use crate::types::{
    EntityLink, EntityPermission, EntityType, InstanceRef, InstanceScope, PrincipalKind,
    DEFAULT_RELATIONSHIP,
};

#[derive(Debug, Default)]
pub(crate) struct MemoryFacts {
    pub config: ResolverConfig,
    pub types: Vec<EntityType>,
    pub links: Vec<EntityLink>,
    pub grants: Vec<EntityPermission>,
}

impl MemoryFacts {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn add_type(&mut self, code: &str, children: &[&str]) {
        self.types.push(EntityType {
            code: code.to_string(),
            name: code.to_string(),
            icon: None,
            child_type_codes: children.iter().map(|c| c.to_string()).collect(),
            active: true,
        });
    }

    pub fn link(&mut self, parent: &InstanceRef, child: &InstanceRef) {
        self.links.push(EntityLink {
            id: Uuid::new_v4(),
            parent_type_code: parent.type_code.clone(),
            parent_instance_id: parent.instance_id,
            child_type_code: child.type_code.clone(),
            child_instance_id: child.instance_id,
            relationship_type: DEFAULT_RELATIONSHIP.to_string(),
        });
    }

    pub fn add_role_member(&mut self, role_id: Uuid, principal_id: Uuid) {
        let role = InstanceRef::new(self.config.role_type.clone(), role_id);
        let member = InstanceRef::new(self.config.principal_type.clone(), principal_id);
        self.link(&role, &member);
    }

    pub fn grant(
        &mut self,
        kind: PrincipalKind,
        principal_id: Uuid,
        type_code: &str,
        scope: InstanceScope,
        level: PermissionLevel,
    ) -> &mut EntityPermission {
        self.grants.push(EntityPermission {
            id: Uuid::new_v4(),
            principal_id,
            principal_kind: kind,
            type_code: type_code.to_string(),
            instance_id: scope.to_id(self.config.all_instances_id),
            level,
            granted_by: None,
            expires_at: None,
        });
        self.grants.last_mut().expect("just pushed")
    }
}

#[async_trait]
impl PermissionFacts for MemoryFacts {
    async fn role_ids(&self, principal_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .links
            .iter()
            .filter(|l| {
                l.parent_type_code == self.config.role_type
                    && l.child_type_code == self.config.principal_type
                    && l.child_instance_id == principal_id
            })
            .map(|l| l.parent_instance_id)
            .collect())
    }

    async fn grants(
        &self,
        principal_id: Uuid,
        role_ids: &[Uuid],
        type_code: &str,
        scope: InstanceScope,
    ) -> Result<Vec<EntityPermission>> {
        let all = self.config.all_instances_id;
        let now = Utc::now();
        Ok(self
            .grants
            .iter()
            .filter(|g| g.type_code == type_code && g.is_active_at(now))
            .filter(|g| g.instance_id == all || g.instance_id == scope.to_id(all))
            .filter(|g| match g.principal_kind {
                PrincipalKind::User => g.principal_id == principal_id,
                PrincipalKind::Role => role_ids.contains(&g.principal_id),
            })
            .cloned()
            .collect())
    }

    async fn parents(&self, child: &InstanceRef) -> Result<Vec<InstanceRef>> {
        Ok(self
            .links
            .iter()
            .filter(|l| l.child() == *child)
            .map(EntityLink::parent)
            .collect())
    }

    async fn parent_type_codes(&self, child_type: &str) -> Result<Vec<String>> {
        Ok(self
            .types
            .iter()
            .filter(|t| t.active && t.allows_child(child_type))
            .map(|t| t.code.clone())
            .collect())
    }
}
