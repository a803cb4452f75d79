//! The four permission sources and the rules that turn facts into a
//! candidate level for each of them.
//!
//! Each rule is a plain function over already-loaded facts so it can be
//! tested on its own; [`fold_sources`] combines the candidates with `max`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use uuid::Uuid;

use crate::level::{level_value, PermissionLevel};
use crate::types::{EntityPermission, PrincipalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionSource {
    /// User-scoped rows for the principal itself.
    DirectGrant,
    /// Rows granted to any role the principal holds.
    RoleGrant,
    /// VIEW inherited from a parent the principal can see.
    ParentView,
    /// CREATE inherited from a type-wide CREATE on a parent type.
    ParentCreate,
}

/// Candidate level produced by one source; `None` means "no grant".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLevel {
    pub source: PermissionSource,
    pub level: Option<PermissionLevel>,
}

impl SourceLevel {
    pub fn new(source: PermissionSource, level: Option<PermissionLevel>) -> Self {
        Self { source, level }
    }
}

pub fn fold_sources(levels: &[SourceLevel]) -> Option<PermissionLevel> {
    levels.iter().filter_map(|candidate| candidate.level).max()
}

pub fn direct_grant_level(
    grants: &[EntityPermission],
    principal_id: Uuid,
) -> Option<PermissionLevel> {
    grants
        .iter()
        .filter(|g| g.principal_kind == PrincipalKind::User && g.principal_id == principal_id)
        .map(|g| g.level)
        .max()
}

pub fn role_grant_level(grants: &[EntityPermission], role_ids: &[Uuid]) -> Option<PermissionLevel> {
    grants
        .iter()
        .filter(|g| g.principal_kind == PrincipalKind::Role && role_ids.contains(&g.principal_id))
        .map(|g| g.level)
        .max()
}

/// Any visible parent yields VIEW on the child, never more.
pub fn parent_view_rule<I>(parent_levels: I) -> Option<PermissionLevel>
where
    I: IntoIterator<Item = Option<PermissionLevel>>,
{
    parent_levels
        .into_iter()
        .flatten()
        .any(|level| level.satisfies(PermissionLevel::View))
        .then_some(PermissionLevel::View)
}

/// Type-wide CREATE on any parent type yields CREATE on the child type.
pub fn parent_create_rule<I>(parent_type_levels: I) -> Option<PermissionLevel>
where
    I: IntoIterator<Item = Option<PermissionLevel>>,
{
    parent_type_levels
        .into_iter()
        .flatten()
        .any(|level| level.satisfies(PermissionLevel::Create))
        .then_some(PermissionLevel::Create)
}

/// Per-source candidates plus the folded result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBreakdown {
    pub sources: Vec<SourceLevel>,
    pub effective: Option<PermissionLevel>,
}

impl PermissionBreakdown {
    pub fn from_sources(sources: Vec<SourceLevel>) -> Self {
        let effective = fold_sources(&sources);
        Self { sources, effective }
    }

    /// `-1` when nothing grants access.
    pub fn effective_value(&self) -> i16 {
        level_value(self.effective)
    }

    pub fn satisfies(&self, required: PermissionLevel) -> bool {
        self.effective.is_some_and(|level| level.satisfies(required))
    }

    pub fn level_from(&self, source: PermissionSource) -> Option<PermissionLevel> {
        self.sources
            .iter()
            .find(|candidate| candidate.source == source)
            .and_then(|candidate| candidate.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grant(kind: PrincipalKind, principal_id: Uuid, level: PermissionLevel) -> EntityPermission {
        EntityPermission {
            id: Uuid::new_v4(),
            principal_id,
            principal_kind: kind,
            type_code: "project".into(),
            instance_id: Uuid::new_v4(),
            level,
            granted_by: None,
            expires_at: None,
        }
    }

    #[test]
    fn direct_level_ignores_roles_and_other_users() {
        let user = Uuid::new_v4();
        let grants = vec![
            grant(PrincipalKind::User, user, PermissionLevel::Comment),
            grant(PrincipalKind::User, user, PermissionLevel::Edit),
            grant(PrincipalKind::User, Uuid::new_v4(), PermissionLevel::Owner),
            grant(PrincipalKind::Role, user, PermissionLevel::Owner),
        ];
        assert_eq!(direct_grant_level(&grants, user), Some(PermissionLevel::Edit));
    }

    #[test]
    fn role_level_only_counts_held_roles() {
        let held = Uuid::new_v4();
        let other = Uuid::new_v4();
        let grants = vec![
            grant(PrincipalKind::Role, held, PermissionLevel::Share),
            grant(PrincipalKind::Role, other, PermissionLevel::Owner),
        ];
        assert_eq!(role_grant_level(&grants, &[held]), Some(PermissionLevel::Share));
        assert_eq!(role_grant_level(&grants, &[]), None);
    }

    #[test]
    fn parent_view_never_exceeds_view() {
        assert_eq!(
            parent_view_rule([Some(PermissionLevel::Owner)]),
            Some(PermissionLevel::View)
        );
        assert_eq!(parent_view_rule([None, None]), None);
        assert_eq!(parent_view_rule(Vec::new()), None);
    }

    #[test]
    fn parent_create_requires_create_on_parent_type() {
        assert_eq!(parent_create_rule([Some(PermissionLevel::Delete)]), None);
        assert_eq!(
            parent_create_rule([None, Some(PermissionLevel::Create)]),
            Some(PermissionLevel::Create)
        );
    }

    #[test]
    fn breakdown_reports_minus_one_without_grants() {
        let breakdown = PermissionBreakdown::from_sources(vec![
            SourceLevel::new(PermissionSource::DirectGrant, None),
            SourceLevel::new(PermissionSource::RoleGrant, None),
        ]);
        assert_eq!(breakdown.effective, None);
        assert_eq!(breakdown.effective_value(), -1);
        assert!(!breakdown.satisfies(PermissionLevel::View));
    }

    fn arb_level() -> impl Strategy<Value = Option<PermissionLevel>> {
        prop::option::of((0i16..=7).prop_map(|v| PermissionLevel::from_value(v).unwrap()))
    }

    proptest! {
        #[test]
        fn fold_is_the_maximum_candidate(
            direct in arb_level(),
            role in arb_level(),
            view in arb_level(),
            create in arb_level(),
        ) {
            let sources = vec![
                SourceLevel::new(PermissionSource::DirectGrant, direct),
                SourceLevel::new(PermissionSource::RoleGrant, role),
                SourceLevel::new(PermissionSource::ParentView, view),
                SourceLevel::new(PermissionSource::ParentCreate, create),
            ];
            let expected = [direct, role, view, create].into_iter().flatten().max();
            prop_assert_eq!(fold_sources(&sources), expected);
        }

        #[test]
        fn satisfied_levels_are_downward_closed(effective in arb_level(), required in 0i16..=7) {
            let breakdown = PermissionBreakdown::from_sources(vec![
                SourceLevel::new(PermissionSource::DirectGrant, effective),
            ]);
            let required = PermissionLevel::from_value(required).unwrap();
            if breakdown.satisfies(required) {
                for lower in 0..=required.value() {
                    prop_assert!(breakdown.satisfies(PermissionLevel::from_value(lower).unwrap()));
                }
            }
        }
    }
}
