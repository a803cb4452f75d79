//! SQL filter equivalent to "rows this principal may access at this level".
//!
//! The fragment is embedded in a list query's WHERE clause instead of
//! post-filtering results. Every value that ends up in the text is either a
//! validated identifier, a formatted UUID or an integer, so the fragment can
//! be pasted into dynamic SQL without bind parameters. Role membership and
//! expiry are evaluated by the database at query time.

use std::fmt;

use entity_infra_core::{
    validate_identifier, validate_type_code, PermissionLevel, ResolverConfig, Result,
};
use uuid::Uuid;

/// Column of the filtered table holding the instance id.
pub const INSTANCE_ID_COLUMN: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPredicate {
    sql: String,
}

impl PermissionPredicate {
    pub fn as_sql(&self) -> &str {
        &self.sql
    }

    pub fn into_sql(self) -> String {
        self.sql
    }
}

impl fmt::Display for PermissionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

pub fn permission_predicate(
    config: &ResolverConfig,
    principal_id: Uuid,
    type_code: &str,
    required: PermissionLevel,
    alias: &str,
) -> Result<PermissionPredicate> {
    validate_type_code(type_code)?;
    validate_identifier("table alias", alias)?;
    config.validate()?;

    let builder = PredicateBuilder {
        config,
        principal_id,
    };
    let column = format!("{alias}.{INSTANCE_ID_COLUMN}");
    let all = config.all_instances_id;
    let level = required.value();

    let mut branches = vec![
        format!(
            "EXISTS (SELECT 1 FROM entity_infra.entity_permission ei_tw \
             WHERE ei_tw.type_code = '{type_code}' AND ei_tw.instance_id = '{all}' \
             AND ei_tw.level >= {level} AND {})",
            builder.holds("ei_tw")
        ),
        format!(
            "{column} IN (SELECT ei_ig.instance_id FROM entity_infra.entity_permission ei_ig \
             WHERE ei_ig.type_code = '{type_code}' AND ei_ig.instance_id <> '{all}' \
             AND ei_ig.level >= {level} AND {})",
            builder.holds("ei_ig")
        ),
    ];
    if required == PermissionLevel::View && config.parent_view_depth > 0 {
        branches.push(format!(
            "{column} IN ({})",
            builder.inherited_view(type_code)
        ));
    }

    Ok(PermissionPredicate {
        sql: format!("({})", branches.join(" OR ")),
    })
}

struct PredicateBuilder<'a> {
    config: &'a ResolverConfig,
    principal_id: Uuid,
}

impl PredicateBuilder<'_> {
    /// The grant row under `grant` belongs to the principal or one of their
    /// roles, and has not expired.
    fn holds(&self, grant: &str) -> String {
        let principal = self.principal_id;
        let role_type = &self.config.role_type;
        let principal_type = &self.config.principal_type;
        format!(
            "(({grant}.principal_kind = 'user' AND {grant}.principal_id = '{principal}') \
             OR ({grant}.principal_kind = 'role' AND {grant}.principal_id IN (\
             SELECT {grant}_m.parent_instance_id FROM entity_infra.entity_link {grant}_m \
             WHERE {grant}_m.parent_type_code = '{role_type}' \
             AND {grant}_m.child_type_code = '{principal_type}' \
             AND {grant}_m.child_instance_id = '{principal}'))) \
             AND ({grant}.expires_at IS NULL OR {grant}.expires_at > now())"
        )
    }

    /// Ids of `type_code` instances reachable, within the configured depth,
    /// from an instance the principal holds any grant on.
    fn inherited_view(&self, type_code: &str) -> String {
        let all = self.config.all_instances_id;
        let depth = self.config.parent_view_depth;
        format!(
            "WITH RECURSIVE ei_visible (type_code, instance_id, depth) AS (\
             SELECT ei_seed.type_code, ei_seed.instance_id, 0 FROM (\
             SELECT ei_vg.type_code, ei_vg.instance_id FROM entity_infra.entity_permission ei_vg \
             WHERE ei_vg.instance_id <> '{all}' AND {vg} \
             UNION \
             SELECT ei_vr.type_code, ei_vr.instance_id FROM entity_infra.entity_instance ei_vr \
             JOIN entity_infra.entity_permission ei_vw \
             ON ei_vw.type_code = ei_vr.type_code AND ei_vw.instance_id = '{all}' \
             WHERE {vw}) ei_seed \
             UNION \
             SELECT ei_vl.child_type_code, ei_vl.child_instance_id, ei_v.depth + 1 \
             FROM ei_visible ei_v JOIN entity_infra.entity_link ei_vl \
             ON ei_vl.parent_type_code = ei_v.type_code \
             AND ei_vl.parent_instance_id = ei_v.instance_id \
             WHERE ei_v.depth < {depth}) \
             SELECT ei_visible.instance_id FROM ei_visible \
             WHERE ei_visible.type_code = '{type_code}' AND ei_visible.depth > 0",
            vg = self.holds("ei_vg"),
            vw = self.holds("ei_vw"),
        )
    }
}
