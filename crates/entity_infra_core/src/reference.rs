//! Batch resolution of instance references embedded in result rows.
//!
//! A field named `<type>_id` holds one reference, `<type>_ids` an array of
//! them, and either may carry a role label: `manager__employee_id`. Every
//! reference in a batch is collected first and then resolved with a single
//! registry lookup, so the cost follows the number of distinct references,
//! not rows times fields.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::types::validate_type_code;

/// Distinct ids to resolve, grouped by type.
pub type ReferenceSet = BTreeMap<String, BTreeSet<Uuid>>;

/// type code -> instance id -> display name. A missing key is "unresolved".
pub type ResolvedReferences = HashMap<String, HashMap<Uuid, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Single,
    Many,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceField {
    pub type_code: String,
    pub label: Option<String>,
    pub kind: ReferenceKind,
}

pub fn parse_reference_field(field: &str) -> Option<ReferenceField> {
    let (base, kind) = if let Some(base) = field.strip_suffix("_ids") {
        (base, ReferenceKind::Many)
    } else if let Some(base) = field.strip_suffix("_id") {
        (base, ReferenceKind::Single)
    } else {
        return None;
    };

    let (label, type_code) = match base.rsplit_once("__") {
        Some((label, type_code)) => (Some(label), type_code),
        None => (None, base),
    };
    if label.is_some_and(str::is_empty) || validate_type_code(type_code).is_err() {
        return None;
    }

    Some(ReferenceField {
        type_code: type_code.to_string(),
        label: label.map(str::to_string),
        kind,
    })
}

/// Walks the rows once and gathers every referenced `(type, id)`. Values that
/// are not UUID strings, and the reserved all-instances id, are skipped.
pub fn collect_references(rows: &[Value], reserved_id: Uuid) -> ReferenceSet {
    let mut fields: HashMap<&str, Option<ReferenceField>> = HashMap::new();
    let mut references = ReferenceSet::new();

    for row in rows {
        let Some(object) = row.as_object() else {
            continue;
        };
        for (name, value) in object {
            let parsed = fields
                .entry(name.as_str())
                .or_insert_with(|| parse_reference_field(name));
            let Some(field) = parsed else {
                continue;
            };

            let mut add = |raw: &Value| {
                if let Some(id) = raw.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    if id != reserved_id {
                        references
                            .entry(field.type_code.clone())
                            .or_default()
                            .insert(id);
                    }
                }
            };
            match (field.kind, value) {
                (ReferenceKind::Many, Value::Array(items)) => items.iter().for_each(&mut add),
                (_, Value::Null) => {}
                _ => add(value),
            }
        }
    }
    references
}

pub fn reference_count(references: &ReferenceSet) -> usize {
    references.values().map(BTreeSet::len).sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedName {
    pub type_code: String,
    pub instance_id: Uuid,
    pub display_name: String,
}

/// Registry-side lookup. Implementations must answer the whole set with one
/// round trip and leave out pairs they do not know.
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn lookup_names(&self, references: &ReferenceSet) -> Result<Vec<ResolvedName>>;
}

pub struct ReferenceResolver<L> {
    lookup: L,
    reserved_id: Uuid,
}

impl<L: NameLookup> ReferenceResolver<L> {
    pub fn new(lookup: L, reserved_id: Uuid) -> Self {
        Self {
            lookup,
            reserved_id,
        }
    }

    pub async fn resolve(&self, rows: &[Value]) -> Result<ResolvedReferences> {
        let references = collect_references(rows, self.reserved_id);
        if references.is_empty() {
            return Ok(ResolvedReferences::new());
        }

        let names = self.lookup.lookup_names(&references).await?;
        debug!(
            rows = rows.len(),
            requested = reference_count(&references),
            resolved = names.len(),
            "resolved references"
        );

        let mut resolved = ResolvedReferences::new();
        for name in names {
            let requested = references
                .get(&name.type_code)
                .is_some_and(|ids| ids.contains(&name.instance_id));
            if requested {
                resolved
                    .entry(name.type_code)
                    .or_default()
                    .insert(name.instance_id, name.display_name);
            }
        }
        Ok(resolved)
    }
}
