//! Access to caller-owned business tables.
//!
//! The coordinator never knows the shape of a business record; it hands the
//! payload to a [`PrimaryTable`] on its own transaction and reads back the
//! stored row.

use async_trait::async_trait;
use entity_infra_core::{
    validate_identifier, validate_type_code, EntityError, Payload, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::storage_err;

/// A business row as stored, serialized to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    pub id: Uuid,
    pub version: Option<i64>,
    pub data: Payload,
}

impl PrimaryRecord {
    /// Builds a record from a `to_jsonb(row)` value.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(data) = value else {
            return Err(EntityError::Transaction(anyhow::anyhow!(
                "primary row is not a JSON object"
            )));
        };
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                EntityError::Transaction(anyhow::anyhow!("primary row has no uuid 'id' column"))
            })?;
        let version = data.get("version").and_then(Value::as_i64);
        Ok(Self { id, version, data })
    }
}

#[async_trait]
pub trait PrimaryTable: Send + Sync {
    async fn insert(
        &self,
        conn: &mut PgConnection,
        type_code: &str,
        payload: &Payload,
    ) -> Result<PrimaryRecord>;

    /// `Ok(None)` when no row has that id. A stale `expected_version` is a
    /// `Conflict`.
    async fn update(
        &self,
        conn: &mut PgConnection,
        type_code: &str,
        id: Uuid,
        payload: &Payload,
        expected_version: Option<i64>,
    ) -> Result<Option<PrimaryRecord>>;

    /// Soft delete. Returns whether a row was found.
    async fn deactivate(&self, conn: &mut PgConnection, type_code: &str, id: Uuid) -> Result<bool>;

    async fn delete(&self, conn: &mut PgConnection, type_code: &str, id: Uuid) -> Result<bool>;
}

/// Tables named `<schema>.<type_code>` with `id UUID DEFAULT gen_random_uuid()`,
/// `version BIGINT` and `active BOOLEAN`. Other columns are filled from the
/// payload through `jsonb_populate_record`, which applies the column types.
#[derive(Debug, Clone)]
pub struct ConventionalPrimaryTable {
    schema: String,
}

const MANAGED_COLUMNS: &[&str] = &["version"];

impl ConventionalPrimaryTable {
    pub fn new(schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        validate_identifier("schema", &schema)?;
        Ok(Self { schema })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, type_code: &str) -> Result<String> {
        validate_type_code(type_code)?;
        Ok(format!("\"{}\".\"{}\"", self.schema, type_code))
    }

    fn columns(payload: &Payload) -> Result<Vec<String>> {
        if payload.is_empty() {
            return Err(EntityError::validation("payload has no fields"));
        }
        payload
            .keys()
            .map(|key| {
                validate_identifier("column", key)?;
                if MANAGED_COLUMNS.contains(&key.as_str()) {
                    return Err(EntityError::validation(format!(
                        "column '{key}' is maintained by the store"
                    )));
                }
                Ok(format!("\"{key}\""))
            })
            .collect()
    }
}

#[async_trait]
impl PrimaryTable for ConventionalPrimaryTable {
    async fn insert(
        &self,
        conn: &mut PgConnection,
        type_code: &str,
        payload: &Payload,
    ) -> Result<PrimaryRecord> {
        let table = self.table(type_code)?;
        let columns = Self::columns(payload)?.join(", ");
        let sql = format!(
            "INSERT INTO {table} AS t ({columns}) \
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
             RETURNING to_jsonb(t) AS record"
        );
        let row = sqlx::query(&sql)
            .bind(Value::Object(payload.clone()))
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_err)?;
        PrimaryRecord::from_json(row.try_get("record").map_err(storage_err)?)
    }

    async fn update(
        &self,
        conn: &mut PgConnection,
        type_code: &str,
        id: Uuid,
        payload: &Payload,
        expected_version: Option<i64>,
    ) -> Result<Option<PrimaryRecord>> {
        let table = self.table(type_code)?;
        if payload.contains_key("id") {
            return Err(EntityError::validation("the 'id' column cannot be updated"));
        }
        let columns = Self::columns(payload)?.join(", ");
        let sql = format!(
            "UPDATE {table} AS t \
             SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $2)), \
                 version = t.version + 1 \
             WHERE t.id = $1 AND ($3::bigint IS NULL OR t.version = $3) \
             RETURNING to_jsonb(t) AS record"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(Value::Object(payload.clone()))
            .bind(expected_version)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_err)?;

        if let Some(row) = row {
            return PrimaryRecord::from_json(row.try_get("record").map_err(storage_err)?).map(Some);
        }
        let Some(expected) = expected_version else {
            return Ok(None);
        };

        let current: Option<i64> =
            sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(storage_err)?;
        match current {
            Some(found) => Err(EntityError::Conflict(format!(
                "{type_code}:{id} is at version {found}, expected {expected}"
            ))),
            None => Ok(None),
        }
    }

    async fn deactivate(&self, conn: &mut PgConnection, type_code: &str, id: Uuid) -> Result<bool> {
        let table = self.table(type_code)?;
        let sql = format!("UPDATE {table} SET active = FALSE, version = version + 1 WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, conn: &mut PgConnection, type_code: &str, id: Uuid) -> Result<bool> {
        let table = self.table(type_code)?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn schema_must_be_an_identifier() {
        assert!(ConventionalPrimaryTable::new("app").is_ok());
        assert!(ConventionalPrimaryTable::new("app\"; drop").is_err());
    }

    #[test]
    fn columns_are_quoted_and_validated() {
        let cols = ConventionalPrimaryTable::columns(&payload(json!({"name": "x", "code": "X"})))
            .unwrap();
        assert_eq!(cols, vec!["\"code\"", "\"name\""]);

        assert!(ConventionalPrimaryTable::columns(&Payload::new()).is_err());
        assert!(ConventionalPrimaryTable::columns(&payload(json!({"Name": 1}))).is_err());
        assert!(ConventionalPrimaryTable::columns(&payload(json!({"version": 3}))).is_err());
    }

    #[test]
    fn record_from_json_reads_id_and_version() {
        let id = Uuid::new_v4();
        let record =
            PrimaryRecord::from_json(json!({"id": id, "version": 4, "name": "Apollo"})).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.version, Some(4));
        assert_eq!(record.data["name"], "Apollo");

        assert!(PrimaryRecord::from_json(json!({"name": "no id"})).is_err());
        assert!(PrimaryRecord::from_json(json!([1, 2])).is_err());
    }
}
