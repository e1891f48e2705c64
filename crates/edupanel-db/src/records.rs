//! PostgreSQL implementation of the record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::error::ErrorKind;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use edupanel_core::defaults::INTERNAL_FETCH_LIMIT;
use edupanel_core::{
    payloads, Error, ListRecordsRequest, NewRecord, Record, RecordKind, RecordPatch, RecordStore,
    Result,
};

const COLUMNS: &str = "id, kind, name, parent_id, fields, attachments, created_at, updated_at";

const DEPENDENT_COUNT: &str =
    "(SELECT COUNT(*) FROM admin_record c WHERE c.parent_id = admin_record.id) AS dependent_count";

/// Which statement produced a database error; foreign-key violations mean
/// different things on insert and on delete.
#[derive(Debug, Clone, Copy)]
enum Statement {
    Write,
    Delete,
}

fn map_db_error(e: sqlx::Error, statement: Statement) -> Error {
    if let sqlx::Error::Database(db) = &e {
        let constraint = db.constraint().unwrap_or("unknown").to_string();
        match (db.kind(), statement) {
            (ErrorKind::UniqueViolation, _) => {
                return Error::Conflict(format!(
                    "a record with this kind, parent and name already exists ({})",
                    constraint
                ))
            }
            (ErrorKind::ForeignKeyViolation, Statement::Delete) => {
                return Error::Conflict(format!(
                    "record still has dependent records ({})",
                    constraint
                ))
            }
            (ErrorKind::ForeignKeyViolation, Statement::Write) => {
                return Error::InvalidInput(format!("parent record does not exist ({})", constraint))
            }
            (ErrorKind::CheckViolation, _) | (ErrorKind::NotNullViolation, _) => {
                return Error::InvalidInput(db.message().to_string())
            }
            _ => {}
        }
    }
    Error::Database(e)
}

fn record_from_row(row: &PgRow, with_dependent_count: bool) -> Result<Record> {
    let kind: String = row.try_get("kind")?;
    let fields: JsonValue = row.try_get("fields")?;
    let attachments: JsonValue = row.try_get("attachments")?;

    let fields = match fields {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    };
    let attachments: BTreeMap<String, String> = serde_json::from_value(attachments)?;

    let dependent_count = if with_dependent_count {
        Some(row.try_get::<i64, _>("dependent_count")?)
    } else {
        None
    };

    Ok(Record {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        fields,
        attachments,
        dependent_count,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// PostgreSQL implementation of RecordStore.
///
/// All records live in one `admin_record` table. The `parent_id` foreign key
/// is `ON DELETE RESTRICT`, so delete enforces the dependent check itself.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new PgRecordStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn check_parent(
        tx: &mut Transaction<'_, Postgres>,
        kind: RecordKind,
        parent_id: Uuid,
    ) -> Result<()> {
        let parent_kind: Option<String> =
            sqlx::query_scalar("SELECT kind FROM admin_record WHERE id = $1")
                .bind(parent_id)
                .fetch_optional(&mut **tx)
                .await?;

        let parent_kind: RecordKind = parent_kind
            .ok_or_else(|| {
                Error::InvalidInput(format!("parent record {} does not exist", parent_id))
            })?
            .parse()?;

        match kind.parent_rule().parent_kind() {
            Some(expected) if expected == parent_kind => Ok(()),
            Some(expected) => Err(Error::InvalidInput(format!(
                "{} parent must be a {}, got {}",
                kind, expected, parent_kind
            ))),
            None => Err(Error::InvalidInput(format!("{} records cannot have a parent", kind))),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, new: NewRecord) -> Result<Record> {
        new.validate()?;

        let mut tx = self.pool.begin().await?;
        if let Some(parent_id) = new.parent_id {
            Self::check_parent(&mut tx, new.kind, parent_id).await?;
        }

        let id = Uuid::now_v7();
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO admin_record
                 (id, kind, name, parent_id, fields, attachments, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, '{{}}'::jsonb, $6, $6)
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(new.kind.as_str())
        .bind(&new.name)
        .bind(new.parent_id)
        .bind(JsonValue::Object(new.fields))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_error(e, Statement::Write))?;

        let record = record_from_row(&row, false)?;
        tx.commit().await?;

        debug!(
            subsystem = "database",
            component = "records",
            op = "create",
            record_id = %record.id,
            kind = %record.kind,
            "Record created"
        );
        Ok(record)
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Record> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM admin_record WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::RecordNotFound(id))?;
        let current = record_from_row(&row, false)?;

        let name = patch.name.as_deref().unwrap_or(&current.name);
        payloads::validate_fields(current.kind, name, &patch.merged_fields(&current.fields))?;

        if let Some(parent_id) = patch.parent_id {
            current.kind.parent_rule().check(current.kind, parent_id)?;
            if parent_id == Some(id) {
                return Err(Error::InvalidInput("a record cannot be its own parent".to_string()));
            }
            if let Some(parent_id) = parent_id {
                Self::check_parent(&mut tx, current.kind, parent_id).await?;
            }
        }

        let unlinked: Vec<String> = patch
            .attachments
            .iter()
            .filter(|(_, r)| r.is_none())
            .map(|(s, _)| s.clone())
            .collect();
        let linked: JsonMap<String, JsonValue> = patch
            .attachments
            .iter()
            .filter_map(|(s, r)| r.as_ref().map(|r| (s.clone(), JsonValue::String(r.clone()))))
            .collect();

        let row = sqlx::query(&format!(
            "UPDATE admin_record SET
                 name = COALESCE($2, name),
                 parent_id = CASE WHEN $3 THEN $4 ELSE parent_id END,
                 fields = (fields - $5::text[]) || $6::jsonb,
                 attachments = (attachments - $7::text[]) || $8::jsonb,
                 updated_at = $9
             WHERE id = $1
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(patch.name.as_deref())
        .bind(patch.parent_id.is_some())
        .bind(patch.parent_id.flatten())
        .bind(&patch.remove_fields)
        .bind(JsonValue::Object(patch.set_fields.clone()))
        .bind(&unlinked)
        .bind(JsonValue::Object(linked))
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_error(e, Statement::Write))?;

        let record = record_from_row(&row, false)?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, id: Uuid, with_dependent_count: bool) -> Result<Record> {
        let sql = if with_dependent_count {
            format!("SELECT {}, {} FROM admin_record WHERE id = $1", COLUMNS, DEPENDENT_COUNT)
        } else {
            format!("SELECT {} FROM admin_record WHERE id = $1", COLUMNS)
        };

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::RecordNotFound(id))?;

        record_from_row(&row, with_dependent_count)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM admin_record WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error(e, Statement::Delete))?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordNotFound(id));
        }
        debug!(
            subsystem = "database",
            component = "records",
            op = "delete",
            record_id = %id,
            "Record deleted"
        );
        Ok(())
    }

    async fn list(&self, req: ListRecordsRequest) -> Result<Vec<Record>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM admin_record WHERE TRUE", COLUMNS));

        if let Some(kind) = req.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(name) = req.name {
            qb.push(" AND name = ").push_bind(name);
        }
        if let Some(parent_id) = req.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent_id);
        }
        qb.push(" ORDER BY created_at, id LIMIT ")
            .push_bind(req.limit.unwrap_or(INTERNAL_FETCH_LIMIT))
            .push(" OFFSET ")
            .push_bind(req.offset.unwrap_or(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| record_from_row(row, false)).collect()
    }
}
