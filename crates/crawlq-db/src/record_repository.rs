use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};

use crawlq_core::error::AppError;
use crawlq_core::record::{CompareOp, Filter, FindOptions, Record, RecordStore, SortOrder};
use crawlq_core::task::Options;

/// PostgreSQL-backed record store.
///
/// Known columns are compared natively; any other filter or sort field
/// addresses a key inside the `data` document.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    url: String,
    domain: String,
    plan_name: String,
    depth: i32,
    data: Value,
    links: Vec<String>,
    error: Option<String>,
    data_hash: String,
    parsed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: row.id,
            url: row.url,
            domain: row.domain,
            plan_name: row.plan_name,
            depth: row.depth.max(0) as u32,
            data: match row.data {
                Value::Object(map) => map,
                _ => Options::new(),
            },
            links: row.links,
            error: row.error,
            data_hash: row.data_hash,
            parsed_at: row.parsed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Text,
    Integer,
    Timestamp,
}

fn column_kind(field: &str) -> Result<Option<ColumnKind>, AppError> {
    Ok(match field {
        "id" | "url" | "domain" | "plan_name" | "error" | "data_hash" => Some(ColumnKind::Text),
        "depth" => Some(ColumnKind::Integer),
        "parsed_at" | "created_at" | "updated_at" => Some(ColumnKind::Timestamp),
        "data" | "links" => {
            return Err(AppError::InvalidFilter(format!(
                "field '{field}' cannot be compared directly"
            )));
        }
        _ => None,
    })
}

/// Right-hand side of a comparison, typed for binding.
enum Operand {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Document(Value),
}

impl Operand {
    fn for_column(kind: ColumnKind, field: &str, value: &Value) -> Result<Self, AppError> {
        let mismatch = |expected: &str| {
            AppError::InvalidFilter(format!("'{field}' expects {expected}, got {value}"))
        };
        match kind {
            ColumnKind::Text => value
                .as_str()
                .map(|s| Operand::Text(s.to_string()))
                .ok_or_else(|| mismatch("a string")),
            ColumnKind::Integer => value
                .as_i64()
                .map(Operand::Integer)
                .ok_or_else(|| mismatch("an integer")),
            ColumnKind::Timestamp => {
                let raw = value.as_str().ok_or_else(|| mismatch("an RFC 3339 timestamp"))?;
                DateTime::parse_from_rfc3339(raw)
                    .map(|ts| Operand::Timestamp(ts.with_timezone(&Utc)))
                    .map_err(|_| mismatch("an RFC 3339 timestamp"))
            }
        }
    }

    fn bind(self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Operand::Text(v) => qb.push_bind(v),
            Operand::Integer(v) => qb.push_bind(v),
            Operand::Timestamp(v) => qb.push_bind(v),
            Operand::Document(v) => qb.push_bind(Json(v)),
        };
    }
}

fn push_field(qb: &mut QueryBuilder<'_, Postgres>, field: &str, kind: Option<ColumnKind>) {
    if kind.is_some() {
        // Whitelisted by column_kind.
        qb.push(field);
    } else {
        qb.push("(data -> ");
        qb.push_bind(field.to_string());
        qb.push(")");
    }
}

fn push_clause(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    op: CompareOp,
    value: &Value,
) -> Result<(), AppError> {
    let kind = column_kind(field)?;

    if value.is_null() {
        let check = match op {
            CompareOp::Eq => " IS NULL",
            CompareOp::Ne => " IS NOT NULL",
            _ => {
                return Err(AppError::InvalidFilter(format!(
                    "'{field}': operator '{op}' cannot compare against null"
                )));
            }
        };
        push_field(qb, field, kind);
        qb.push(check);
        return Ok(());
    }

    let operand = match kind {
        Some(kind) => Operand::for_column(kind, field, value)?,
        None => Operand::Document(value.clone()),
    };
    push_field(qb, field, kind);
    qb.push(" ").push(op.sql()).push(" ");
    operand.bind(qb);
    Ok(())
}

/// Append `WHERE ...` for every condition in the filter.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), AppError> {
    let mut first = true;
    for (field, condition) in filter.iter() {
        for (op, value) in condition.clauses() {
            qb.push(if first { " WHERE " } else { " AND " });
            first = false;
            push_clause(qb, field, op, value)?;
        }
    }
    Ok(())
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, options: &FindOptions) -> Result<(), AppError> {
    if options.sort.is_empty() {
        qb.push(" ORDER BY created_at ASC, id ASC");
        return Ok(());
    }
    qb.push(" ORDER BY ");
    for (i, (field, order)) in options.sort.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        let kind = column_kind(field)?;
        push_field(qb, field, kind);
        qb.push(match order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        });
    }
    Ok(())
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// `records.depth` is INTEGER.
fn depth_column(depth: u32) -> Result<i32, AppError> {
    i32::try_from(depth)
        .map_err(|_| AppError::DatabaseError(format!("depth {depth} does not fit in an INTEGER column")))
}

fn select_query<'a>(filter: &Filter, options: &FindOptions) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let mut qb = QueryBuilder::new("SELECT * FROM records");
    push_filter(&mut qb, filter)?;
    push_order(&mut qb, options)?;
    if let Some(limit) = options.limit {
        qb.push(" LIMIT ").push_bind(to_i64(limit));
    }
    if let Some(offset) = options.offset {
        qb.push(" OFFSET ").push_bind(to_i64(offset));
    }
    Ok(qb)
}

fn count_query<'a>(filter: &Filter) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM records");
    push_filter(&mut qb, filter)?;
    Ok(qb)
}

impl RecordStore for PgRecordStore {
    async fn create(&self, record: &Record) -> Result<String, AppError> {
        let id = if record.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id.clone()
        };

        let id = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO records
                (id, url, domain, plan_name, depth, data, links, error, data_hash,
                 parsed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(&id)
        .bind(&record.url)
        .bind(&record.domain)
        .bind(&record.plan_name)
        .bind(depth_column(record.depth)?)
        .bind(Value::Object(record.data.clone()))
        .bind(&record.links)
        .bind(&record.error)
        .bind(&record.data_hash)
        .bind(record.parsed_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn update(&self, record: &Record) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET url = $2, domain = $3, plan_name = $4, depth = $5, data = $6,
                links = $7, error = $8, data_hash = $9, parsed_at = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.url)
        .bind(&record.domain)
        .bind(&record.plan_name)
        .bind(depth_column(record.depth)?)
        .bind(Value::Object(record.data.clone()))
        .bind(&record.links)
        .bind(&record.error)
        .bind(&record.data_hash)
        .bind(record.parsed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::RecordNotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Record>, AppError> {
        let mut qb = select_query(filter, options)?;
        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, AppError> {
        let options = FindOptions::default().with_limit(1);
        let mut qb = select_query(filter, &options)?;
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn count(&self, filter: &Filter) -> Result<u64, AppError> {
        let mut qb = count_query(filter)?;
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_depth_column_rejects_overflow() {
        assert_eq!(depth_column(3).unwrap(), 3);
        assert_eq!(depth_column(i32::MAX as u32).unwrap(), i32::MAX);
        let err = depth_column(u32::MAX).unwrap_err();
        assert!(matches!(err, AppError::DatabaseError(ref m) if m.contains("4294967295")));
    }

    #[test]
    fn test_select_without_filter() {
        let qb = select_query(&Filter::new(), &FindOptions::default()).unwrap();
        assert_eq!(qb.sql(), "SELECT * FROM records ORDER BY created_at ASC, id ASC");
    }

    #[test]
    fn test_columns_and_data_keys() {
        let filter = Filter::new()
            .compare("depth", CompareOp::Gt, 0)
            .eq("plan_name", "hackernews")
            .compare("score", CompareOp::Gte, 100);
        let options = FindOptions::default()
            .sort_by("parsed_at", SortOrder::Desc)
            .with_limit(10)
            .with_offset(20);

        let qb = select_query(&filter, &options).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT * FROM records WHERE depth > $1 AND plan_name = $2 \
             AND (data -> $3) >= $4 ORDER BY parsed_at DESC LIMIT $5 OFFSET $6"
        );
    }

    #[test]
    fn test_null_and_not_equal() {
        let filter = Filter::new()
            .eq("error", Value::Null)
            .compare("title", CompareOp::Ne, "x");
        let qb = count_query(&filter).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM records WHERE error IS NULL \
             AND (data -> $1) IS DISTINCT FROM $2"
        );
    }

    #[test]
    fn test_type_mismatch_is_invalid_filter() {
        let err = count_query(&Filter::new().eq("depth", "deep")).err().unwrap();
        assert!(matches!(err, AppError::InvalidFilter(_)));

        let err = count_query(&Filter::new().eq("created_at", "yesterday")).err().unwrap();
        assert!(matches!(err, AppError::InvalidFilter(_)));

        let err = count_query(&Filter::new().compare("depth", CompareOp::Gt, json!(null)))
            .err().unwrap();
        assert!(matches!(err, AppError::InvalidFilter(_)));
    }

    #[test]
    fn test_links_not_filterable() {
        let err = count_query(&Filter::new().eq("links", "https://a.test/")).err().unwrap();
        assert!(matches!(err, AppError::InvalidFilter(_)));
    }
}
