//! Destination writer: multi-row idempotent upserts into `PostgreSQL`.
//!
//! A batch becomes one statement of the form
//!
//! ```sql
//! INSERT INTO "public"."niveles" ("_id", "code", "origen")
//! VALUES ($1::"text", $2::"varchar", $3::"varchar"), ($4::"text", DEFAULT, $5::"varchar")
//! ON CONFLICT ("_id") DO UPDATE SET "code" = EXCLUDED."code", "origen" = EXCLUDED."origen"
//! ```
//!
//! Columns are the union of keys present in the batch. Every value is bound as
//! text and cast to the column's type when it is known; a column missing from
//! one record is written as `DEFAULT`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use crate::config::DestinationConfig;
use crate::error::{Error, Result};
use crate::source::Record;

/// Column name -> `udt_name` (e.g. `jsonb`, `timestamptz`, `_text`).
pub type TableColumns = BTreeMap<String, String>;

/// PostgreSQL's bind parameter limit per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Port through which exporters write batches.
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Checks that the destination answers at all.
    async fn ping(&self) -> Result<()>;

    /// Live column set of `table`; empty when the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<TableColumns>;

    /// Upserts `records` into `table` keyed on `primary_key`, returning the
    /// number of rows written.
    async fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        records: &[Record],
        columns: &TableColumns,
    ) -> Result<u64>;
}

/// A ready-to-run upsert statement with its text parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    /// SQL text.
    pub sql: String,
    /// Column list, primary key first.
    pub columns: Vec<String>,
    /// Bound values, in placeholder order.
    pub params: Vec<Option<String>>,
}

/// Quotes an identifier for `PostgreSQL`.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Column list for a batch: the primary key, then every other key in name order.
pub fn batch_columns(primary_key: &str, records: &[Record]) -> Vec<String> {
    let others: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .filter(|k| *k != primary_key)
        .collect();

    std::iter::once(primary_key.to_string())
        .chain(others.into_iter().map(str::to_string))
        .collect()
}

/// Builds the multi-row upsert for `records`.
///
/// Returns `None` for an empty batch.
pub fn build_upsert(
    schema: &str,
    table: &str,
    primary_key: &str,
    records: &[Record],
    types: &TableColumns,
) -> Option<UpsertStatement> {
    if records.is_empty() {
        return None;
    }

    let columns = batch_columns(primary_key, records);
    let mut params = Vec::new();
    let mut rows = Vec::with_capacity(records.len());

    for record in records {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| match record.get(column) {
                Some(value) => {
                    let udt = types.get(column).map(String::as_str);
                    params.push(render_param(value, udt));
                    match udt {
                        Some(udt) => format!("${}::{}", params.len(), quote_ident(udt)),
                        None => format!("${}", params.len()),
                    }
                }
                None => "DEFAULT".to_string(),
            })
            .collect();
        rows.push(format!("({})", cells.join(", ")));
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let update_clause: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != primary_key)
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();

    let conflict = if update_clause.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_clause.join(", "))
    };

    let sql = format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(schema),
        quote_ident(table),
        column_list,
        rows.join(", "),
        quote_ident(primary_key),
        conflict,
    );

    Some(UpsertStatement {
        sql,
        columns,
        params,
    })
}

/// Largest number of rows per statement that stays under [`MAX_BIND_PARAMS`].
pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

/// Text form of a JSON value bound against a column of type `udt`.
///
/// Arrays bound to `PostgreSQL` array columns (`udt_name` starting with `_`)
/// become array literals; other objects and arrays are bound as JSON text.
pub fn render_param(value: &Value, udt: Option<&str>) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(items) if udt.is_some_and(|u| u.starts_with('_')) => {
            Some(pg_array_literal(items))
        }
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn pg_array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Bool(_) | Value::Number(_) => item.to_string(),
            Value::String(s) => quote_array_element(s),
            other => quote_array_element(&other.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `PostgreSQL` implementation of [`DestinationWriter`] over a small sqlx pool.
pub struct PgDestination {
    pool: PgPool,
    schema: String,
}

impl PgDestination {
    /// Creates the pool without opening a connection; use [`DestinationWriter::ping`]
    /// to check reachability.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the connection string cannot be parsed.
    pub fn connect_lazy(config: &DestinationConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect_lazy(&config.url)
            .map_err(|e| Error::Config(format!("invalid destination.url: {}", e)))?;

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }
}

#[async_trait]
impl DestinationWriter for PgDestination {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::DestinationUnreachable(e.to_string()))?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<TableColumns> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, udt_name::text \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::DestinationUnavailable(format!("loading columns of {}: {}", table, e))
        })?;

        Ok(rows.into_iter().collect())
    }

    async fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        records: &[Record],
        columns: &TableColumns,
    ) -> Result<u64> {
        let column_count = batch_columns(primary_key, records).len();
        let chunk_size = rows_per_statement(column_count);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::DestinationUnavailable(format!("begin on {}: {}", table, e)))?;

        let mut written = 0;
        for chunk in records.chunks(chunk_size) {
            let Some(statement) = build_upsert(&self.schema, table, primary_key, chunk, columns)
            else {
                continue;
            };
            debug!(
                "Upserting {} rows x {} columns into {}",
                chunk.len(),
                statement.columns.len(),
                table
            );

            let mut query = sqlx::query(&statement.sql);
            for param in statement.params {
                query = query.bind(param);
            }

            let result = query.execute(&mut *tx).await.map_err(|e| {
                Error::DestinationUnavailable(format!("upsert into {}: {}", table, e))
            })?;
            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::DestinationUnavailable(format!("commit on {}: {}", table, e)))?;

        Ok(written)
    }
}
