//! PostgreSQL store adapter.
//!
//! Rows are read as whole documents with `to_jsonb(t)` and written back with
//! `jsonb_populate_record`, so the adapter never needs to know the column
//! types of a collection. Only the column names are looked up (once per
//! collection) to build the upsert statement.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tracing::{debug, info, warn};

use super::tls::SslMode;
use crate::config::StoreConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{Collection, CountFilter, KeyRange, Record, RecordKey, StoreAdapter};
use crate::error::{MigrateError, Result};

/// PostgreSQL-backed [`StoreAdapter`].
pub struct PostgresStore {
    pool: Pool,
    schema: String,
    label: String,
    columns: Mutex<HashMap<String, Arc<[String]>>>,
    /// Collections already warned about NULL timestamps.
    untimed: Mutex<HashSet<String>>,
}

impl PostgresStore {
    /// Connect a pool and verify the store is reachable.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let label = config.redacted_url();
        let pg_config = PgConfig::from_str(&config.url)
            .map_err(|e| MigrateError::Config(format!("invalid store url {}: {}", label, e)))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match SslMode::from_str(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("TLS is disabled for {}; credentials travel in plaintext", label);
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| MigrateError::pool(e, format!("creating pool for {}", label)))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connectivity(label.clone(), e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connectivity(label.clone(), e.to_string()))?;

        info!("Connected to PostgreSQL store {}", label);

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            label,
            columns: Mutex::new(HashMap::new()),
            untimed: Mutex::new(HashSet::new()),
        })
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("{} on {}", context, self.label)))
    }

    fn table(&self, collection: &Collection) -> Result<String> {
        qualify_pg(&self.schema, &collection.name)
    }

    /// `SELECT key, created_at, updated_at, document FROM table t`
    fn select_sql(&self, collection: &Collection) -> Result<String> {
        Ok(format!(
            "SELECT t.{key}::int8, t.{crt}::timestamptz, t.{upd}::timestamptz, to_jsonb(t) FROM {table} t",
            key = quote_pg(&collection.key_column)?,
            crt = quote_pg(&collection.created_at_column)?,
            upd = quote_pg(&collection.updated_at_column)?,
            table = self.table(collection)?,
        ))
    }

    fn changed_predicate(collection: &Collection) -> Result<String> {
        Ok(format!(
            "t.{upd}::timestamptz > $1 OR t.{crt}::timestamptz > $1",
            upd = quote_pg(&collection.updated_at_column)?,
            crt = quote_pg(&collection.created_at_column)?,
        ))
    }

    async fn query_records(
        &self,
        collection: &Collection,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Record>> {
        let client = self.client("fetching records").await?;
        let rows = client.query(sql, params).await?;
        let mut untimed = 0usize;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let (record, complete) = record_from_row(collection, row)?;
            if !complete {
                untimed += 1;
            }
            records.push(record);
        }
        if untimed > 0 {
            self.warn_untimed(collection, untimed);
        }
        Ok(records)
    }

    fn warn_untimed(&self, collection: &Collection, rows: usize) {
        let first = self
            .untimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(collection.name.clone());
        if first {
            warn!(
                "{}: {} row(s) with NULL {} or {}; changes to them may not be replicated",
                collection.name, rows, collection.created_at_column, collection.updated_at_column
            );
        }
    }

    /// Column names of a collection, cached after the first lookup.
    async fn columns(&self, collection: &Collection) -> Result<Arc<[String]>> {
        if let Some(cols) = self.lock_columns().get(&collection.name) {
            return Ok(cols.clone());
        }

        let client = self.client("loading columns").await?;
        let rows = client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&self.schema, &collection.name],
            )
            .await?;
        if rows.is_empty() {
            return Err(MigrateError::schema(
                &collection.name,
                None,
                format!("table not found in schema {}", self.schema),
            ));
        }

        let cols: Arc<[String]> = rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into();
        debug!("{}: {} columns", collection, cols.len());
        self.lock_columns()
            .insert(collection.name.clone(), cols.clone());
        Ok(cols)
    }

    fn lock_columns(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<[String]>>> {
        self.columns.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn upsert_sql(&self, collection: &Collection) -> Result<String> {
        let columns = self.columns(collection).await?;
        build_upsert_sql(&self.table(collection)?, &collection.key_column, &columns)
    }
}

/// `INSERT ... SELECT FROM jsonb_populate_record(...) ON CONFLICT (key) DO UPDATE`.
fn build_upsert_sql(table: &str, key_column: &str, columns: &[String]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?;
    let key = quote_pg(key_column)?;
    let col_list = quoted.join(", ");

    let updates: Vec<String> = quoted
        .iter()
        .filter(|c| **c != key)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {table} ({col_list}) \
         SELECT {col_list} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({key}) {on_conflict}"
    ))
}

/// Decode a row. The flag is false when a timestamp column was NULL.
fn record_from_row(collection: &Collection, row: &Row) -> Result<(Record, bool)> {
    let key: i64 = row.try_get(0)?;
    let created_at: Option<DateTime<Utc>> = row.try_get(1)?;
    let updated_at: Option<DateTime<Utc>> = row.try_get(2)?;
    let fields = match row.try_get::<_, Value>(3)? {
        Value::Object(map) => map,
        other => {
            return Err(MigrateError::schema(
                &collection.name,
                Some(key),
                format!("row did not render as an object: {}", other),
            ))
        }
    };

    let complete = created_at.is_some() && updated_at.is_some();
    let (created_at, updated_at) = fill_timestamps(created_at, updated_at);
    Ok((
        Record {
            key: RecordKey(key),
            created_at,
            updated_at,
            fields,
        },
        complete,
    ))
}

/// A NULL timestamp takes the other column's value; both NULL means the epoch.
fn fill_timestamps(
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match (created_at, updated_at) {
        (Some(c), Some(u)) => (c, u),
        (Some(t), None) | (None, Some(t)) => (t, t),
        (None, None) => (DateTime::<Utc>::UNIX_EPOCH, DateTime::<Utc>::UNIX_EPOCH),
    }
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    async fn count(&self, collection: &Collection, filter: CountFilter) -> Result<u64> {
        let table = self.table(collection)?;
        let client = self.client("counting records").await?;
        let row = match filter {
            CountFilter::All => {
                client
                    .query_one(&format!("SELECT count(*) FROM {} t", table), &[])
                    .await?
            }
            CountFilter::ChangedSince(ts) => {
                let sql = format!(
                    "SELECT count(*) FROM {} t WHERE {}",
                    table,
                    Self::changed_predicate(collection)?
                );
                client.query_one(&sql, &[&ts]).await?
            }
        };
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn batch_boundaries(
        &self,
        collection: &Collection,
        batch_size: usize,
    ) -> Result<Vec<KeyRange>> {
        let key = quote_pg(&collection.key_column)?;
        let sql = format!(
            "SELECT k, rn FROM ( \
               SELECT t.{key}::int8 AS k, \
                      row_number() OVER (ORDER BY t.{key}) AS rn, \
                      count(*) OVER () AS total \
               FROM {table} t \
             ) s WHERE rn % $1 = 0 OR rn = total ORDER BY k",
            key = key,
            table = self.table(collection)?,
        );

        let client = self.client("planning batches").await?;
        let rows = client.query(&sql, &[&(batch_size.max(1) as i64)]).await?;

        let mut ranges = Vec::with_capacity(rows.len());
        let mut after = None;
        let mut prev_rn = 0i64;
        for (batch_id, row) in rows.iter().enumerate() {
            let last = RecordKey(row.try_get(0)?);
            let rn: i64 = row.try_get(1)?;
            ranges.push(KeyRange {
                batch_id,
                after,
                last,
                len: (rn - prev_rn) as usize,
            });
            after = Some(last);
            prev_rn = rn;
        }
        Ok(ranges)
    }

    async fn fetch_page(
        &self,
        collection: &Collection,
        after_key: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let key = quote_pg(&collection.key_column)?;
        let sql = format!(
            "{} WHERE ($1::int8 IS NULL OR t.{key} > $1) ORDER BY t.{key} LIMIT $2",
            self.select_sql(collection)?,
        );
        let after: Option<i64> = after_key.map(|k| k.0);
        self.query_records(collection, &sql, &[&after, &(limit as i64)])
            .await
    }

    async fn fetch_changed_since(
        &self,
        collection: &Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let sql = format!(
            "{} WHERE {} ORDER BY t.{} ASC, t.{} ASC",
            self.select_sql(collection)?,
            Self::changed_predicate(collection)?,
            quote_pg(&collection.updated_at_column)?,
            quote_pg(&collection.key_column)?,
        );
        self.query_records(collection, &sql, &[&since]).await
    }

    async fn fetch_recent(&self, collection: &Collection, limit: usize) -> Result<Vec<Record>> {
        let sql = format!(
            "{} ORDER BY t.{} DESC NULLS LAST, t.{} DESC LIMIT $1",
            self.select_sql(collection)?,
            quote_pg(&collection.updated_at_column)?,
            quote_pg(&collection.key_column)?,
        );
        self.query_records(collection, &sql, &[&(limit as i64)])
            .await
    }

    async fn fetch_by_keys(
        &self,
        collection: &Collection,
        keys: &[RecordKey],
    ) -> Result<Vec<Record>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{} WHERE t.{}::int8 = ANY($1::int8[])",
            self.select_sql(collection)?,
            quote_pg(&collection.key_column)?,
        );
        let ids: Vec<i64> = keys.iter().map(|k| k.0).collect();
        self.query_records(collection, &sql, &[&ids]).await
    }

    async fn latest_change(&self, collection: &Collection) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT max(t.{}::timestamptz) FROM {} t",
            quote_pg(&collection.updated_at_column)?,
            self.table(collection)?,
        );
        let client = self.client("reading latest change").await?;
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn upsert(&self, collection: &Collection, record: &Record) -> Result<()> {
        let sql = self.upsert_sql(collection).await?;
        let client = self.client("upserting record").await?;
        client
            .execute(&sql, &[&record.to_document(collection)])
            .await?;
        Ok(())
    }

    async fn upsert_many(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = self.upsert_sql(collection).await?;
        let mut client = self.client("upserting batch").await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(&sql).await?;
        for record in records {
            tx.execute(&stmt, &[&record.to_document(collection)])
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn store_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}
