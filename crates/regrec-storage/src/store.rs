//! Local SQLite store: connection handling, settings, and the read/update
//! queries behind the dashboard.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use regrec_core::{fields, quote_ident, Cell, ColumnKind, PeriodTable};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use crate::schema::{load_schema, TableSchema};
use crate::StoreError;

/// One persisted row keyed by column name.
pub type StoredRow = BTreeMap<String, Cell>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableStatistics {
    pub total: i64,
    pub missing_count: i64,
    pub missing_percentage: f64,
    pub rejected_count: i64,
    pub reviewed_count: i64,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "opened local store");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every handle sees the same data.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Create the settings table and seed any missing keys.
    pub async fn ensure_settings(&self, defaults: &[(&str, &str)]) -> Result<(), StoreError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT)")
            .execute(&self.pool)
            .await?;
        for (key, value) in defaults {
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn settings(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Option<String> = row.try_get("value")?;
            out.insert(key, value.unwrap_or_default());
        }
        Ok(out)
    }

    /// Only keys that already exist are updated; returns how many were.
    pub async fn update_settings(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (key, value) in values {
            updated += sqlx::query("UPDATE settings SET value = ?1 WHERE key = ?2")
                .bind(value)
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Period tables for a family prefix, newest period first.
    pub async fn list_period_tables(&self, prefix: &str) -> Result<Vec<PeriodTable>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await?;
        let mut tables = names
            .iter()
            .filter_map(|name| PeriodTable::from_name(prefix, name))
            .collect::<Vec<_>>();
        tables.sort_by(|a, b| b.period().cmp(a.period()));
        Ok(tables)
    }

    pub async fn fetch_rows(&self, table: &PeriodTable) -> Result<Vec<StoredRow>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let schema = require_schema(&mut conn, table).await?;
        let order = if schema.contains(fields::FILE_LABEL) {
            fields::FILE_LABEL
        } else {
            fields::SECONDARY_ID
        };
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            select_list(&schema, schema.columns.keys()),
            table.quoted(),
            quote_ident(order)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter().map(|row| decode_row(&schema, row)).collect()
    }

    pub async fn fetch_row(
        &self,
        table: &PeriodTable,
        secondary_id: &str,
    ) -> Result<Option<StoredRow>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let schema = require_schema(&mut conn, table).await?;
        fetch_cells(&mut conn, table, &schema, schema.columns.keys(), secondary_id).await
    }

    /// Explicit reviewer edit; the only path that writes reviewer fields of an
    /// existing row. Leaves `last_updated` alone.
    pub async fn update_reviewer_fields(
        &self,
        table: &PeriodTable,
        secondary_id: &str,
        reviewer_comment: &str,
        reviewed_ok: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        require_schema(&mut conn, table).await?;
        let sql = format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3",
            table.quoted(),
            quote_ident(fields::REVIEWER_COMMENT),
            quote_ident(fields::REVIEWED_OK),
            quote_ident(fields::SECONDARY_ID)
        );
        let result = sqlx::query(&sql)
            .bind(reviewer_comment)
            .bind(reviewed_ok)
            .bind(secondary_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn statistics(&self, table: &PeriodTable) -> Result<TableStatistics, StoreError> {
        let mut conn = self.pool.acquire().await?;
        require_schema(&mut conn, table).await?;
        let sql = format!(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN {found} IS NULL OR {found} = 0 THEN 1 ELSE 0 END), 0) AS missing, \
                    COALESCE(SUM(CASE WHEN {rejected} = 1 THEN 1 ELSE 0 END), 0) AS rejected, \
                    COALESCE(SUM(CASE WHEN {ok} = 1 THEN 1 ELSE 0 END), 0) AS reviewed \
               FROM {table}",
            found = quote_ident(fields::IMPORT_FOUND),
            rejected = quote_ident(fields::REJECTED_IMPORT_FOUND),
            ok = quote_ident(fields::REVIEWED_OK),
            table = table.quoted(),
        );
        let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
        let total: i64 = row.try_get("total")?;
        let missing_count: i64 = row.try_get("missing")?;
        let missing_percentage = if total > 0 {
            ((missing_count as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Ok(TableStatistics {
            total,
            missing_count,
            missing_percentage,
            rejected_count: row.try_get("rejected")?,
            reviewed_count: row.try_get("reviewed")?,
        })
    }
}

async fn require_schema(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
) -> Result<TableSchema, StoreError> {
    load_schema(conn, table.name())
        .await?
        .ok_or_else(|| StoreError::MissingTable(table.name().to_string()))
}

/// Every column is read back as text; boolean columns are decoded from it.
pub(crate) fn select_list<'a>(
    schema: &TableSchema,
    columns: impl Iterator<Item = &'a String>,
) -> String {
    columns
        .filter(|c| schema.contains(c))
        .map(|c| format!("CAST({q} AS TEXT) AS {q}", q = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn decode_row(
    schema: &TableSchema,
    row: &sqlx::sqlite::SqliteRow,
) -> Result<StoredRow, StoreError> {
    use sqlx::Column;

    let mut out = StoredRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let text: Option<String> = row.try_get(idx)?;
        let cell = Cell::text(text);
        let cell = match schema.kind_of(column.name()) {
            ColumnKind::Boolean => cell.as_flag().map(Cell::Flag).unwrap_or(Cell::Null),
            ColumnKind::Text => cell,
        };
        out.insert(column.name().to_string(), cell);
    }
    Ok(out)
}

pub(crate) async fn fetch_cells<'a>(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
    schema: &TableSchema,
    columns: impl Iterator<Item = &'a String>,
    secondary_id: &str,
) -> Result<Option<StoredRow>, StoreError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_list(schema, columns),
        table.quoted(),
        quote_ident(fields::SECONDARY_ID)
    );
    let row = sqlx::query(&sql)
        .bind(secondary_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| decode_row(schema, &row)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;
    use crate::upsert::upsert;
    use regrec_core::{CanonicalEntry, Period};

    async fn seeded() -> (LocalStore, PeriodTable) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let table = PeriodTable::new("BMI", Period::parse("202501").unwrap()).unwrap();
        let mut entries = vec![CanonicalEntry::new("A1"), CanonicalEntry::new("B2")];
        entries[0].file_label = "b.zip".into();
        entries[0].import_found = true;
        entries[1].file_label = "a.zip".into();

        let mut tx = store.begin().await.unwrap();
        let change = ensure_schema(&mut tx, &table, &entries, &[]).await.unwrap();
        upsert(&mut tx, &table, &change, &mut entries, "2025-01-01 00:00:00")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (store, table)
    }

    #[tokio::test]
    async fn settings_are_seeded_once_and_updatable() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .ensure_settings(&[("import_cut_date", "20250101")])
            .await
            .unwrap();
        let mut change = BTreeMap::new();
        change.insert("import_cut_date".to_string(), "20240601".to_string());
        change.insert("unknown".to_string(), "x".to_string());
        assert_eq!(store.update_settings(&change).await.unwrap(), 1);

        store
            .ensure_settings(&[("import_cut_date", "20250101")])
            .await
            .unwrap();
        let settings = store.settings().await.unwrap();
        assert_eq!(settings["import_cut_date"], "20240601");
        assert!(!settings.contains_key("unknown"));
    }

    #[tokio::test]
    async fn rows_come_back_ordered_and_typed() {
        let (store, table) = seeded().await;
        let rows = store.fetch_rows(&table).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["secondary_id"], Cell::Text("B2".into()));
        assert_eq!(rows[1]["import_found"], Cell::Flag(true));
        assert_eq!(rows[0]["reviewed_ok"], Cell::Flag(false));
    }

    #[tokio::test]
    async fn reviewer_update_and_statistics() {
        let (store, table) = seeded().await;
        assert!(store
            .update_reviewer_fields(&table, "B2", "checked", true)
            .await
            .unwrap());
        assert!(!store
            .update_reviewer_fields(&table, "nope", "x", true)
            .await
            .unwrap());

        let row = store.fetch_row(&table, "B2").await.unwrap().unwrap();
        assert_eq!(row["reviewer_comment"], Cell::Text("checked".into()));
        assert_eq!(row["last_updated"], Cell::Text("2025-01-01 00:00:00".into()));

        let stats = store.statistics(&table).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.missing_count, 1);
        assert_eq!(stats.missing_percentage, 50.0);
        assert_eq!(stats.reviewed_count, 1);
    }

    #[tokio::test]
    async fn period_tables_are_listed_newest_first() {
        let (store, _table) = seeded().await;
        let mut tx = store.begin().await.unwrap();
        let older = PeriodTable::new("BMI", Period::parse("202412").unwrap()).unwrap();
        ensure_schema(&mut tx, &older, &[], &[]).await.unwrap();
        tx.commit().await.unwrap();
        store.ensure_settings(&[]).await.unwrap();

        let periods = store
            .list_period_tables("BMI")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.period().to_string())
            .collect::<Vec<_>>();
        assert_eq!(periods, vec!["202501", "202412"]);
    }

    #[tokio::test]
    async fn missing_table_is_reported() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let table = PeriodTable::new("BMI", Period::parse("209901").unwrap()).unwrap();
        assert!(matches!(
            store.fetch_rows(&table).await,
            Err(StoreError::MissingTable(_))
        ));
    }
}
