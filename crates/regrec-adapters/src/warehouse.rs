//! Warehouse sources for the accepted and rejected import records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regrec_core::{ExternalRow, RecordKind, ReportFamily, ScalarValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::info;

use crate::AdapterError;

/// Placeholder substituted into warehouse query text.
pub const IMPORT_CUT_DATE_PLACEHOLDER: &str = "{IMPORT_CUT_DATE}";

#[async_trait]
pub trait WarehouseSource: Send + Sync {
    async fn load_rows(
        &self,
        family: &ReportFamily,
        kind: RecordKind,
    ) -> Result<Vec<ExternalRow>, AdapterError>;
}

/// JSON exports laid out as `<dir>/<family>/<accepted|rejected>.json`.
pub struct FixtureWarehouse {
    dir: PathBuf,
}

impl FixtureWarehouse {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, family: &ReportFamily, kind: RecordKind) -> PathBuf {
        self.dir
            .join(&family.name)
            .join(format!("{}.json", kind.as_str()))
    }
}

#[async_trait]
impl WarehouseSource for FixtureWarehouse {
    async fn load_rows(
        &self,
        family: &ReportFamily,
        kind: RecordKind,
    ) -> Result<Vec<ExternalRow>, AdapterError> {
        let path = self.path_for(family, kind);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AdapterError::Io {
                path: path.clone(),
                source,
            })?;
        let rows: Vec<ExternalRow> = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Message(format!("parsing {}: {e}", path.display())))?;
        info!(family = family.name.as_str(), kind = kind.as_str(), rows = rows.len(), "loaded warehouse fixture");
        Ok(rows)
    }
}

/// Live warehouse. Query text lives in `<sql_dir>/<family>/<kind>.sql`.
pub struct PgWarehouse {
    pool: PgPool,
    sql_dir: PathBuf,
    import_cut_date: String,
}

impl PgWarehouse {
    /// Parses the URL only; the first query opens the connection.
    pub fn connect_lazy(
        database_url: &str,
        sql_dir: impl Into<PathBuf>,
        import_cut_date: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy(database_url)?;
        Ok(Self {
            pool,
            sql_dir: sql_dir.into(),
            import_cut_date: import_cut_date.into(),
        })
    }

    pub fn query_path(&self, family: &ReportFamily, kind: RecordKind) -> PathBuf {
        self.sql_dir
            .join(&family.name)
            .join(format!("{}.sql", kind.as_str()))
    }
}

pub async fn load_query_text(path: &Path, import_cut_date: &str) -> Result<String, AdapterError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(text.replace(IMPORT_CUT_DATE_PLACEHOLDER, import_cut_date))
}

#[async_trait]
impl WarehouseSource for PgWarehouse {
    async fn load_rows(
        &self,
        family: &ReportFamily,
        kind: RecordKind,
    ) -> Result<Vec<ExternalRow>, AdapterError> {
        let sql = load_query_text(&self.query_path(family, kind), &self.import_cut_date).await?;
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let out = rows.iter().map(pg_row_to_external).collect::<Result<Vec<_>, _>>()?;
        info!(family = family.name.as_str(), kind = kind.as_str(), rows = out.len(), "loaded warehouse rows");
        Ok(out)
    }
}

/// Decode each column by its database type. NUMERIC and other exotic types
/// must be cast in the query text.
fn pg_row_to_external(row: &PgRow) -> Result<ExternalRow, AdapterError> {
    let mut out = ExternalRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name().to_ascii_uppercase();
        let value: ScalarValue = match type_name.as_str() {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
            "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
            "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from).into(),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
            "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.into()
            }
            "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.into(),
            "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(idx)?.into(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(|ts| ts.naive_utc())
                .into(),
            other => {
                return Err(AdapterError::Message(format!(
                    "column `{}` has unsupported type {other}; cast it in the query",
                    column.name()
                )))
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn family() -> ReportFamily {
        ReportFamily {
            name: "wpi".into(),
            table_prefix: "BMI".into(),
            subject_area: "14".into(),
            accepted_key_column: "datei_id".into(),
            rejected_key_column: "import_datei_id".into(),
            extra_required_columns: vec![],
        }
    }

    #[tokio::test]
    async fn fixture_rows_keep_scalar_types() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wpi")).unwrap();
        std::fs::write(
            dir.path().join("wpi/accepted.json"),
            r#"[{"datei_id": "x.zip", "melder_id": 77, "blz": null}]"#,
        )
        .unwrap();

        let warehouse = FixtureWarehouse::new(dir.path());
        let rows = warehouse
            .load_rows(&family(), RecordKind::Accepted)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["datei_id"], ScalarValue::text("x.zip"));
        assert_eq!(rows[0]["melder_id"], ScalarValue::Integer(77));
        assert!(rows[0]["blz"].is_null());
    }

    #[tokio::test]
    async fn missing_fixture_is_an_error() {
        let dir = tempdir().unwrap();
        let warehouse = FixtureWarehouse::new(dir.path());
        let err = warehouse
            .load_rows(&family(), RecordKind::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }

    #[tokio::test]
    async fn query_text_gets_cut_date() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accepted.sql");
        std::fs::write(&path, "SELECT * FROM imports WHERE d > '{IMPORT_CUT_DATE}'").unwrap();
        let sql = load_query_text(&path, "20250101").await.unwrap();
        assert_eq!(sql, "SELECT * FROM imports WHERE d > '20250101'");
    }
}
