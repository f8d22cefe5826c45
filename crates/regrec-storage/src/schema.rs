//! Period-table schema evolution. This is the only place where attribute
//! names become persisted columns.

use std::collections::{BTreeMap, BTreeSet};

use regrec_core::{column_kind, fields, quote_ident, CanonicalEntry, Cell, ColumnKind, PeriodTable};
use serde::Serialize;
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::StoreError;

/// Columns present on every period table, regardless of the entries seen.
pub const BASE_REQUIRED_COLUMNS: [&str; 7] = [
    fields::SECONDARY_ID,
    fields::PRIMARY_ID,
    fields::IMPORT_FOUND,
    fields::REJECTED_IMPORT_FOUND,
    fields::REVIEWER_COMMENT,
    fields::REVIEWED_OK,
    fields::LAST_UPDATED,
];

/// Declared columns of an existing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub columns: BTreeMap<String, ColumnKind>,
}

impl TableSchema {
    pub fn kind_of(&self, column: &str) -> ColumnKind {
        self.columns
            .get(column)
            .copied()
            .unwrap_or_else(|| column_kind(column))
    }

    /// Existing spelling of `column`. SQLite folds ASCII case in identifiers.
    pub fn resolve(&self, column: &str) -> Option<&str> {
        if let Some((name, _)) = self.columns.get_key_value(column) {
            return Some(name);
        }
        self.columns
            .keys()
            .find(|name| name.eq_ignore_ascii_case(column))
            .map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.resolve(column).is_some()
    }
}

/// Result of aligning a table with one pass's entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaChange {
    pub created: bool,
    pub added: BTreeSet<String>,
    /// Column union for this pass; the upsert writes exactly these.
    pub pass_columns: BTreeSet<String>,
    pub schema: TableSchema,
}

impl SchemaChange {
    /// Rekey a row image to the table's column spellings. A cell whose name
    /// already matches exactly wins over one that only matches by case.
    pub fn align(&self, cells: BTreeMap<String, Cell>) -> BTreeMap<String, Cell> {
        let mut exact = BTreeMap::new();
        let mut folded = Vec::new();
        for (name, cell) in cells {
            match self.schema.resolve(&name) {
                Some(column) if column == name => {
                    exact.insert(name, cell);
                }
                Some(column) => folded.push((column.to_string(), cell)),
                None => {
                    exact.insert(name, cell);
                }
            }
        }
        for (column, cell) in folded {
            exact.entry(column).or_insert(cell);
        }
        exact
    }
}

/// Column names for one pass, deduplicated without regard to ASCII case.
/// The first spelling seen is kept, base columns first.
pub fn column_union(entries: &[CanonicalEntry], extra_required: &[String]) -> BTreeSet<String> {
    let mut folded: BTreeMap<String, String> = BTreeMap::new();
    let names = BASE_REQUIRED_COLUMNS
        .iter()
        .copied()
        .chain(extra_required.iter().map(String::as_str))
        .chain(entries.iter().flat_map(|e| e.column_names()));
    for name in names {
        folded
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| name.to_string());
    }
    folded.into_values().collect()
}

pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

pub async fn load_schema(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<TableSchema>, StoreError> {
    if !table_exists(conn, name).await? {
        return Ok(None);
    }
    let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1)")
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
    let mut columns = BTreeMap::new();
    for row in rows {
        let column: String = row.try_get("name")?;
        let declared: String = row.try_get("type")?;
        columns.insert(column, ColumnKind::from_declared_type(&declared));
    }
    Ok(Some(TableSchema { columns }))
}

/// Create the table or add whatever columns it lacks. Idempotent.
pub async fn ensure_schema(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
    entries: &[CanonicalEntry],
    extra_required: &[String],
) -> Result<SchemaChange, StoreError> {
    let pass_columns = column_union(entries, extra_required);

    let Some(existing) = load_schema(conn, table.name()).await? else {
        let defs = pass_columns
            .iter()
            .map(|col| {
                if col == fields::SECONDARY_ID {
                    format!("{} TEXT PRIMARY KEY", quote_ident(col))
                } else {
                    format!("{} {}", quote_ident(col), column_kind(col).sql_type())
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TABLE {} ({defs})", table.quoted()))
            .execute(&mut *conn)
            .await?;
        info!(table = table.name(), columns = pass_columns.len(), "created period table");

        let schema = TableSchema {
            columns: pass_columns
                .iter()
                .map(|c| (c.clone(), column_kind(c)))
                .collect(),
        };
        return Ok(SchemaChange {
            created: true,
            added: pass_columns.clone(),
            pass_columns,
            schema,
        });
    };

    let mut schema = existing;
    let mut added = BTreeSet::new();
    let mut resolved = BTreeSet::new();
    for col in &pass_columns {
        if let Some(existing) = schema.resolve(col) {
            resolved.insert(existing.to_string());
            continue;
        }
        let kind = column_kind(col);
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table.quoted(),
            quote_ident(col),
            kind.sql_type()
        ))
        .execute(&mut *conn)
        .await?;
        info!(table = table.name(), column = col.as_str(), "added column");
        schema.columns.insert(col.clone(), kind);
        added.insert(col.clone());
        resolved.insert(col.clone());
    }

    Ok(SchemaChange {
        created: false,
        added,
        pass_columns: resolved,
        schema,
    })
}
