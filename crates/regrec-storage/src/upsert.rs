//! Per-entry insert-or-update keyed by `secondary_id`.
//!
//! Reviewer fields of an existing row are never replaced from upstream, and
//! `last_updated` only moves when some other column actually changed.

use std::collections::BTreeSet;

use regrec_core::{fields, quote_ident, CanonicalEntry, Cell, ColumnKind, PeriodTable};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteArguments;
use sqlx::{query::Query, Sqlite, SqliteConnection};
use tracing::debug;

use crate::schema::{SchemaChange, TableSchema};
use crate::store::{fetch_cells, StoredRow};
use crate::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn absorb(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// What the change detector decided for one existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDiff {
    pub changed: Vec<String>,
}

/// Columns that never take part in the diff.
fn is_diff_exempt(column: &str) -> bool {
    column == fields::SECONDARY_ID
        || column == fields::LAST_UPDATED
        || fields::REVIEWER.contains(&column)
}

/// Compare the incoming image against the stored row, column by column.
pub fn diff_row(
    schema: &TableSchema,
    columns: &BTreeSet<String>,
    incoming: &StoredRow,
    stored: &StoredRow,
) -> RowDiff {
    let null = Cell::Null;
    let changed = columns
        .iter()
        .filter(|col| !is_diff_exempt(col))
        .filter(|col| {
            let kind = schema.kind_of(col);
            let new = incoming.get(*col).unwrap_or(&null).comparable(kind);
            let old = stored.get(*col).unwrap_or(&null).comparable(kind);
            new != old
        })
        .cloned()
        .collect();
    RowDiff { changed }
}

/// Write every entry into `table`. Entries are updated in place with the
/// reviewer fields and `last_updated` that ended up persisted.
pub async fn upsert(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
    change: &SchemaChange,
    entries: &mut [CanonicalEntry],
    now: &str,
) -> Result<UpsertCounts, StoreError> {
    let schema = &change.schema;
    let columns = &change.pass_columns;
    let mut counts = UpsertCounts::default();

    for entry in entries.iter_mut() {
        let stored = fetch_cells(conn, table, schema, columns.iter(), &entry.secondary_id).await?;

        let Some(stored) = stored else {
            entry.last_updated = Some(now.to_string());
            insert_row(conn, table, schema, columns, &change.align(entry.cells())).await?;
            debug!(table = table.name(), secondary_id = entry.secondary_id.as_str(), "inserted");
            counts.inserted += 1;
            continue;
        };

        let comment = stored
            .get(fields::REVIEWER_COMMENT)
            .cloned()
            .unwrap_or_default();
        let reviewed = stored.get(fields::REVIEWED_OK).cloned().unwrap_or_default();
        entry.reviewer_comment = comment.as_text().unwrap_or_default().to_string();
        entry.reviewed_ok = reviewed.as_flag().unwrap_or(false);

        let incoming = change.align(entry.cells());
        let diff = diff_row(schema, columns, &incoming, &stored);
        if diff.changed.is_empty() {
            entry.last_updated = stored
                .get(fields::LAST_UPDATED)
                .and_then(|c| c.as_text())
                .map(str::to_string);
            counts.unchanged += 1;
            continue;
        }

        let mut assignments: Vec<(&str, Cell)> = diff
            .changed
            .iter()
            .map(|col| (col.as_str(), incoming.get(col).cloned().unwrap_or_default()))
            .collect();
        assignments.push((fields::LAST_UPDATED, Cell::Text(now.to_string())));
        // stored reviewer values written back unchanged
        assignments.push((fields::REVIEWER_COMMENT, comment));
        assignments.push((fields::REVIEWED_OK, reviewed));

        update_row(conn, table, schema, &entry.secondary_id, &assignments).await?;
        entry.last_updated = Some(now.to_string());
        debug!(
            table = table.name(),
            secondary_id = entry.secondary_id.as_str(),
            changed = ?diff.changed,
            "updated"
        );
        counts.updated += 1;
    }

    Ok(counts)
}

async fn insert_row(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
    schema: &TableSchema,
    columns: &BTreeSet<String>,
    cells: &StoredRow,
) -> Result<(), StoreError> {
    let names = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        names.join(", "),
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for col in columns {
        let cell = cells.get(col).cloned().unwrap_or_default();
        query = bind_cell(query, schema.kind_of(col), &cell);
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

async fn update_row(
    conn: &mut SqliteConnection,
    table: &PeriodTable,
    schema: &TableSchema,
    secondary_id: &str,
    assignments: &[(&str, Cell)],
) -> Result<(), StoreError> {
    let sets = assignments
        .iter()
        .enumerate()
        .map(|(i, (col, _))| format!("{} = ?{}", quote_ident(col), i + 1))
        .collect::<Vec<_>>();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        table.quoted(),
        sets.join(", "),
        quote_ident(fields::SECONDARY_ID),
        assignments.len() + 1
    );
    let mut query = sqlx::query(&sql);
    for (col, cell) in assignments {
        query = bind_cell(query, schema.kind_of(col), cell);
    }
    query.bind(secondary_id).execute(&mut *conn).await?;
    Ok(())
}

/// Bind in the column's own representation so the read-back compares equal.
fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    kind: ColumnKind,
    cell: &Cell,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match kind {
        ColumnKind::Boolean => query.bind(cell.as_flag()),
        ColumnKind::Text => query.bind(cell.comparable(ColumnKind::Text)),
    }
}
