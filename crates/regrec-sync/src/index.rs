//! In-memory lookup of warehouse rows by their filename column.

use std::collections::HashMap;

use regrec_core::{normalize, ExternalRow};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub rows_seen: usize,
    pub indexed: usize,
    pub missing_key: usize,
    pub overwritten: usize,
}

/// Filename -> row. A repeated filename keeps the last row seen.
#[derive(Debug, Clone, Default)]
pub struct ExternalIndex {
    key_column: String,
    rows: HashMap<String, ExternalRow>,
    stats: IndexStats,
}

impl ExternalIndex {
    /// Rows with a missing, null or blank key are skipped and counted.
    pub fn build(rows: Vec<ExternalRow>, key_column: &str) -> Self {
        let mut stats = IndexStats::default();
        let mut index = HashMap::with_capacity(rows.len());

        for row in rows {
            stats.rows_seen += 1;
            let key = row
                .get(key_column)
                .and_then(normalize)
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty());
            let Some(key) = key else {
                stats.missing_key += 1;
                continue;
            };
            if index.insert(key, row).is_some() {
                stats.overwritten += 1;
            }
        }
        stats.indexed = index.len();

        if stats.missing_key > 0 {
            warn!(key_column, missing = stats.missing_key, "warehouse rows without join key skipped");
        }
        debug!(key_column, ?stats, "built external index");
        Self {
            key_column: key_column.to_string(),
            rows: index,
            stats,
        }
    }

    pub fn get(&self, file_label: &str) -> Option<&ExternalRow> {
        if file_label.is_empty() {
            return None;
        }
        self.rows.get(file_label)
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regrec_core::ScalarValue;

    fn row(pairs: &[(&str, ScalarValue)]) -> ExternalRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn last_row_wins_for_repeated_filename() {
        let index = ExternalIndex::build(
            vec![
                row(&[("datei_id", "x.zip".into()), ("melder_id", "1".into())]),
                row(&[("datei_id", "x.zip".into()), ("melder_id", "2".into())]),
            ],
            "datei_id",
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("x.zip").unwrap()["melder_id"], ScalarValue::text("2"));
        assert_eq!(index.stats().overwritten, 1);
    }

    #[test]
    fn rows_without_key_are_counted_not_fatal() {
        let index = ExternalIndex::build(
            vec![
                row(&[("melder_id", "1".into())]),
                row(&[("datei_id", ScalarValue::Null)]),
                row(&[("datei_id", "  ".into())]),
                row(&[("datei_id", "y.zip ".into())]),
            ],
            "datei_id",
        );
        assert_eq!(
            index.stats(),
            IndexStats {
                rows_seen: 4,
                indexed: 1,
                missing_key: 3,
                overwritten: 0
            }
        );
        assert!(index.get("y.zip").is_some());
        assert!(index.get("").is_none());
    }

    #[test]
    fn numeric_keys_are_normalized() {
        let index = ExternalIndex::build(vec![row(&[("datei_id", 42i64.into())])], "datei_id");
        assert!(index.get("42").is_some());
    }
}
