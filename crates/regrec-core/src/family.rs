//! Report families: which portal subject area to query, how the period tables
//! are named, and which warehouse columns carry the join key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFamily {
    pub name: String,
    pub table_prefix: String,
    /// Portal `auswahl(isachgebiet)` value.
    pub subject_area: String,
    #[serde(default = "default_accepted_key")]
    pub accepted_key_column: String,
    #[serde(default = "default_rejected_key")]
    pub rejected_key_column: String,
    #[serde(default)]
    pub extra_required_columns: Vec<String>,
}

fn default_accepted_key() -> String {
    "datei_id".to_string()
}

fn default_rejected_key() -> String {
    "import_datei_id".to_string()
}

impl ReportFamily {
    /// Columns every table of this family carries beyond the canonical set.
    pub fn required_columns(&self) -> Vec<String> {
        let mut cols = vec![
            self.accepted_key_column.clone(),
            self.rejected_key_column.clone(),
        ];
        for col in &self.extra_required_columns {
            if !cols.contains(col) {
                cols.push(col.clone());
            }
        }
        cols
    }
}
