//! Core domain model for regrec: canonical entries, scalar normalization and
//! period-table naming.

pub mod entry;
pub mod family;
pub mod table;
pub mod value;

pub use entry::{
    column_kind, entries_from_raw, fields, AttributeWrite, CanonicalEntry, EntryBatchStats,
    EntryError, RawEntry,
};
pub use family::ReportFamily;
pub use table::{quote_ident, Period, PeriodTable, TableNameError};
pub use value::{normalize, Cell, ColumnKind, ScalarValue};

pub const CRATE_NAME: &str = "regrec-core";

/// Flat row returned by a warehouse query.
pub type ExternalRow = std::collections::BTreeMap<String, ScalarValue>;

/// Which warehouse result a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Accepted,
    Rejected,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}
