//! Raw artifact archive, portal transport and the local period-table store.

pub mod artifacts;
pub mod http;
pub mod schema;
pub mod store;
pub mod upsert;

use thiserror::Error;

pub use artifacts::{ArchivedListing, ListingArchive};
pub use http::{BasicAuth, FetchError, FetchedResponse, HttpClientConfig, PortalClient};
pub use schema::{column_union, ensure_schema, load_schema, SchemaChange, TableSchema};
pub use store::{LocalStore, StoredRow, TableStatistics};
pub use upsert::{diff_row, upsert, UpsertCounts};

pub const CRATE_NAME: &str = "regrec-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
