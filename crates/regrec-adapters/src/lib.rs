//! Collaborator adapters: the portal listing (transport + HTML parsing) and
//! the warehouse record sources.

pub mod listing;
pub mod warehouse;

use std::path::PathBuf;

use regrec_storage::FetchError;
use thiserror::Error;

pub use listing::{
    decode_listing, listing_form, normalize_file_label, parse_listing_html, FileListingSource,
    HttpListingSource, ListingSource,
};
pub use warehouse::{FixtureWarehouse, PgWarehouse, WarehouseSource};

pub const CRATE_NAME: &str = "regrec-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("warehouse query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}
