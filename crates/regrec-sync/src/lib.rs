//! Pass orchestration: fetch the listing, reconcile it against the warehouse
//! and persist the result into the family's period tables.

pub mod config;
pub mod index;
pub mod reconcile;
pub mod report;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use regrec_adapters::{
    parse_listing_html, FileListingSource, FixtureWarehouse, HttpListingSource, ListingSource,
    PgWarehouse, WarehouseSource,
};
use regrec_core::{
    entries_from_raw, CanonicalEntry, EntryBatchStats, Period, PeriodTable, RecordKind,
    ReportFamily,
};
use regrec_storage::{
    ensure_schema, upsert, ListingArchive, LocalStore, PortalClient, StoreError, UpsertCounts,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{
    defaults, load_credentials, ConfigError, EngineConfig, FamilyRegistry, WarehouseConfig,
};
pub use index::{ExternalIndex, IndexStats};
pub use reconcile::{reconcile, MatchCounts, Reconciliation};

pub const CRATE_NAME: &str = "regrec-sync";

/// Why a pass stopped. Every variant leaves the local store untouched.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("listing source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("listing for {family} {period} contained no entries")]
    NoEntries { family: String, period: String },
    #[error("warehouse unavailable: {0}")]
    WarehouseUnavailable(String),
    #[error("storage failure, pass rolled back: {0}")]
    Storage(#[from] StoreError),
}

impl PassError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::NoEntries { .. } => "no_entries",
            Self::WarehouseUnavailable(_) => "warehouse_unavailable",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub created: bool,
    pub columns_added: Vec<String>,
    pub counts: UpsertCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub family: String,
    pub period: Period,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listing_source: String,
    pub artifact_path: Option<String>,
    pub entry_stats: EntryBatchStats,
    /// Entries whose own period was blank or malformed and were filed under
    /// the requested period.
    pub period_fallbacks: usize,
    pub accepted_index: IndexStats,
    pub rejected_index: IndexStats,
    pub matches: MatchCounts,
    pub tables: Vec<TableOutcome>,
    pub totals: UpsertCounts,
    pub reports_dir: Option<String>,
    /// Reconciled entries as persisted.
    #[serde(skip)]
    pub entries: Vec<CanonicalEntry>,
}

pub struct SyncPipeline {
    config: EngineConfig,
    store: LocalStore,
    archive: ListingArchive,
    listing: Box<dyn ListingSource>,
    warehouse: Box<dyn WarehouseSource>,
}

impl SyncPipeline {
    pub fn new(
        config: EngineConfig,
        store: LocalStore,
        listing: Box<dyn ListingSource>,
        warehouse: Box<dyn WarehouseSource>,
    ) -> Self {
        let archive = ListingArchive::new(config.artifacts_dir.clone());
        Self {
            config,
            store,
            archive,
            listing,
            warehouse,
        }
    }

    /// Wire the configured sources. A saved listing page replaces the portal;
    /// otherwise credentials are loaded here. Nothing touches the network
    /// until a pass runs.
    pub async fn from_config(
        config: EngineConfig,
        store: LocalStore,
        html_file: Option<PathBuf>,
    ) -> Result<Self, PassError> {
        let listing: Box<dyn ListingSource> = match html_file {
            Some(path) => Box::new(FileListingSource::new(path)),
            None => {
                let auth = load_credentials(&config.auth_file)?;
                let client = PortalClient::new(config.http_config())
                    .map_err(|e| PassError::SourceUnavailable(format!("{e:#}")))?;
                Box::new(HttpListingSource::new(client, config.portal_url.clone(), auth))
            }
        };

        let warehouse: Box<dyn WarehouseSource> = match &config.warehouse {
            WarehouseConfig::Fixtures(dir) => Box::new(FixtureWarehouse::new(dir.clone())),
            WarehouseConfig::Postgres { url, sql_dir } => Box::new(
                PgWarehouse::connect_lazy(url, sql_dir.clone(), config.import_cut_date.clone())
                    .map_err(|e| ConfigError::InvalidSetting {
                        key: "REGREC_WAREHOUSE_URL".into(),
                        value: "<redacted>".into(),
                        reason: e.to_string(),
                    })?,
            ),
        };

        Ok(Self::new(config, store, listing, warehouse))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub async fn run_pass(&self, family: &str, period: &Period) -> Result<PassSummary, PassError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pass", %run_id, family, %period);
        self.execute(run_id, family, period).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        family_name: &str,
        period: &Period,
    ) -> Result<PassSummary, PassError> {
        let started_at = Utc::now();
        let family = self.config.families.require(family_name)?;
        PeriodTable::new(&family.table_prefix, period.clone()).map_err(|e| {
            ConfigError::InvalidFamily {
                name: family.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let html = self
            .listing
            .fetch_listing(family, period)
            .await
            .map_err(|e| PassError::SourceUnavailable(e.to_string()))?;
        if html.trim().is_empty() {
            return Err(PassError::SourceUnavailable(format!(
                "{} returned an empty page",
                self.listing.describe()
            )));
        }
        let artifact_path = self.archive_listing(started_at, family, period, &html).await;

        let raw = parse_listing_html(&html).map_err(|e| PassError::SourceUnavailable(e.to_string()))?;
        let (entries, entry_stats) = entries_from_raw(&raw);
        if entries.is_empty() {
            return Err(PassError::NoEntries {
                family: family.name.clone(),
                period: period.to_string(),
            });
        }
        info!(entries = entries.len(), missing_key = entry_stats.missing_key, duplicates = entry_stats.duplicates, "parsed listing");

        let accepted = self.load_index(family, RecordKind::Accepted).await?;
        let rejected = self.load_index(family, RecordKind::Rejected).await?;

        let Reconciliation { entries, counts } = reconcile(entries, &accepted, &rejected);
        info!(
            accepted = counts.accepted,
            rejected = counts.rejected,
            dual = counts.dual,
            reserved_skipped = counts.reserved_skipped,
            "reconciled"
        );

        let (groups, period_fallbacks) = group_by_period(entries, period);
        let now = started_at.format(defaults::TIMESTAMP_FORMAT).to_string();
        let (tables, entries) = self.persist(family, groups, &now).await?;

        let mut totals = UpsertCounts::default();
        for outcome in &tables {
            totals.absorb(outcome.counts);
        }
        let mut summary = PassSummary {
            run_id,
            family: family.name.clone(),
            period: period.clone(),
            started_at,
            finished_at: Utc::now(),
            listing_source: self.listing.describe(),
            artifact_path,
            entry_stats,
            period_fallbacks,
            accepted_index: accepted.stats(),
            rejected_index: rejected.stats(),
            matches: counts,
            tables,
            totals,
            reports_dir: None,
            entries,
        };

        let dir = report::run_dir(&self.config.reports_dir, &summary);
        match report::write_pass_reports(&dir, &summary).await {
            Ok(()) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(error = %format!("{err:#}"), "pass committed but report not written"),
        }

        info!(
            inserted = totals.inserted,
            updated = totals.updated,
            unchanged = totals.unchanged,
            "pass committed"
        );
        Ok(summary)
    }

    async fn archive_listing(
        &self,
        fetched_at: DateTime<Utc>,
        family: &ReportFamily,
        period: &Period,
        html: &str,
    ) -> Option<String> {
        match self
            .archive
            .archive(fetched_at, &family.name, period.as_str(), html)
            .await
        {
            Ok(archived) => Some(archived.path.display().to_string()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "listing page not archived");
                None
            }
        }
    }

    async fn load_index(
        &self,
        family: &ReportFamily,
        kind: RecordKind,
    ) -> Result<ExternalIndex, PassError> {
        let rows = self
            .warehouse
            .load_rows(family, kind)
            .await
            .map_err(|e| PassError::WarehouseUnavailable(format!("{} rows: {e}", kind.as_str())))?;
        let key = match kind {
            RecordKind::Accepted => &family.accepted_key_column,
            RecordKind::Rejected => &family.rejected_key_column,
        };
        Ok(ExternalIndex::build(rows, key))
    }

    /// Schema changes and upserts for every touched table share one
    /// transaction; an error drops it and nothing is kept.
    async fn persist(
        &self,
        family: &ReportFamily,
        groups: BTreeMap<Period, Vec<CanonicalEntry>>,
        now: &str,
    ) -> Result<(Vec<TableOutcome>, Vec<CanonicalEntry>), PassError> {
        let required = family.required_columns();
        let mut tx = self.store.begin().await?;
        let mut outcomes = Vec::with_capacity(groups.len());
        let mut persisted = Vec::new();

        for (period, mut entries) in groups {
            let table = PeriodTable::new(&family.table_prefix, period).map_err(|e| {
                ConfigError::InvalidFamily {
                    name: family.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            let result = async {
                let change = ensure_schema(&mut tx, &table, &entries, &required).await?;
                let counts = upsert(&mut tx, &table, &change, &mut entries, now).await?;
                Ok::<_, StoreError>((change, counts))
            }
            .await;
            let (change, counts) = match result {
                Ok(done) => done,
                Err(err) => {
                    warn!(table = table.name(), error = %err, "storage failure; rolling back pass");
                    return Err(err.into());
                }
            };
            info!(
                table = table.name(),
                created = change.created,
                columns_added = change.added.len(),
                inserted = counts.inserted,
                updated = counts.updated,
                unchanged = counts.unchanged,
                "table synced"
            );
            outcomes.push(TableOutcome {
                table: table.name().to_string(),
                created: change.created,
                columns_added: change.added.into_iter().collect(),
                counts,
            });
            persisted.extend(entries);
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok((outcomes, persisted))
    }
}

/// Open the local store, seed the settings table and apply persisted
/// overrides to `config`.
pub async fn open_configured_store(
    config: EngineConfig,
) -> Result<(EngineConfig, LocalStore), PassError> {
    let store = LocalStore::open(&config.db_path).await?;
    prepare_store(config, store).await
}

/// Same as [`open_configured_store`] for an already opened store.
pub async fn prepare_store(
    config: EngineConfig,
    store: LocalStore,
) -> Result<(EngineConfig, LocalStore), PassError> {
    let seeds = config.settings_defaults();
    let seeds = seeds
        .iter()
        .map(|(k, v)| (*k, v.as_str()))
        .collect::<Vec<_>>();
    store.ensure_settings(&seeds).await?;
    let settings = store.settings().await?;
    let config = config.with_settings(&settings)?;
    Ok((config, store))
}

/// Each entry lands in the table of its own period; blank or malformed
/// periods fall back to the requested one.
pub fn group_by_period(
    entries: Vec<CanonicalEntry>,
    requested: &Period,
) -> (BTreeMap<Period, Vec<CanonicalEntry>>, usize) {
    let mut groups: BTreeMap<Period, Vec<CanonicalEntry>> = BTreeMap::new();
    let mut fallbacks = 0;
    for entry in entries {
        let period = match Period::parse(&entry.period) {
            Ok(p) => p,
            Err(_) => {
                fallbacks += 1;
                requested.clone()
            }
        };
        groups.entry(period).or_default().push(entry);
    }
    (groups, fallbacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, period: &str) -> CanonicalEntry {
        let mut e = CanonicalEntry::new(id);
        e.period = period.to_string();
        e
    }

    #[test]
    fn entries_are_grouped_by_their_own_period() {
        let requested = Period::parse("202501").unwrap();
        let (groups, fallbacks) = group_by_period(
            vec![
                entry("A", "202501"),
                entry("B", "202412"),
                entry("C", ""),
                entry("D", "2025-01"),
            ],
            &requested,
        );
        assert_eq!(fallbacks, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&requested].len(), 3);
        assert_eq!(groups[&Period::parse("202412").unwrap()][0].secondary_id, "B");
    }

    #[test]
    fn error_kinds_are_distinct() {
        let kinds = [
            PassError::SourceUnavailable("down".into()).kind(),
            PassError::NoEntries {
                family: "wpi".into(),
                period: "202501".into(),
            }
            .kind(),
            PassError::WarehouseUnavailable("down".into()).kind(),
            PassError::Config(ConfigError::UnknownFamily("x".into())).kind(),
        ];
        let unique: std::collections::BTreeSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
