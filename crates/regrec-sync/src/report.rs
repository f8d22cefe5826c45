//! Per-pass report files under `<reports>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::PassSummary;

pub const SUMMARY_FILE: &str = "pass_summary.json";
pub const BRIEF_FILE: &str = "brief.md";

pub fn run_dir(reports_root: &Path, summary: &PassSummary) -> PathBuf {
    reports_root.join(summary.run_id.to_string())
}

pub async fn write_pass_reports(dir: &Path, summary: &PassSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing pass summary")?;
    fs::write(dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(())
}

pub fn render_brief(summary: &PassSummary) -> String {
    let tables = summary
        .tables
        .iter()
        .map(|t| {
            let added = if t.columns_added.is_empty() {
                String::new()
            } else {
                format!(" (new columns: {})", t.columns_added.join(", "))
            };
            format!(
                "- `{}`: {} inserted, {} updated, {} unchanged{}",
                t.table, t.counts.inserted, t.counts.updated, t.counts.unchanged, added
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Pass {family} {period}\n\n\
         - Run ID: `{run_id}`\n\
         - Started: {started}\n\
         - Finished: {finished}\n\
         - Listing: {listing}\n\
         - Entries: {entries} ({missing} without key, {dups} duplicates)\n\
         - Accepted matches: {accepted}\n\
         - Rejected matches: {rejected}\n\
         - Matched both: {dual}\n\
         - Warehouse rows without key: {acc_missing} accepted, {rej_missing} rejected\n\n\
         ## Tables\n{tables}\n",
        family = summary.family,
        period = summary.period,
        run_id = summary.run_id,
        started = summary.started_at,
        finished = summary.finished_at,
        listing = summary.listing_source,
        entries = summary.entry_stats.accepted,
        missing = summary.entry_stats.missing_key,
        dups = summary.entry_stats.duplicates,
        accepted = summary.matches.accepted,
        rejected = summary.matches.rejected,
        dual = summary.matches.dual,
        acc_missing = summary.accepted_index.missing_key,
        rej_missing = summary.rejected_index.missing_key,
    )
}
