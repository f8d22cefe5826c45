//! Join canonical entries against the accepted and rejected indices.

use regrec_core::{normalize, AttributeWrite, CanonicalEntry, ExternalRow};
use serde::Serialize;
use tracing::debug;

use crate::index::ExternalIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchCounts {
    pub accepted: usize,
    pub rejected: usize,
    /// Entries that matched both indices; both flags stay set.
    pub dual: usize,
    /// External attributes refused because they name an engine-owned field.
    pub reserved_skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub entries: Vec<CanonicalEntry>,
    pub counts: MatchCounts,
}

/// Accepted attributes merge first, rejected second; on a shared attribute
/// the rejected value is kept.
pub fn reconcile(
    entries: Vec<CanonicalEntry>,
    accepted: &ExternalIndex,
    rejected: &ExternalIndex,
) -> Reconciliation {
    let mut counts = MatchCounts::default();
    let mut out = Vec::with_capacity(entries.len());

    for mut entry in entries {
        // both lookups use the label as scraped, before any merge touches it
        let label = entry.file_label.clone();
        let accepted_row = accepted.get(&label);
        let rejected_row = rejected.get(&label);

        if let Some(row) = accepted_row {
            entry.import_found = true;
            counts.accepted += 1;
            counts.reserved_skipped += merge(&mut entry, row);
        }
        if let Some(row) = rejected_row {
            entry.rejected_import_found = true;
            counts.rejected += 1;
            counts.reserved_skipped += merge(&mut entry, row);
        }
        if accepted_row.is_some() && rejected_row.is_some() {
            counts.dual += 1;
            debug!(secondary_id = entry.secondary_id.as_str(), file_label = label.as_str(), "matched accepted and rejected");
        }
        out.push(entry);
    }

    Reconciliation {
        entries: out,
        counts,
    }
}

fn merge(entry: &mut CanonicalEntry, row: &ExternalRow) -> usize {
    let mut refused = 0;
    for (name, value) in row {
        if entry.set_attribute(name, normalize(value)) == AttributeWrite::Reserved {
            refused += 1;
        }
    }
    refused
}

#[cfg(test)]
mod tests {
    use super::*;
    use regrec_core::ScalarValue;

    fn entry(id: &str, label: &str) -> CanonicalEntry {
        let mut e = CanonicalEntry::new(id);
        e.file_label = label.to_string();
        e.period = "202501".to_string();
        e
    }

    fn index(key: &str, rows: Vec<Vec<(&str, ScalarValue)>>) -> ExternalIndex {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
            .collect();
        ExternalIndex::build(rows, key)
    }

    #[test]
    fn accepted_match_sets_flag_and_merges_normalized_values() {
        let accepted = index(
            "datei_id",
            vec![vec![
                ("datei_id", "x.zip".into()),
                ("melder_id", 77i64.into()),
                ("betrag", 12.0f64.into()),
                ("geprueft", true.into()),
            ]],
        );
        let rejected = index("import_datei_id", vec![]);
        let result = reconcile(vec![entry("A1", "x.zip")], &accepted, &rejected);

        let e = &result.entries[0];
        assert!(e.import_found);
        assert!(!e.rejected_import_found);
        assert_eq!(e.attribute("melder_id"), Some("77"));
        assert_eq!(e.attribute("betrag"), Some("12"));
        assert_eq!(e.attribute("geprueft"), Some("True"));
        assert_eq!(result.counts.accepted, 1);
        assert_eq!(result.counts.rejected, 0);
    }

    #[test]
    fn flags_are_independent() {
        let accepted = index("datei_id", vec![vec![("datei_id", "a.zip".into())]]);
        let rejected = index("import_datei_id", vec![vec![("import_datei_id", "b.zip".into())]]);
        let result = reconcile(
            vec![entry("1", "a.zip"), entry("2", "b.zip"), entry("3", "c.zip")],
            &accepted,
            &rejected,
        );
        let flags = result
            .entries
            .iter()
            .map(|e| (e.import_found, e.rejected_import_found))
            .collect::<Vec<_>>();
        assert_eq!(flags, vec![(true, false), (false, true), (false, false)]);
        assert_eq!(result.entries[2], entry("3", "c.zip"));
    }

    #[test]
    fn dual_match_keeps_both_flags_and_rejected_value_wins() {
        let accepted = index(
            "datei_id",
            vec![vec![("datei_id", "x.zip".into()), ("status", "ok".into())]],
        );
        let rejected = index(
            "import_datei_id",
            vec![vec![("import_datei_id", "x.zip".into()), ("status", "abgewiesen".into())]],
        );
        let result = reconcile(vec![entry("A1", "x.zip")], &accepted, &rejected);
        let e = &result.entries[0];
        assert!(e.import_found && e.rejected_import_found);
        assert_eq!(e.attribute("status"), Some("abgewiesen"));
        assert_eq!(result.counts.dual, 1);
    }

    #[test]
    fn reserved_attributes_are_refused() {
        let accepted = index(
            "datei_id",
            vec![vec![
                ("datei_id", "x.zip".into()),
                ("reviewed_ok", true.into()),
                ("secondary_id", "evil".into()),
                ("reporter_id", "99".into()),
            ]],
        );
        let rejected = index("import_datei_id", vec![]);
        let result = reconcile(vec![entry("A1", "x.zip")], &accepted, &rejected);
        let e = &result.entries[0];
        assert_eq!(e.secondary_id, "A1");
        assert!(!e.reviewed_ok);
        assert_eq!(e.reporter_id, "99");
        assert_eq!(result.counts.reserved_skipped, 2);
    }
}
