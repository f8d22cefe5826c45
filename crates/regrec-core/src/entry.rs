//! Canonical reporting entry: fixed fields plus an ordered bag of extension
//! attributes contributed by reconciliation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{normalize, Cell, ColumnKind, ScalarValue};

/// Column names of the canonical fields.
pub mod fields {
    pub const PRIMARY_ID: &str = "primary_id";
    pub const SECONDARY_ID: &str = "secondary_id";
    pub const REPORTER_ID: &str = "reporter_id";
    pub const INSTITUTION_TYPE: &str = "institution_type";
    pub const PERIOD: &str = "period";
    pub const FILE_LABEL: &str = "file_label";
    pub const CREATED_AT_SOURCE: &str = "created_at_source";
    pub const RECORD_TYPE: &str = "record_type";
    pub const IMPORT_FOUND: &str = "import_found";
    pub const REJECTED_IMPORT_FOUND: &str = "rejected_import_found";
    pub const REVIEWER_COMMENT: &str = "reviewer_comment";
    pub const REVIEWED_OK: &str = "reviewed_ok";
    pub const LAST_UPDATED: &str = "last_updated";

    /// Scraped descriptive fields, overwritable by external attributes.
    pub const DESCRIPTIVE: [&str; 7] = [
        PRIMARY_ID,
        REPORTER_ID,
        INSTITUTION_TYPE,
        PERIOD,
        FILE_LABEL,
        CREATED_AT_SOURCE,
        RECORD_TYPE,
    ];

    /// Owned by the engine or by reviewers; never written through a merge.
    pub const RESERVED: [&str; 6] = [
        SECONDARY_ID,
        IMPORT_FOUND,
        REJECTED_IMPORT_FOUND,
        REVIEWER_COMMENT,
        REVIEWED_OK,
        LAST_UPDATED,
    ];

    pub const BOOLEAN: [&str; 3] = [IMPORT_FOUND, REJECTED_IMPORT_FOUND, REVIEWED_OK];

    pub const REVIEWER: [&str; 2] = [REVIEWER_COMMENT, REVIEWED_OK];
}

/// Storage kind of a column, decided by name alone.
pub fn column_kind(name: &str) -> ColumnKind {
    if fields::BOOLEAN.contains(&name) {
        ColumnKind::Boolean
    } else {
        ColumnKind::Text
    }
}

/// One scraped record before it is shaped into a [`CanonicalEntry`].
pub type RawEntry = BTreeMap<String, ScalarValue>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("raw entry has no secondary_id")]
    MissingSecondaryId,
}

/// Outcome of writing one attribute into an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeWrite {
    Canonical,
    Extension,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub primary_id: String,
    pub secondary_id: String,
    pub reporter_id: String,
    pub institution_type: String,
    pub period: String,
    pub file_label: String,
    pub created_at_source: String,
    pub record_type: String,
    pub import_found: bool,
    pub rejected_import_found: bool,
    pub reviewer_comment: String,
    pub reviewed_ok: bool,
    pub last_updated: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
}

impl CanonicalEntry {
    pub fn new(secondary_id: impl Into<String>) -> Self {
        Self {
            secondary_id: secondary_id.into(),
            ..Default::default()
        }
    }

    /// Shape a raw record. Keys outside the canonical set land in the
    /// attribute bag; reviewer and flag keys in the raw record are ignored.
    pub fn from_raw(raw: &RawEntry) -> Result<Self, EntryError> {
        let secondary_id = raw
            .get(fields::SECONDARY_ID)
            .and_then(normalize)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(EntryError::MissingSecondaryId)?;

        let mut entry = Self::new(secondary_id);
        for (name, value) in raw {
            entry.set_attribute(name, normalize(value));
        }
        Ok(entry)
    }

    /// Merge one normalized attribute. Descriptive canonical fields are
    /// overwritten (null becomes empty); reserved names are refused.
    pub fn set_attribute(&mut self, name: &str, value: Option<String>) -> AttributeWrite {
        if fields::RESERVED.contains(&name) {
            return AttributeWrite::Reserved;
        }
        if let Some(slot) = self.descriptive_mut(name) {
            *slot = value.unwrap_or_default();
            return AttributeWrite::Canonical;
        }
        self.attributes.insert(name.to_string(), value);
        AttributeWrite::Extension
    }

    fn descriptive_mut(&mut self, name: &str) -> Option<&mut String> {
        match name {
            fields::PRIMARY_ID => Some(&mut self.primary_id),
            fields::REPORTER_ID => Some(&mut self.reporter_id),
            fields::INSTITUTION_TYPE => Some(&mut self.institution_type),
            fields::PERIOD => Some(&mut self.period),
            fields::FILE_LABEL => Some(&mut self.file_label),
            fields::CREATED_AT_SOURCE => Some(&mut self.created_at_source),
            fields::RECORD_TYPE => Some(&mut self.record_type),
            _ => None,
        }
    }

    /// Every column name this entry populates.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        fields::DESCRIPTIVE
            .iter()
            .chain(fields::RESERVED.iter())
            .copied()
            .chain(self.attributes.keys().map(String::as_str))
    }

    /// Full row image, keyed by column name.
    pub fn cells(&self) -> BTreeMap<String, Cell> {
        let mut out = BTreeMap::new();
        let text = |s: &str| Cell::Text(s.to_string());
        out.insert(fields::PRIMARY_ID.into(), text(&self.primary_id));
        out.insert(fields::SECONDARY_ID.into(), text(&self.secondary_id));
        out.insert(fields::REPORTER_ID.into(), text(&self.reporter_id));
        out.insert(fields::INSTITUTION_TYPE.into(), text(&self.institution_type));
        out.insert(fields::PERIOD.into(), text(&self.period));
        out.insert(fields::FILE_LABEL.into(), text(&self.file_label));
        out.insert(fields::CREATED_AT_SOURCE.into(), text(&self.created_at_source));
        out.insert(fields::RECORD_TYPE.into(), text(&self.record_type));
        out.insert(fields::IMPORT_FOUND.into(), Cell::Flag(self.import_found));
        out.insert(
            fields::REJECTED_IMPORT_FOUND.into(),
            Cell::Flag(self.rejected_import_found),
        );
        out.insert(fields::REVIEWER_COMMENT.into(), text(&self.reviewer_comment));
        out.insert(fields::REVIEWED_OK.into(), Cell::Flag(self.reviewed_ok));
        out.insert(
            fields::LAST_UPDATED.into(),
            Cell::text(self.last_updated.clone()),
        );
        for (name, value) in &self.attributes {
            out.insert(name.clone(), Cell::text(value.clone()));
        }
        out
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_deref())
    }
}

/// Shape a batch of raw entries. Records without a key are dropped; a repeated
/// `secondary_id` keeps the first position and the last record's content.
pub fn entries_from_raw(raw: &[RawEntry]) -> (Vec<CanonicalEntry>, EntryBatchStats) {
    let mut stats = EntryBatchStats::default();
    let mut out: Vec<CanonicalEntry> = Vec::with_capacity(raw.len());
    let mut positions: BTreeMap<String, usize> = BTreeMap::new();

    for record in raw {
        let entry = match CanonicalEntry::from_raw(record) {
            Ok(entry) => entry,
            Err(_) => {
                stats.missing_key += 1;
                continue;
            }
        };
        match positions.get(&entry.secondary_id) {
            Some(&idx) => {
                stats.duplicates += 1;
                out[idx] = entry;
            }
            None => {
                positions.insert(entry.secondary_id.clone(), out.len());
                out.push(entry);
            }
        }
    }
    stats.accepted = out.len();
    (out, stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBatchStats {
    pub accepted: usize,
    pub missing_key: usize,
    pub duplicates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, ScalarValue)]) -> RawEntry {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn from_raw_fills_canonical_fields_and_bag() {
        let entry = CanonicalEntry::from_raw(&raw(&[
            ("secondary_id", "A1".into()),
            ("primary_id", "P1".into()),
            ("file_label", "x.zip".into()),
            ("period", "202501".into()),
            ("extra_note", ScalarValue::Integer(5)),
            ("reviewed_ok", true.into()),
        ]))
        .unwrap();

        assert_eq!(entry.secondary_id, "A1");
        assert_eq!(entry.file_label, "x.zip");
        assert_eq!(entry.attribute("extra_note"), Some("5"));
        assert!(!entry.reviewed_ok);
        assert!(!entry.import_found);
    }

    #[test]
    fn from_raw_requires_secondary_id() {
        let err = CanonicalEntry::from_raw(&raw(&[("secondary_id", "  ".into())])).unwrap_err();
        assert_eq!(err, EntryError::MissingSecondaryId);
    }

    #[test]
    fn reserved_attributes_are_refused() {
        let mut entry = CanonicalEntry::new("A1");
        assert_eq!(
            entry.set_attribute("secondary_id", Some("B2".into())),
            AttributeWrite::Reserved
        );
        assert_eq!(
            entry.set_attribute("reporter_id", Some("77".into())),
            AttributeWrite::Canonical
        );
        assert_eq!(entry.secondary_id, "A1");
        assert_eq!(entry.reporter_id, "77");
    }

    #[test]
    fn duplicate_keys_keep_last_content() {
        let batch = vec![
            raw(&[("secondary_id", "A1".into()), ("file_label", "old.zip".into())]),
            raw(&[("secondary_id", "B2".into())]),
            raw(&[("secondary_id", "A1".into()), ("file_label", "new.zip".into())]),
            raw(&[("file_label", "orphan.zip".into())]),
        ];
        let (entries, stats) = entries_from_raw(&batch);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].secondary_id, "A1");
        assert_eq!(entries[0].file_label, "new.zip");
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.missing_key, 1);
    }

    #[test]
    fn cells_cover_every_column_name() {
        let mut entry = CanonicalEntry::new("A1");
        entry.set_attribute("melder_id", Some("77".into()));
        let cells = entry.cells();
        let names: Vec<&str> = entry.column_names().collect();
        assert_eq!(cells.len(), names.len());
        assert_eq!(cells["import_found"], Cell::Flag(false));
        assert_eq!(cells["melder_id"], Cell::Text("77".into()));
        assert_eq!(column_kind("reviewed_ok"), ColumnKind::Boolean);
        assert_eq!(column_kind("melder_id"), ColumnKind::Text);
    }
}
