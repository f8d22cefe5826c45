//! Period tokens and the period-scoped table names derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableNameError {
    #[error("invalid period `{0}`: must be YYYYMM (e.g. 202405)")]
    Period(String),
    #[error("invalid table prefix `{0}`: only ASCII letters, digits and `_` are allowed")]
    Prefix(String),
}

/// Reporting cycle token, `YYYYMM`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period(String);

impl Period {
    pub fn parse(input: &str) -> Result<Self, TableNameError> {
        let token = input.trim();
        let valid = token.len() == 6
            && token.bytes().all(|b| b.is_ascii_digit())
            && matches!(token[4..].parse::<u8>(), Ok(1..=12));
        if valid {
            Ok(Self(token.to_string()))
        } else {
            Err(TableNameError::Period(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Period {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = TableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted (family, period) table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodTable {
    prefix: String,
    period: Period,
    name: String,
}

impl PeriodTable {
    pub fn new(prefix: &str, period: Period) -> Result<Self, TableNameError> {
        validate_prefix(prefix)?;
        let name = format!("{prefix}{period}");
        Ok(Self {
            prefix: prefix.to_string(),
            period,
            name,
        })
    }

    /// Inverse of [`PeriodTable::new`] for names found in the store.
    pub fn from_name(prefix: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?;
        let period = Period::parse(rest).ok()?;
        Self::new(prefix, period).ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> &Period {
        &self.period
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn quoted(&self) -> String {
        quote_ident(&self.name)
    }
}

impl fmt::Display for PeriodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub fn validate_prefix(prefix: &str) -> Result<(), TableNameError> {
    let ok = !prefix.is_empty()
        && prefix.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && prefix.as_bytes()[0].is_ascii_alphabetic();
    if ok {
        Ok(())
    } else {
        Err(TableNameError::Prefix(prefix.to_string()))
    }
}

/// SQL identifier quoting; column names come from upstream data.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_must_be_yyyymm() {
        assert!(Period::parse("202501").is_ok());
        assert!(Period::parse("202513").is_err());
        assert!(Period::parse("2025-01").is_err());
        assert!(Period::parse("20251").is_err());
    }

    #[test]
    fn table_name_round_trips_through_store_listing() {
        let table = PeriodTable::new("BMI", Period::parse("202405").unwrap()).unwrap();
        assert_eq!(table.name(), "BMI202405");
        assert_eq!(PeriodTable::from_name("BMI", "BMI202405"), Some(table));
        assert_eq!(PeriodTable::from_name("BMI", "BMI_EMISO_202405"), None);
        assert_eq!(PeriodTable::from_name("BMI", "settings"), None);
    }

    #[test]
    fn hostile_prefixes_are_rejected() {
        let period = Period::parse("202405").unwrap();
        assert!(PeriodTable::new("BMI; DROP", period.clone()).is_err());
        assert!(PeriodTable::new("", period).is_err());
    }

    #[test]
    fn identifiers_escape_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
