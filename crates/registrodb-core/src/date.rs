//! The registry's date representation.
//!
//! Source CSVs carry dates as bare `YYYYMMDD` strings, with `""`, `"0"` and
//! `"00000000"` all meaning "no date". [`RegistryDate`] is a distinct
//! newtype over [`chrono::NaiveDate`] so the conversion to database
//! timestamps is an explicit `From`, never a runtime type inspection.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A calendar date as found in the registry extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryDate(pub NaiveDate);

impl RegistryDate {
    /// Parse a `YYYYMMDD` field. Empty and all-zero values are `None`.
    pub fn parse(field: &str) -> Option<Self> {
        let field = field.trim();
        if field.is_empty() || field.chars().all(|c| c == '0') {
            return None;
        }
        NaiveDate::parse_from_str(field, "%Y%m%d").ok().map(Self)
    }
}

impl From<RegistryDate> for NaiveDate {
    fn from(d: RegistryDate) -> Self {
        d.0
    }
}

impl std::fmt::Display for RegistryDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}
