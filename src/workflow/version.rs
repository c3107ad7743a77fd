use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionNumber {
    pub major: i32,
    pub minor: i32,
}

impl VersionNumber {
    pub const INITIAL: VersionNumber = VersionNumber { major: 1, minor: 0 };

    pub fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    pub fn bump(self, bump: VersionBump) -> Self {
        match bump {
            VersionBump::Major => Self::new(self.major + 1, 0),
            VersionBump::Minor => Self::new(self.major, self.minor + 1),
        }
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionNumber {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (major, minor) = value
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("invalid version '{value}'"))?;
        let major = major
            .parse::<i32>()
            .map_err(|_| format!("invalid version '{value}'"))?;
        let minor = minor
            .parse::<i32>()
            .map_err(|_| format!("invalid version '{value}'"))?;
        if major < 1 || minor < 0 {
            return Err(format!("invalid version '{value}'"));
        }
        Ok(Self { major, minor })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    Major,
    Minor,
}

/// `{TYPE}-{YYYY}-` prefix shared by every number of one type and year.
pub fn document_number_prefix(type_code: &str, date: NaiveDate) -> String {
    format!("{}-{:04}-", type_code.to_ascii_uppercase(), date.year())
}

pub fn format_document_number(type_code: &str, date: NaiveDate, sequence: u32) -> String {
    format!("{}{:04}", document_number_prefix(type_code, date), sequence)
}

/// Trailing sequence of a document number carrying `prefix`.
pub fn parse_sequence(document_number: &str, prefix: &str) -> Option<u32> {
    document_number
        .strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

/// Next free sequence given the numbers already issued under `prefix`.
pub fn next_sequence<'a>(existing: impl IntoIterator<Item = &'a str>, prefix: &str) -> u32 {
    existing
        .into_iter()
        .filter_map(|number| parse_sequence(number, prefix))
        .max()
        .unwrap_or(0)
        + 1
}
