//! Data types shared by the search and load stages.
//!
//! [`BatchItem`] is one element of a batch file as it sits in the store,
//! [`BatchKey`] is the storage key of a batch file, and [`ArticleRecord`] is a
//! row of the article table.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Storage format for timestamps in the article table.
///
/// Fixed width, so `MAX()` over the text column is chronological.
pub const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One normalized search result inside a batch file.
///
/// Every field is optional at this level; the merger decides which missing
/// fields make a record unusable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub searched_at: Option<String>,
    #[serde(default)]
    pub individuals_mentioned: Option<Vec<String>>,
    #[serde(default)]
    pub keywords_used: Option<Vec<String>>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// A row of the article table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleRecord {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub source: Option<String>,
    pub score: Option<f64>,
    pub published_date: Option<NaiveDateTime>,
    pub searched_at: Option<NaiveDateTime>,
    pub individuals_mentioned: BTreeSet<String>,
    pub keywords_used: BTreeSet<String>,
}

/// Storage key of a batch file:
/// `{prefix}/{individual_segment}/{YYYYMMDD}/{YYYYMMDD_HHMMSS}.json`.
///
/// Every date and time field is zero-padded and fixed width, which makes
/// lexicographic key order equal to chronological order within one
/// individual's directory. Batch selection depends on this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchKey {
    pub prefix: String,
    pub individual_segment: String,
    pub date: NaiveDate,
    pub taken_at: NaiveDateTime,
}

impl BatchKey {
    pub fn new(prefix: &str, individual: &str, at: DateTime<Utc>) -> Self {
        let taken_at = at.naive_utc();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            individual_segment: path_segment(individual),
            date: taken_at.date(),
            taken_at,
        }
    }

    /// Parse a full storage key. Returns `None` for anything that does not
    /// follow the fixed-width layout.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(4, '/');
        let file = parts.next()?;
        let date_dir = parts.next()?;
        let individual_segment = parts.next()?;
        let prefix = parts.next().unwrap_or("");

        if individual_segment.is_empty() || date_dir.len() != 8 {
            return None;
        }
        let date = NaiveDate::parse_from_str(date_dir, "%Y%m%d").ok()?;

        let stamp = file.strip_suffix(".json")?;
        if stamp.len() != 15 || !stamp.is_char_boundary(8) || &stamp[..8] != date_dir {
            return None;
        }
        let taken_at = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;

        Some(Self {
            prefix: prefix.to_string(),
            individual_segment: individual_segment.to_string(),
            date,
            taken_at,
        })
    }

    /// The individual's name as recovered from the key (`_` read as a space).
    pub fn individual(&self) -> String {
        individual_from_segment(&self.individual_segment)
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}.json",
            key_root(&self.prefix, &self.individual_segment),
            self.date.format("%Y%m%d"),
            self.taken_at.format("%Y%m%d_%H%M%S")
        )
    }
}

/// Replace every character outside `[A-Za-z0-9]` with `_`.
pub fn path_segment(individual: &str) -> String {
    individual
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn individual_from_segment(segment: &str) -> String {
    segment.replace('_', " ")
}

/// Directory holding every batch for one individual, with a trailing `/`.
pub fn key_root(prefix: &str, individual_segment: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/", individual_segment)
    } else {
        format!("{}/{}/", prefix, individual_segment)
    }
}

/// Parse a provider or batch timestamp into UTC.
///
/// Accepts RFC 3339 (a trailing `Z` is the same as `+00:00`), ISO-8601 with a
/// space separator or compact offset, naive date-times (taken as UTC),
/// bare dates (midnight UTC) and RFC 2822.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = s.strip_suffix('Z').unwrap_or(s);
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render a timestamp the way batch files carry it.
pub fn format_batch_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_db_timestamp(dt: NaiveDateTime) -> String {
    dt.format(DB_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_db_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DB_TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_batch_key_format_is_fixed_width() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let key = BatchKey::new("tavily_search_results", "Senzo Mchunu", at);
        assert_eq!(
            key.to_string(),
            "tavily_search_results/Senzo_Mchunu/20240307/20240307_090502.json"
        );
    }

    #[test]
    fn test_batch_key_without_prefix() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let key = BatchKey::new("", "A. B. O'Neil", at);
        assert_eq!(key.to_string(), "A__B__O_Neil/20240101/20240101_000000.json");
    }

    #[test]
    fn test_batch_key_parse_roundtrips_and_recovers_individual() {
        let parsed =
            BatchKey::parse("search_results/Jacob_Zuma/20231231/20231231_235959.json").unwrap();
        assert_eq!(parsed.prefix, "search_results");
        assert_eq!(parsed.individual(), "Jacob Zuma");
        assert_eq!(parsed.date, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        assert_eq!(
            parsed.to_string(),
            "search_results/Jacob_Zuma/20231231/20231231_235959.json"
        );
    }

    #[test]
    fn test_batch_key_parse_rejects_other_layouts() {
        assert!(BatchKey::parse("search_results/Jacob_Zuma/2023-12-31/x.json").is_none());
        assert!(BatchKey::parse("search_results/Jacob_Zuma/20231231/20231230_000000.json").is_none());
        assert!(BatchKey::parse("search_results/Jacob_Zuma/20231231/20231231_0000.json").is_none());
        assert!(BatchKey::parse("search_results/Jacob_Zuma/20231231/20231231_000000.txt").is_none());
        assert!(BatchKey::parse("20231231_000000.json").is_none());
    }

    #[test]
    fn test_key_order_matches_time_order() {
        let earlier = BatchKey::new("p", "X", Utc.with_ymd_and_hms(2024, 1, 9, 23, 0, 0).unwrap());
        let later = BatchKey::new("p", "X", Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap());
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn test_parse_timestamp_z_equals_explicit_utc() {
        let z = parse_timestamp("2024-05-01T10:20:30Z").unwrap();
        let offset = parse_timestamp("2024-05-01T10:20:30+00:00").unwrap();
        assert_eq!(z, offset);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 30).unwrap();
        assert_eq!(parse_timestamp("2024-05-01 10:20:30").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01T10:20:30.000000").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01T12:20:30+02:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("Wed, 01 May 2024 10:20:30 GMT").unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-05-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("   ").is_none());
    }

    #[test]
    fn test_db_timestamp_roundtrip() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(format_db_timestamp(dt), "2024-01-01 00:00:00");
        assert_eq!(parse_db_timestamp("2024-01-01 00:00:00"), Some(dt));
    }
}
