//! Per-individual load watermark.
//!
//! The watermark is never stored. It is the calendar date of the newest
//! `searched_at` among articles whose mention set contains the individual,
//! recomputed at the start of every load.

use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::fmt;

use crate::db::TableName;
use crate::error::LoadError;
use crate::models::parse_db_timestamp;

/// Result of resolving a watermark.
///
/// `ResolutionFailed` is kept apart from `NoWatermark` so the caller decides
/// whether a broken query means "rescan everything" or "stop".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watermark {
    /// No article mentions the individual yet.
    NoWatermark,
    /// Date of the newest sighting for the individual.
    Known(NaiveDate),
    /// The query failed; carries the reason.
    ResolutionFailed(String),
}

impl Watermark {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Watermark::Known(date) => Some(*date),
            _ => None,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::NoWatermark => f.write_str("none"),
            Watermark::Known(date) => write!(f, "{}", date.format("%Y%m%d")),
            Watermark::ResolutionFailed(_) => f.write_str("unknown"),
        }
    }
}

pub struct WatermarkResolver<'a> {
    pool: &'a SqlitePool,
    table: &'a TableName,
}

impl<'a> WatermarkResolver<'a> {
    pub fn new(pool: &'a SqlitePool, table: &'a TableName) -> Self {
        Self { pool, table }
    }

    /// Resolve the watermark for `individual`.
    ///
    /// Membership is an exact, case-sensitive match against the stored
    /// mention set. An empty name is a caller error; a failing query is
    /// reported as [`Watermark::ResolutionFailed`], never as an error.
    pub async fn resolve(&self, individual: &str) -> Result<Watermark, LoadError> {
        if individual.is_empty() {
            return Err(LoadError::Config("individual name must not be empty".into()));
        }

        let sql = format!(
            r#"
            SELECT MAX(a.searched_at) FROM {table} a
            WHERE EXISTS (
                SELECT 1 FROM json_each(a.individuals_mentioned) m WHERE m.value = ?
            )
            "#,
            table = self.table
        );

        let latest: Option<String> = match sqlx::query_scalar(&sql)
            .bind(individual)
            .fetch_one(self.pool)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(individual, error = %e, "watermark query failed");
                return Ok(Watermark::ResolutionFailed(e.to_string()));
            }
        };

        match latest {
            None => Ok(Watermark::NoWatermark),
            Some(raw) => match parse_db_timestamp(&raw) {
                Some(ts) => Ok(Watermark::Known(ts.date())),
                None => {
                    tracing::warn!(individual, value = %raw, "unparsable searched_at in article table");
                    Ok(Watermark::ResolutionFailed(format!(
                        "unparsable searched_at '{}'",
                        raw
                    )))
                }
            },
        }
    }
}
