//! Per-file completion tracking.
//!
//! The watermark only says "nothing before this date needs loading". The
//! ledger records the outcome of every batch file the loader touched, so a
//! file that failed on a day the watermark has since passed is still found
//! again, and a file that already loaded is not merged twice.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::{SqliteConnection, SqlitePool};

use crate::models::BatchKey;

/// Outcome recorded for one batch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Loaded,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Loaded => "loaded",
            BatchStatus::Failed => "failed",
        }
    }
}

pub async fn is_loaded(pool: &SqlitePool, key: &str) -> Result<bool> {
    let loaded: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM batch_ledger WHERE key = ? AND status = 'loaded'",
    )
    .bind(key)
    .fetch_one(pool)
    .await?;
    Ok(loaded)
}

/// Record a successful load. Runs on the caller's transaction so the ledger
/// row commits together with the file's merges.
pub async fn mark_loaded(
    conn: &mut SqliteConnection,
    key: &BatchKey,
    individual: &str,
    records_merged: u64,
    records_skipped: u64,
) -> Result<(), sqlx::Error> {
    upsert(
        conn,
        key,
        individual,
        BatchStatus::Loaded,
        records_merged,
        records_skipped,
        None,
    )
    .await
}

pub async fn mark_failed(
    pool: &SqlitePool,
    key: &BatchKey,
    individual: &str,
    error: &str,
) -> Result<()> {
    let mut conn = pool.acquire().await?;
    upsert(
        &mut conn,
        key,
        individual,
        BatchStatus::Failed,
        0,
        0,
        Some(error),
    )
    .await?;
    Ok(())
}

async fn upsert(
    conn: &mut SqliteConnection,
    key: &BatchKey,
    individual: &str,
    status: BatchStatus,
    records_merged: u64,
    records_skipped: u64,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO batch_ledger (key, individual, batch_date, status, records_merged, records_skipped, error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            status = excluded.status,
            records_merged = excluded.records_merged,
            records_skipped = excluded.records_skipped,
            error = excluded.error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key.to_string())
    .bind(individual)
    .bind(key.date.format("%Y%m%d").to_string())
    .bind(status.as_str())
    .bind(records_merged as i64)
    .bind(records_skipped as i64)
    .bind(error)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Date of the oldest batch for `individual` whose last attempt failed.
pub async fn earliest_failed_date(pool: &SqlitePool, individual: &str) -> Result<Option<NaiveDate>> {
    batch_date(
        pool,
        "SELECT MIN(batch_date) FROM batch_ledger WHERE individual = ? AND status = 'failed'",
        individual,
    )
    .await
}

/// Date of the newest batch loaded for `individual` by its own load runs.
///
/// Unlike the watermark, this never moves because another individual's load
/// re-sighted a shared article.
pub async fn latest_loaded_date(pool: &SqlitePool, individual: &str) -> Result<Option<NaiveDate>> {
    batch_date(
        pool,
        "SELECT MAX(batch_date) FROM batch_ledger WHERE individual = ? AND status = 'loaded'",
        individual,
    )
    .await
}

async fn batch_date(pool: &SqlitePool, sql: &str, individual: &str) -> Result<Option<NaiveDate>> {
    let date: Option<String> = sqlx::query_scalar(sql)
        .bind(individual)
        .fetch_one(pool)
        .await?;

    Ok(date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok()))
}
