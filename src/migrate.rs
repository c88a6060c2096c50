use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::{self, TableName};

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = ensure_schema(&pool, &config.table.name).await;
    pool.close().await;
    result
}

/// Create the article table and batch ledger if absent.
///
/// Safe to run on every invocation. A table created before `source` existed
/// gets the column added in place.
pub async fn ensure_schema(pool: &SqlitePool, table: &TableName) -> Result<()> {
    // Mention and keyword sets are JSON arrays of strings.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            content TEXT,
            source TEXT,
            score REAL,
            published_date TEXT,
            searched_at TEXT,
            individuals_mentioned TEXT NOT NULL DEFAULT '[]',
            keywords_used TEXT NOT NULL DEFAULT '[]'
        )
        "#
    ))
    .execute(pool)
    .await?;

    let has_source: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?) WHERE name = 'source'",
    )
    .bind(table.as_str())
    .fetch_one(pool)
    .await?;

    if !has_source {
        if let Err(e) = sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN source TEXT"))
            .execute(pool)
            .await
        {
            tracing::warn!(table = %table, error = %e, "could not add source column");
        } else {
            tracing::info!(table = %table, "added source column");
        }
    }

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_searched_at ON {table}(searched_at DESC)"
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_ledger (
            key TEXT PRIMARY KEY,
            individual TEXT NOT NULL,
            batch_date TEXT NOT NULL,
            status TEXT NOT NULL,
            records_merged INTEGER NOT NULL DEFAULT 0,
            records_skipped INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_ledger_individual ON batch_ledger(individual, status, batch_date)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
