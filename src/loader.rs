//! Load driver: watermark → batch selection → per-file merge.
//!
//! ```text
//! ResolvingWatermark ─▶ SelectingBatches ─▶ ProcessingBatch* ─▶ Done
//!          │                   │
//!          └───────────────────┴──────────▶ Failed
//! ```
//!
//! Each batch file is one unit of work: its merges and its ledger row commit
//! in a single transaction, and a failure in one file is logged and does not
//! stop the next. Only connection-level problems (no database, no listing)
//! fail the run.

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::batch_store::BatchStore;
use crate::config::{Config, WatermarkFailurePolicy};
use crate::db;
use crate::error::{FileError, LoadError};
use crate::ledger;
use crate::merge::{split_batch, BatchMergeStats, RecordMerger};
use crate::migrate;
use crate::models::BatchKey;
use crate::selector::BatchSelector;
use crate::watermark::{Watermark, WatermarkResolver};

/// Where the driver is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    ResolvingWatermark,
    SelectingBatches,
    ProcessingBatch,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Ignore the watermark and the ledger; re-list the whole history.
    pub full: bool,
    /// List what would be loaded without reading or writing anything.
    pub dry_run: bool,
    /// Stop after this many files have been attempted.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of one load run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadReport {
    pub individual: String,
    pub watermark: String,
    pub boundary: String,
    pub phase: LoadPhase,
    pub processed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub failures: Vec<FileFailure>,
    /// Keys that would be processed; only filled on dry runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_keys: Vec<String>,
}

impl LoadReport {
    fn new(individual: &str) -> Self {
        Self {
            individual: individual.to_string(),
            watermark: String::new(),
            boundary: String::new(),
            phase: LoadPhase::ResolvingWatermark,
            processed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            records_inserted: 0,
            records_updated: 0,
            records_skipped: 0,
            failures: Vec::new(),
            pending_keys: Vec::new(),
        }
    }

    pub fn records_merged(&self) -> u64 {
        self.records_inserted + self.records_updated
    }

    fn enter(&mut self, phase: LoadPhase) {
        tracing::debug!(individual = %self.individual, from = ?self.phase, to = ?phase, "load phase");
        self.phase = phase;
    }
}

/// Load every new batch file for `individual`.
///
/// Opens the database, prepares the schema, runs the load and closes the
/// pool on every path out.
pub async fn run_load(
    config: &Config,
    store: &dyn BatchStore,
    individual: &str,
    options: &LoadOptions,
) -> Result<LoadReport, LoadError> {
    let individual = individual.trim();
    if individual.is_empty() {
        return Err(LoadError::Config("No name provided".into()));
    }

    let pool = db::connect(config)
        .await
        .map_err(|e| LoadError::Connection(format!("{:#}", e)))?;

    let result = match migrate::ensure_schema(&pool, &config.table.name).await {
        Ok(()) => {
            LoadDriver::new(config, store, &pool)
                .run(individual, options)
                .await
        }
        Err(e) => Err(LoadError::Connection(format!("{:#}", e))),
    };

    pool.close().await;

    if let Err(ref e) = result {
        tracing::error!(individual, phase = ?LoadPhase::Failed, error = %e, "load failed");
    }
    result
}

pub struct LoadDriver<'a> {
    config: &'a Config,
    store: &'a dyn BatchStore,
    pool: &'a SqlitePool,
    merger: RecordMerger,
}

impl<'a> LoadDriver<'a> {
    pub fn new(config: &'a Config, store: &'a dyn BatchStore, pool: &'a SqlitePool) -> Self {
        Self {
            config,
            store,
            pool,
            merger: RecordMerger::new(config.table.name.clone()),
        }
    }

    pub async fn run(&self, individual: &str, options: &LoadOptions) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::new(individual);

        // Resolve
        let watermark = WatermarkResolver::new(self.pool, &self.config.table.name)
            .resolve(individual)
            .await?;
        report.watermark = watermark.to_string();

        let first_date = if options.full {
            None
        } else {
            self.first_listed_date(individual, &watermark).await?
        };

        // Select
        report.enter(LoadPhase::SelectingBatches);
        let mut selector = BatchSelector::from_date(
            self.store,
            self.config.store.key_prefix(),
            individual,
            first_date,
        );
        report.boundary = selector.boundary().to_string();

        tracing::info!(
            individual,
            watermark = %watermark,
            boundary = %report.boundary,
            store = %self.store.describe(),
            "selecting batches"
        );

        // Process
        let mut attempted = 0usize;
        loop {
            if options.limit.is_some_and(|limit| attempted >= limit) {
                break;
            }

            let key = match selector.next_key().await {
                Ok(Some(key)) => key,
                Ok(None) => break,
                Err(e) => {
                    report.enter(LoadPhase::Failed);
                    return Err(LoadError::Store(format!("{:#}", e)));
                }
            };

            if !options.full && self.already_loaded(&key).await {
                tracing::debug!(key = %key, "already loaded, skipping");
                report.skipped_files += 1;
                continue;
            }

            attempted += 1;
            if options.dry_run {
                report.pending_keys.push(key);
                continue;
            }

            report.enter(LoadPhase::ProcessingBatch);
            self.process_file(&key, individual, &mut report).await;
        }

        report.enter(LoadPhase::Done);
        tracing::info!(
            individual,
            processed_files = report.processed_files,
            failed_files = report.failed_files,
            skipped_files = report.skipped_files,
            records_merged = report.records_merged(),
            records_skipped = report.records_skipped,
            "load complete"
        );
        Ok(report)
    }

    /// Oldest batch date that must be listed, or `None` for everything.
    ///
    /// Starts from the watermark, is capped by the newest batch this
    /// individual's own runs have loaded, and is lowered to the oldest failed
    /// batch. Already-loaded files inside the window are skipped via the
    /// ledger.
    async fn first_listed_date(
        &self,
        individual: &str,
        watermark: &Watermark,
    ) -> Result<Option<NaiveDate>, LoadError> {
        let watermark_date = match watermark {
            Watermark::Known(date) => *date,
            Watermark::NoWatermark => return Ok(None),
            Watermark::ResolutionFailed(reason) => {
                return match self.config.loader.on_watermark_failure {
                    WatermarkFailurePolicy::Rescan => {
                        tracing::warn!(individual, reason = %reason, "watermark unknown, rescanning full history");
                        Ok(None)
                    }
                    WatermarkFailurePolicy::Abort => Err(LoadError::Watermark(reason.clone())),
                };
            }
        };

        // Another individual's load can push the watermark past batches this
        // individual has never loaded.
        let mut date = match ledger::latest_loaded_date(self.pool, individual).await {
            Ok(Some(loaded)) if loaded < watermark_date => {
                tracing::info!(
                    individual,
                    watermark = %watermark_date,
                    latest_loaded = %loaded,
                    "watermark ahead of loaded batches, listing from the ledger"
                );
                loaded
            }
            Ok(Some(_)) => watermark_date,
            Ok(None) => {
                tracing::info!(individual, "no batches loaded for individual yet, listing full history");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(individual, error = %e, "could not read batch ledger, listing full history");
                return Ok(None);
            }
        };

        // A failed file dated before this would otherwise sort behind the
        // boundary forever.
        match ledger::earliest_failed_date(self.pool, individual).await {
            Ok(Some(failed)) if failed < date => {
                tracing::info!(individual, failed_date = %failed, "lowering boundary to revisit failed batches");
                date = failed;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(individual, error = %e, "could not read batch ledger, listing full history");
                return Ok(None);
            }
        }

        Ok(Some(date))
    }

    async fn already_loaded(&self, key: &str) -> bool {
        match ledger::is_loaded(self.pool, key).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(key, error = %e, "could not read batch ledger");
                false
            }
        }
    }

    async fn process_file(&self, key: &str, individual: &str, report: &mut LoadReport) {
        tracing::info!(key, "processing batch file");

        match self.load_file(key, individual).await {
            Ok(stats) => {
                report.processed_files += 1;
                report.records_inserted += stats.inserted;
                report.records_updated += stats.updated;
                report.records_skipped += stats.skipped;
                tracing::info!(
                    key,
                    merged = stats.merged(),
                    skipped = stats.skipped,
                    "batch file loaded"
                );
            }
            Err(e) => {
                report.failed_files += 1;
                report.failures.push(FileFailure {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                tracing::error!(key, error = %e, "failed to process batch file");

                if let Some(batch_key) = BatchKey::parse(key) {
                    if let Err(le) =
                        ledger::mark_failed(self.pool, &batch_key, individual, &e.to_string()).await
                    {
                        tracing::warn!(key, error = %le, "could not record failure in ledger");
                    }
                }
            }
        }
    }

    /// Read, parse and merge one file inside a single transaction.
    async fn load_file(&self, key: &str, individual: &str) -> Result<BatchMergeStats, FileError> {
        let batch_key = BatchKey::parse(key)
            .ok_or_else(|| FileError::Read(format!("'{}' is not a batch key", key)))?;

        let body = self
            .store
            .read(key)
            .await
            .map_err(|e| FileError::Read(format!("{:#}", e)))?;
        let records = split_batch(&body)?;

        let mut tx = self.pool.begin().await?;
        let merged = self
            .merge_and_record(&mut *tx, &batch_key, key, records, individual)
            .await;

        match merged {
            Ok(stats) => {
                tx.commit().await?;
                Ok(stats)
            }
            Err(e) => {
                if let Err(re) = tx.rollback().await {
                    tracing::warn!(key, error = %re, "rollback failed");
                }
                Err(e.into())
            }
        }
    }

    async fn merge_and_record(
        &self,
        conn: &mut SqliteConnection,
        batch_key: &BatchKey,
        key: &str,
        records: Vec<serde_json::Value>,
        individual: &str,
    ) -> Result<BatchMergeStats, sqlx::Error> {
        let stats = self
            .merger
            .merge_batch(&mut *conn, key, records, individual)
            .await?;
        ledger::mark_loaded(&mut *conn, batch_key, individual, stats.merged(), stats.skipped)
            .await?;
        Ok(stats)
    }
}
