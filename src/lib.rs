//! # newswatch
//!
//! Two-stage news ingestion for named individuals.
//!
//! The search stage queries a news provider and writes each run's results as
//! one immutable batch file. The load stage merges batch files into a single
//! URL-keyed article table, picking up only the files newer than what the
//! table already holds for the individual.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────────────────────┐   ┌──────────┐
//! │  Search  │──▶│  Batch store │──▶│ Watermark → Select → Merge  │──▶│  SQLite  │
//! │ provider │   │  S3 / fs     │   │        (load driver)        │   │ articles │
//! └──────────┘   └──────────────┘   └─────────────────────────────┘   └──────────┘
//!                                                 ▲
//!                           CLI / HTTP / event ───┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Batch items, batch keys, article rows, timestamps |
//! | [`batch_store`] | Batch file storage (S3, filesystem, memory) |
//! | [`search`] | Search stage |
//! | [`watermark`] | Per-individual load watermark |
//! | [`selector`] | Lazy listing of batch keys after a watermark |
//! | [`merge`] | URL-keyed upsert with set union |
//! | [`ledger`] | Per-file load outcomes |
//! | [`loader`] | Load driver |
//! | [`invoke`] | Event payloads and invocation responses |
//! | [`error`] | Invocation, file and record errors |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |
//! | [`logging`] | Tracing subscriber setup |

pub mod batch_store;
pub mod config;
pub mod db;
pub mod error;
pub mod invoke;
pub mod ledger;
pub mod loader;
pub mod logging;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod search;
pub mod selector;
pub mod server;
pub mod watermark;
