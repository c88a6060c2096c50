//! TOML configuration.
//!
//! Everything a load or search invocation needs is carried in [`Config`] and
//! passed into each component explicitly. Secrets are the only values read
//! from the environment (AWS credentials, the search API key).
//!
//! ```toml
//! [db]
//! path = "./data/newswatch.sqlite"
//!
//! [table]
//! name = "news_articles"
//!
//! [store]
//! kind = "s3"
//! bucket = "press-batches"
//! region = "af-south-1"
//! prefix = "search_results"
//!
//! [loader]
//! on_watermark_failure = "rescan"
//!
//! [search]
//! keywords = ["corruption", "bribery"]
//! include_domains = ["news24.com"]
//! max_results = 20
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db::TableName;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub table: TableConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    #[serde(default = "default_table_name")]
    pub name: TableName,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: default_table_name(),
        }
    }
}

fn default_table_name() -> TableName {
    TableName::parse("news_articles").expect("default table name is a valid identifier")
}

/// Where batch files live.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// An S3 bucket (or S3-compatible endpoint).
    S3,
    /// A local directory tree mirroring the object keys.
    Fs,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Leading key segment shared by every batch file.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_prefix() -> String {
    "search_results".to_string()
}
fn default_page_size() -> usize {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl StoreConfig {
    /// The key prefix with surrounding slashes removed.
    pub fn key_prefix(&self) -> &str {
        self.prefix.trim_matches('/')
    }
}

/// What the load driver does when the watermark query itself fails.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkFailurePolicy {
    /// Treat the failure as "no watermark" and list the whole history.
    #[default]
    Rescan,
    /// Fail the invocation.
    Abort,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoaderConfig {
    #[serde(default)]
    pub on_watermark_failure: WatermarkFailurePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Name of the environment variable holding the provider API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_include_domains")]
    pub include_domains: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            endpoint: default_search_endpoint(),
            keywords: default_keywords(),
            include_domains: default_include_domains(),
            max_results: default_max_results(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "TAVILY_API_KEY".to_string()
}
fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}
fn default_keywords() -> Vec<String> {
    [
        "Corruption",
        "bribery",
        "fraud",
        "graft",
        "embezzlement",
        "wasteful spending",
        "misuse of public funds",
        "financial misconduct",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_include_domains() -> Vec<String> {
    [
        "news24.com",
        "timeslive.co.za",
        "mg.co.za",
        "iol.co.za",
        "fin24.com",
        "dailymaverick.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_results() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// A config backed by a local SQLite file and a local batch directory.
    ///
    /// Used by tests and by `newswatch` when pointed at a scratch directory.
    pub fn minimal(db_path: PathBuf, store_root: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            table: TableConfig::default(),
            store: StoreConfig {
                kind: StoreKind::Fs,
                bucket: None,
                region: default_region(),
                prefix: default_prefix(),
                endpoint_url: None,
                root: Some(store_root),
                page_size: default_page_size(),
                timeout_secs: default_timeout_secs(),
            },
            loader: LoaderConfig::default(),
            search: SearchConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.store.kind {
        StoreKind::S3 => {
            if config.store.bucket.as_deref().unwrap_or("").is_empty() {
                bail!("store.bucket must be set when store.kind is 's3'");
            }
        }
        StoreKind::Fs => {
            if config.store.root.is_none() {
                bail!("store.root must be set when store.kind is 'fs'");
            }
        }
    }

    if config.store.page_size == 0 || config.store.page_size > 1000 {
        bail!("store.page_size must be in [1, 1000]");
    }

    if config.search.max_results == 0 || config.search.max_results > 20 {
        bail!("search.max_results must be in [1, 20]");
    }

    if config.search.api_key_env.trim().is_empty() {
        bail!("search.api_key_env must not be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_s3_config_uses_defaults() {
        let cfg = parse_config(
            r#"
            [db]
            path = "/tmp/nw.sqlite"

            [store]
            kind = "s3"
            bucket = "batches"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.table.name.as_str(), "news_articles");
        assert_eq!(cfg.store.key_prefix(), "search_results");
        assert_eq!(cfg.store.region, "us-east-1");
        assert_eq!(
            cfg.loader.on_watermark_failure,
            WatermarkFailurePolicy::Rescan
        );
        assert_eq!(cfg.search.max_results, 20);
        assert_eq!(cfg.search.keywords.len(), 8);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let err = parse_config(
            r#"
            [db]
            path = "/tmp/nw.sqlite"

            [store]
            kind = "s3"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("store.bucket"));
    }

    #[test]
    fn test_fs_requires_root() {
        let err = parse_config(
            r#"
            [db]
            path = "/tmp/nw.sqlite"

            [store]
            kind = "fs"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("store.root"));
    }

    #[test]
    fn test_rejects_injected_table_name() {
        let err = parse_config(
            r#"
            [db]
            path = "/tmp/nw.sqlite"

            [table]
            name = "articles; DROP TABLE x"

            [store]
            kind = "fs"
            root = "/tmp/batches"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("identifier"));
    }

    #[test]
    fn test_prefix_slashes_trimmed() {
        let cfg = parse_config(
            r#"
            [db]
            path = "/tmp/nw.sqlite"

            [store]
            kind = "fs"
            root = "/tmp/batches"
            prefix = "/tavily_search_results/"

            [loader]
            on_watermark_failure = "abort"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.store.key_prefix(), "tavily_search_results");
        assert_eq!(cfg.loader.on_watermark_failure, WatermarkFailurePolicy::Abort);
    }
}
