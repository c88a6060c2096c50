//! Search stage: query a news provider and write one batch file.
//!
//! A run builds a query from the individual's name and a keyword list, sends
//! it to the provider restricted to the configured news domains, normalizes
//! every hit into a [`BatchItem`] and writes the lot under a fresh
//! [`BatchKey`]. An empty result set writes nothing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::batch_store::BatchStore;
use crate::config::{Config, SearchConfig};
use crate::error::LoadError;
use crate::merge::{extract_domain, resolve_published_date};
use crate::models::{format_batch_timestamp, BatchItem, BatchKey};

/// One result as returned by the provider.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub include_domains: Vec<String>,
    pub max_results: u32,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;
}

// ============ Tavily ============

pub struct TavilyProvider {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'static str,
    include_domains: &'a [String],
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl TavilyProvider {
    /// Build a provider with the API key read from `[search] api_key_env`.
    pub fn from_config(config: &SearchConfig) -> Result<Self, LoadError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LoadError::Credentials(format!("{} not set", config.api_key_env)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LoadError::Search(e.to_string()))?;

        Ok(Self {
            api_key,
            endpoint: config.endpoint.clone(),
            client,
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let request = TavilySearchRequest {
            api_key: &self.api_key,
            query: &query.query,
            search_depth: "advanced",
            include_domains: &query.include_domains,
            max_results: query.max_results,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("search request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("search provider returned {}: {}", status, body);
        }

        let parsed: TavilySearchResponse = resp
            .json()
            .await
            .context("search provider returned an unreadable response")?;
        Ok(parsed.results)
    }
}

// ============ Requests ============

/// Parameters of one search run, taken from an invocation payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub individual: String,
    pub keywords: Vec<String>,
    pub include_domains: Vec<String>,
}

impl IngestRequest {
    /// Read `name`, `keywords` and `include_domains` from `event`, falling
    /// back to the configured lists.
    pub fn from_event(event: &Value, config: &SearchConfig) -> Result<Self, LoadError> {
        let individual = event
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LoadError::Config("Missing 'name' parameter".into()))?
            .to_string();

        let keywords = match event.get("keywords") {
            None | Some(Value::Null) => config.keywords.clone(),
            Some(v) => string_list(v)
                .ok_or_else(|| LoadError::Config("Keywords must be a list of strings".into()))?,
        };

        let include_domains = match event.get("include_domains") {
            None | Some(Value::Null) => config.include_domains.clone(),
            Some(v) => string_list(v).ok_or_else(|| {
                LoadError::Config("include_domains must be a list of strings".into())
            })?,
        };

        Ok(Self {
            individual,
            keywords,
            include_domains,
        })
    }
}

/// Trimmed, non-empty strings of a JSON array. `None` if `v` is not an array
/// of strings.
fn string_list(v: &Value) -> Option<Vec<String>> {
    let items = v.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let s = item.as_str()?.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Some(out)
}

pub fn build_query(individual: &str, keywords: &[String]) -> String {
    format!(
        "{} and fraud related news involving {} in South Africa",
        keywords.join(", "),
        individual
    )
}

/// Turn a provider hit into a batch item stamped with `searched_at`.
pub fn normalize_hit(
    hit: SearchHit,
    individual: &str,
    keywords: &[String],
    searched_at: DateTime<Utc>,
) -> BatchItem {
    let published =
        resolve_published_date(hit.published_date.as_deref(), searched_at.naive_utc()).and_utc();

    BatchItem {
        source: extract_domain(&hit.url),
        url: Some(hit.url),
        title: Some(hit.title),
        content: Some(hit.content),
        published_date: Some(format_batch_timestamp(published)),
        searched_at: Some(format_batch_timestamp(searched_at)),
        individuals_mentioned: Some(vec![individual.to_string()]),
        keywords_used: Some(keywords.to_vec()),
        score: hit.score,
    }
}

/// Result of one search run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestOutcome {
    pub query: String,
    pub processed_count: usize,
    /// Key of the written batch file; `None` when nothing was found.
    pub key: Option<String>,
}

/// Search for `request` and write the results as one batch file.
pub async fn run_ingest(
    config: &Config,
    store: &dyn BatchStore,
    provider: &dyn SearchProvider,
    request: &IngestRequest,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, LoadError> {
    let query = SearchQuery {
        query: build_query(&request.individual, &request.keywords),
        include_domains: request.include_domains.clone(),
        max_results: config.search.max_results,
    };

    tracing::info!(
        individual = %request.individual,
        provider = provider.name(),
        query = %query.query,
        "searching"
    );

    let hits = provider
        .search(&query)
        .await
        .map_err(|e| LoadError::Search(format!("{:#}", e)))?;

    let items: Vec<BatchItem> = hits
        .into_iter()
        .filter(|h| !h.url.trim().is_empty())
        .map(|h| normalize_hit(h, &request.individual, &request.keywords, now))
        .collect();

    if items.is_empty() {
        tracing::info!(individual = %request.individual, "no results, nothing written");
        return Ok(IngestOutcome {
            query: query.query,
            processed_count: 0,
            key: None,
        });
    }

    let key = BatchKey::new(config.store.key_prefix(), &request.individual, now).to_string();
    let body = serde_json::to_vec(&items).map_err(|e| LoadError::Store(e.to_string()))?;
    store
        .write(&key, &body)
        .await
        .map_err(|e| LoadError::Store(format!("{:#}", e)))?;

    tracing::info!(key = %key, results = items.len(), "batch file written");

    Ok(IngestOutcome {
        query: query.query,
        processed_count: items.len(),
        key: Some(key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_store::memory::MemoryBatchStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::PathBuf;

    struct FixedProvider(Vec<SearchHit>);

    #[async_trait]
    impl SearchProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchHit>> {
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SearchProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchHit>> {
            anyhow::bail!("rate limited")
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 15).unwrap()
    }

    fn request(name: &str) -> IngestRequest {
        IngestRequest {
            individual: name.to_string(),
            keywords: vec!["fraud".into(), "graft".into()],
            include_domains: vec!["news24.com".into()],
        }
    }

    #[test]
    fn test_build_query() {
        assert_eq!(
            build_query("Senzo Mchunu", &["Corruption".into(), "bribery".into()]),
            "Corruption, bribery and fraud related news involving Senzo Mchunu in South Africa"
        );
    }

    #[test]
    fn test_request_defaults_and_trimming() {
        let config = SearchConfig::default();
        let req = IngestRequest::from_event(&json!({"name": " A "}), &config).unwrap();
        assert_eq!(req.individual, "A");
        assert_eq!(req.keywords, config.keywords);
        assert_eq!(req.include_domains, config.include_domains);

        let req = IngestRequest::from_event(
            &json!({"name": "A", "keywords": [" fraud ", "", "  "]}),
            &config,
        )
        .unwrap();
        assert_eq!(req.keywords, vec!["fraud".to_string()]);
    }

    #[test]
    fn test_request_rejects_bad_input() {
        let config = SearchConfig::default();
        assert!(matches!(
            IngestRequest::from_event(&json!({}), &config),
            Err(LoadError::Config(_))
        ));
        let err = IngestRequest::from_event(&json!({"name": "A", "keywords": "fraud"}), &config)
            .unwrap_err();
        assert_eq!(err.to_string(), "Keywords must be a list of strings");
    }

    #[test]
    fn test_normalize_hit() {
        let hit = SearchHit {
            url: "https://www.News24.com/story".into(),
            title: "Story".into(),
            content: "Body".into(),
            published_date: None,
            score: Some(0.42),
        };
        let item = normalize_hit(hit, "A", &["fraud".into()], now());
        assert_eq!(item.source.as_deref(), Some("news24.com"));
        assert_eq!(item.published_date.as_deref(), Some("2024-03-05T09:30:15Z"));
        assert_eq!(item.searched_at.as_deref(), Some("2024-03-05T09:30:15Z"));
        assert_eq!(item.individuals_mentioned, Some(vec!["A".to_string()]));
        assert_eq!(item.score, Some(0.42));
    }

    #[tokio::test]
    async fn test_run_ingest_writes_one_batch_file() {
        let config = Config::minimal(PathBuf::from("unused.sqlite"), PathBuf::from("unused"));
        let store = MemoryBatchStore::new();
        let provider = FixedProvider(vec![
            SearchHit {
                url: "https://mg.co.za/a".into(),
                title: "A".into(),
                ..Default::default()
            },
            SearchHit {
                url: "".into(),
                ..Default::default()
            },
        ]);

        let outcome = run_ingest(&config, &store, &provider, &request("Jacob Zuma"), now())
            .await
            .unwrap();

        assert_eq!(outcome.processed_count, 1);
        let key = outcome.key.unwrap();
        assert_eq!(
            key,
            "search_results/Jacob_Zuma/20240305/20240305_093015.json"
        );
        assert_eq!(store.keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_run_ingest_empty_result_writes_nothing() {
        let config = Config::minimal(PathBuf::from("unused.sqlite"), PathBuf::from("unused"));
        let store = MemoryBatchStore::new();
        let outcome = run_ingest(&config, &store, &FixedProvider(vec![]), &request("A"), now())
            .await
            .unwrap();
        assert_eq!(outcome.processed_count, 0);
        assert!(outcome.key.is_none());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_run_ingest_provider_failure() {
        let config = Config::minimal(PathBuf::from("unused.sqlite"), PathBuf::from("unused"));
        let store = MemoryBatchStore::new();
        let err = run_ingest(&config, &store, &FailingProvider, &request("A"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Search(_)));
        assert_eq!(err.status_code(), 500);
    }
}
