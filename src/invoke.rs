//! Invocation payloads and responses.
//!
//! Both stages are driven by a JSON event and answer with
//! `{"statusCode": ..., "body": ...}`. The load stage accepts three event
//! shapes:
//!
//! ```json
//! { "name": "Jacob Zuma", "key": "search_results/Jacob_Zuma/20240101/20240101_080000.json" }
//! { "detail": { "object": { "key": "..." } } }              // EventBridge
//! { "Records": [ { "s3": { "object": { "key": "..." } } } ] } // S3 notification
//! ```

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::batch_store::{self, BatchStore};
use crate::config::Config;
use crate::error::LoadError;
use crate::loader::{run_load, LoadOptions, LoadReport};
use crate::models::BatchKey;
use crate::search::{run_ingest, IngestOutcome, IngestRequest, SearchProvider, TavilyProvider};

/// Response of one invocation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Invocation {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl Invocation {
    pub fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn from_error(err: &LoadError) -> Self {
        Self {
            status_code: err.status_code(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

/// Batch key carried by `event`, if any.
///
/// A direct `key` wins over an EventBridge key, which wins over an S3
/// notification key. S3 notification keys arrive form-urlencoded.
pub fn event_key(event: &Value) -> Option<String> {
    if let Some(key) = event.get("key").and_then(Value::as_str) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    if let Some(key) = event.pointer("/detail/object/key").and_then(Value::as_str) {
        tracing::info!(key, "received EventBridge trigger");
        return Some(key.to_string());
    }

    if event.get("Records").is_some() {
        match event
            .pointer("/Records/0/s3/object/key")
            .and_then(Value::as_str)
        {
            Some(raw) => {
                let key = decode_form_component(raw);
                tracing::info!(key = %key, "received S3 notification trigger");
                return Some(key);
            }
            None => tracing::warn!("S3 notification without an object key"),
        }
    }

    None
}

/// `+` is a space in form encoding; everything else is percent-decoding.
fn decode_form_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Individual named by a batch key: its individual segment with `_` read
/// as a space.
pub fn individual_from_key(key: &str) -> Option<String> {
    if let Some(parsed) = BatchKey::parse(key) {
        return Some(parsed.individual());
    }
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() >= 3 && !parts[1].is_empty() {
        Some(parts[1].replace('_', " "))
    } else {
        None
    }
}

/// Individual to load for `event`. An explicit `name` wins; otherwise the
/// name is recovered from the event's batch key.
pub fn resolve_individual(event: &Value) -> Option<String> {
    let explicit = event
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty());

    match explicit {
        Some(name) => Some(name.to_string()),
        None => event_key(event).as_deref().and_then(individual_from_key),
    }
}

fn load_options(event: &Value) -> LoadOptions {
    LoadOptions {
        full: event.get("full").and_then(Value::as_bool).unwrap_or(false),
        dry_run: event.get("dry_run").and_then(Value::as_bool).unwrap_or(false),
        limit: event
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize),
    }
}

/// Run the load stage for `event` against the configured store.
pub async fn invoke_load(config: &Config, event: &Value) -> Invocation {
    let Some(individual) = resolve_individual(event) else {
        tracing::error!("no name provided in event");
        return Invocation::from_error(&LoadError::Config("No name provided in event".into()));
    };

    let store = match batch_store::from_config(&config.store) {
        Ok(store) => store,
        Err(e) => return Invocation::from_error(&LoadError::Credentials(format!("{:#}", e))),
    };

    invoke_load_with(config, store.as_ref(), &individual, &load_options(event)).await
}

pub async fn invoke_load_with(
    config: &Config,
    store: &dyn BatchStore,
    individual: &str,
    options: &LoadOptions,
) -> Invocation {
    match run_load(config, store, individual, options).await {
        Ok(report) => Invocation::ok(load_body(&report)),
        Err(e) => Invocation::from_error(&e),
    }
}

fn load_body(report: &LoadReport) -> Value {
    let mut body = json!({
        "message": "Processing complete",
        "individual": report.individual,
        "watermark": report.watermark,
        "processed_files": report.processed_files,
        "failed_files": report.failed_files,
        "skipped_files": report.skipped_files,
        "records_merged": report.records_merged(),
        "records_skipped": report.records_skipped,
        "failures": report.failures,
    });
    if !report.pending_keys.is_empty() {
        body["pending_keys"] = json!(report.pending_keys);
    }
    body
}

/// Run the search stage for `event` with the configured provider and store.
pub async fn invoke_ingest(config: &Config, event: &Value) -> Invocation {
    let request = match IngestRequest::from_event(event, &config.search) {
        Ok(r) => r,
        Err(e) => return Invocation::from_error(&e),
    };

    let provider = match TavilyProvider::from_config(&config.search) {
        Ok(p) => p,
        Err(e) => return Invocation::from_error(&e),
    };

    let store = match batch_store::from_config(&config.store) {
        Ok(store) => store,
        Err(e) => return Invocation::from_error(&LoadError::Credentials(format!("{:#}", e))),
    };

    invoke_ingest_with(config, store.as_ref(), &provider, &request).await
}

pub async fn invoke_ingest_with(
    config: &Config,
    store: &dyn BatchStore,
    provider: &dyn SearchProvider,
    request: &IngestRequest,
) -> Invocation {
    match run_ingest(config, store, provider, request, Utc::now()).await {
        Ok(outcome) => Invocation::ok(ingest_body(&outcome)),
        Err(e) => {
            tracing::error!(individual = %request.individual, error = %e, "search failed");
            Invocation::from_error(&e)
        }
    }
}

fn ingest_body(outcome: &IngestOutcome) -> Value {
    let message = if outcome.key.is_some() {
        "Search completed and data saved."
    } else {
        "Search completed with no results."
    };
    json!({
        "message": message,
        "processed_count": outcome.processed_count,
        "query": outcome.query,
        "key": outcome.key,
    })
}
