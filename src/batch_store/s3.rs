//! Amazon S3 [`BatchStore`].
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication.
//! Listing uses `ListObjectsV2` with `start-after` and continuation tokens;
//! reads and writes are plain `GetObject` / `PutObject`.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for signing.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! kind = "s3"
//! bucket = "press-batches"
//! region = "af-south-1"
//! prefix = "search_results"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style addressing
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{BatchStore, ListPage};
use crate::config::StoreConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct S3BatchStore {
    config: StoreConfig,
    bucket: String,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BatchStore {
    /// Build a store with credentials taken from the environment.
    pub fn from_env(config: StoreConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        Self::new(config, creds)
    }

    fn new(config: StoreConfig, creds: AwsCredentials) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .context("store.bucket must be set for the S3 batch store")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            bucket,
            creds,
            client,
        })
    }

    /// Send a SigV4-signed request and return the successful response.
    async fn send_signed(
        &self,
        method: reqwest::Method,
        key: Option<&str>,
        query_params: &[(String, String)],
        body: &[u8],
    ) -> Result<reqwest::Response> {
        let endpoint = Endpoint::for_config(&self.config, &self.bucket);
        let canonical_uri = endpoint.canonical_uri(key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical query string must be sorted
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort();
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(body);

        let mut headers = vec![
            ("host".to_string(), endpoint.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", endpoint.scheme, endpoint.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);

        if let Some(ref token) = self.creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req_builder = req_builder
                .header("Content-Type", "application/json")
                .body(body.to_vec());
        }

        let resp = req_builder
            .send()
            .await
            .map_err(|e| anyhow!("S3 {} s3://{}/{} failed: {}", method, self.bucket, key.unwrap_or(""), e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 {} failed (HTTP {}) for s3://{}/{}: {}",
                method,
                status,
                self.bucket,
                key.unwrap_or(""),
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(resp)
    }
}

#[async_trait]
impl BatchStore for S3BatchStore {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        let mut query_params = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), self.config.page_size.to_string()),
        ];
        if !prefix.is_empty() {
            query_params.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(after) = start_after {
            query_params.push(("start-after".to_string(), after.to_string()));
        }
        if let Some(token) = continuation {
            query_params.push(("continuation-token".to_string(), token.to_string()));
        }

        let resp = self
            .send_signed(reqwest::Method::GET, None, &query_params, b"")
            .await?;
        let xml_body = resp.text().await?;
        let (keys, is_truncated, next_token) = parse_list_objects_response(&xml_body)?;

        Ok(ListPage {
            keys,
            next_token: if is_truncated { next_token } else { None },
        })
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .send_signed(reqwest::Method::GET, Some(key), &[], b"")
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write(&self, key: &str, body: &[u8]) -> Result<()> {
        self.send_signed(reqwest::Method::PUT, Some(key), &[], body)
            .await?;
        Ok(())
    }
}

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Addressing ============

/// Where requests go and how the canonical URI is built.
///
/// AWS uses virtual-hosted addressing (`<bucket>.s3.<region>.amazonaws.com`);
/// custom endpoints use path-style addressing (`<endpoint>/<bucket>/<key>`).
#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    scheme: String,
    host: String,
    path_style_bucket: Option<String>,
}

impl Endpoint {
    fn for_config(config: &StoreConfig, bucket: &str) -> Self {
        match config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                Self {
                    scheme: scheme.to_string(),
                    host,
                    path_style_bucket: Some(bucket.to_string()),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", bucket, config.region),
                path_style_bucket: None,
            },
        }
    }

    fn canonical_uri(&self, key: Option<&str>) -> String {
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        match (&self.path_style_bucket, key) {
            (Some(bucket), Some(_)) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            (Some(bucket), None) => format!("/{}", uri_encode(bucket)),
            (None, _) => format!("/{}", encoded_key),
        }
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986; everything but `A-Z a-z 0-9 - _ . ~` is escaped.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

#[derive(Clone, Copy)]
enum ListField {
    Key,
    IsTruncated,
    NextContinuationToken,
}

/// Parse a `ListObjectsV2` response into keys, the truncation flag and the
/// next continuation token. "Directory" placeholder keys are dropped.
fn parse_list_objects_response(xml: &str) -> Result<(Vec<String>, bool, Option<String>)> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut keys = Vec::new();
    let mut is_truncated = false;
    let mut next_token = None;

    let mut in_contents = false;
    let mut field: Option<ListField> = None;
    let mut text = String::new();

    loop {
        match reader.read_event().context("malformed ListObjectsV2 response")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Contents" => in_contents = true,
                b"Key" if in_contents => field = Some(ListField::Key),
                b"IsTruncated" => field = Some(ListField::IsTruncated),
                b"NextContinuationToken" => field = Some(ListField::NextContinuationToken),
                _ => {}
            },
            Event::Text(t) if field.is_some() => {
                text.push_str(&t.unescape().context("bad entity in ListObjectsV2 response")?);
            }
            Event::CData(c) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"Contents" {
                    in_contents = false;
                }
                if let Some(done) = field.take() {
                    let value = std::mem::take(&mut text);
                    match done {
                        ListField::Key => {
                            if !value.is_empty() && !value.ends_with('/') {
                                keys.push(value);
                            }
                        }
                        ListField::IsTruncated => is_truncated = value.trim() == "true",
                        ListField::NextContinuationToken => {
                            if !value.is_empty() {
                                next_token = Some(value);
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((keys, is_truncated, next_token))
}
