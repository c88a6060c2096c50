//! URL-keyed merge of batch records into the article table.
//!
//! A URL is one article no matter how often or under which search it is
//! seen. Re-sightings update the mutable fields and accumulate the mention
//! and keyword sets:
//!
//! | Field | On re-sighting |
//! |-------|----------------|
//! | `content`, `score`, `source`, `searched_at` | replaced, if the sighting is not older than the stored one |
//! | `individuals_mentioned`, `keywords_used` | set union |
//! | `title`, `published_date` | kept from the first sighting |
//!
//! Ordering the overwrite by `searched_at` makes replaying old batches
//! harmless: union and "newest wins" are both idempotent and commutative.

use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;

use crate::db::TableName;
use crate::error::{FileError, RecordError};
use crate::models::{
    format_db_timestamp, parse_db_timestamp, parse_timestamp, ArticleRecord, BatchItem,
};

/// A validated batch record, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub source: Option<String>,
    pub score: Option<f64>,
    pub published_date: NaiveDateTime,
    pub searched_at: NaiveDateTime,
    pub individuals: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
}

impl Sighting {
    /// Validate one batch item.
    ///
    /// `default_individual` seeds the mention set when the item carries none
    /// (older batch files wrote `null`).
    pub fn from_item(item: BatchItem, default_individual: &str) -> Result<Self, RecordError> {
        let url = item
            .url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or(RecordError::MissingUrl)?;

        let searched_at = item
            .searched_at
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| RecordError::SearchedAt(item.searched_at.clone()))?
            .naive_utc();

        let mut individuals: BTreeSet<String> = item
            .individuals_mentioned
            .unwrap_or_default()
            .into_iter()
            .filter(|i| !i.is_empty())
            .collect();
        if individuals.is_empty() {
            if default_individual.is_empty() {
                return Err(RecordError::NoIndividual);
            }
            individuals.insert(default_individual.to_string());
        }

        let keywords = item
            .keywords_used
            .unwrap_or_default()
            .into_iter()
            .filter(|k| !k.is_empty())
            .collect();

        Ok(Self {
            source: extract_domain(&url),
            published_date: resolve_published_date(item.published_date.as_deref(), searched_at),
            title: item.title.unwrap_or_default(),
            content: item.content,
            score: item.score,
            url,
            searched_at,
            individuals,
            keywords,
        })
    }
}

/// Host of `url`, lowercased, without a leading `www.`.
///
/// Malformed URLs and URLs without a host give `None`.
pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Provider publish time, or the sighting time when it is absent or unparsable.
pub fn resolve_published_date(raw: Option<&str>, searched_at: NaiveDateTime) -> NaiveDateTime {
    match raw.map(|s| (s, parse_timestamp(s))) {
        Some((_, Some(dt))) => dt.naive_utc(),
        Some((s, None)) => {
            tracing::debug!(published_date = %s, "unparsable published_date, using searched_at");
            searched_at
        }
        None => searched_at,
    }
}

/// Split a batch file body into its records.
///
/// A top-level array is the normal shape; a single object is accepted as a
/// one-record batch.
pub fn split_batch(body: &[u8]) -> Result<Vec<Value>, FileError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Array(records) => Ok(records),
        obj @ Value::Object(_) => Ok(vec![obj]),
        _ => Err(FileError::Shape),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
}

/// Counts for one batch file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMergeStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl BatchMergeStats {
    pub fn merged(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Sole writer of the article table.
pub struct RecordMerger {
    table: TableName,
}

impl RecordMerger {
    pub fn new(table: TableName) -> Self {
        Self { table }
    }

    /// Merge every record of one batch file on `conn`.
    ///
    /// Records that fail validation are logged and skipped. Database errors
    /// abort the batch so the caller can roll the file back as a unit.
    pub async fn merge_batch(
        &self,
        conn: &mut SqliteConnection,
        batch_key: &str,
        records: Vec<Value>,
        default_individual: &str,
    ) -> Result<BatchMergeStats, sqlx::Error> {
        let mut stats = BatchMergeStats::default();

        for (index, raw) in records.into_iter().enumerate() {
            let sighting = serde_json::from_value::<BatchItem>(raw)
                .map_err(RecordError::from)
                .and_then(|item| Sighting::from_item(item, default_individual));

            let sighting = match sighting {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(key = %batch_key, index, error = %e, "skipping malformed record");
                    stats.skipped += 1;
                    continue;
                }
            };

            match self.merge(conn, &sighting).await? {
                MergeOutcome::Inserted => stats.inserted += 1,
                MergeOutcome::Updated => stats.updated += 1,
            }
        }

        Ok(stats)
    }

    /// Insert or merge one sighting.
    pub async fn merge(
        &self,
        conn: &mut SqliteConnection,
        s: &Sighting,
    ) -> Result<MergeOutcome, sqlx::Error> {
        let table = &self.table;

        let existing = sqlx::query(&format!(
            "SELECT id, searched_at, individuals_mentioned, keywords_used FROM {table} WHERE url = ?"
        ))
        .bind(&s.url)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = existing else {
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (
                    url, title, content, source, score, published_date, searched_at,
                    individuals_mentioned, keywords_used
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#
            ))
            .bind(&s.url)
            .bind(&s.title)
            .bind(&s.content)
            .bind(&s.source)
            .bind(s.score)
            .bind(format_db_timestamp(s.published_date))
            .bind(format_db_timestamp(s.searched_at))
            .bind(encode_set(&s.individuals))
            .bind(encode_set(&s.keywords))
            .execute(&mut *conn)
            .await?;
            return Ok(MergeOutcome::Inserted);
        };

        let id: i64 = row.try_get("id")?;
        let stored_at: Option<String> = row.try_get("searched_at")?;
        let mut individuals = decode_set(row.try_get("individuals_mentioned")?)?;
        let mut keywords = decode_set(row.try_get("keywords_used")?)?;
        individuals.extend(s.individuals.iter().cloned());
        keywords.extend(s.keywords.iter().cloned());

        let is_newer = stored_at
            .as_deref()
            .and_then(parse_db_timestamp)
            .map_or(true, |stored| s.searched_at >= stored);

        if is_newer {
            sqlx::query(&format!(
                r#"
                UPDATE {table} SET
                    content = ?,
                    score = ?,
                    source = ?,
                    searched_at = ?,
                    published_date = COALESCE(published_date, ?),
                    individuals_mentioned = ?,
                    keywords_used = ?
                WHERE id = ?
                "#
            ))
            .bind(&s.content)
            .bind(s.score)
            .bind(&s.source)
            .bind(format_db_timestamp(s.searched_at))
            .bind(format_db_timestamp(s.published_date))
            .bind(encode_set(&individuals))
            .bind(encode_set(&keywords))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query(&format!(
                r#"
                UPDATE {table} SET
                    published_date = COALESCE(published_date, ?),
                    individuals_mentioned = ?,
                    keywords_used = ?
                WHERE id = ?
                "#
            ))
            .bind(format_db_timestamp(s.published_date))
            .bind(encode_set(&individuals))
            .bind(encode_set(&keywords))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }

        Ok(MergeOutcome::Updated)
    }
}

/// Load one article by URL.
pub async fn fetch_article(
    conn: &mut SqliteConnection,
    table: &TableName,
    url: &str,
) -> Result<Option<ArticleRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT id, url, title, content, source, score, published_date, searched_at,
               individuals_mentioned, keywords_used
        FROM {table} WHERE url = ?
        "#
    ))
    .bind(url)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let published: Option<String> = row.try_get("published_date")?;
    let searched: Option<String> = row.try_get("searched_at")?;

    Ok(Some(ArticleRecord {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        source: row.try_get("source")?,
        score: row.try_get("score")?,
        published_date: published.as_deref().and_then(parse_db_timestamp),
        searched_at: searched.as_deref().and_then(parse_db_timestamp),
        individuals_mentioned: decode_set(row.try_get("individuals_mentioned")?)?,
        keywords_used: decode_set(row.try_get("keywords_used")?)?,
    }))
}

/// Sets are stored as sorted JSON arrays so equal sets store identically.
fn encode_set(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

/// A stored set that is not a JSON string array is an error: writing the
/// union back would replace it with only the incoming members.
fn decode_set(raw: Option<String>) -> Result<BTreeSet<String>, sqlx::Error> {
    let Some(raw) = raw else {
        return Ok(BTreeSet::new());
    };
    let members: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(members.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://News24.com/a").as_deref(), Some("news24.com"));
        assert_eq!(
            extract_domain("https://www.dailymaverick.co.za/article/x?y=1").as_deref(),
            Some("dailymaverick.co.za")
        );
        assert_eq!(extract_domain("http://mg.co.za:8080/x").as_deref(), Some("mg.co.za"));
        assert_eq!(extract_domain("not a url"), None);
        assert_eq!(extract_domain("mailto:someone@example.com"), None);
    }

    #[test]
    fn test_published_date_falls_back_to_searched_at() {
        let searched = at(2024, 1, 1, 0);
        assert_eq!(resolve_published_date(None, searched), searched);
        assert_eq!(resolve_published_date(Some("last tuesday"), searched), searched);
        assert_eq!(
            resolve_published_date(Some("2023-12-30T08:00:00Z"), searched),
            at(2023, 12, 30, 8)
        );
    }

    #[test]
    fn test_sighting_from_item() {
        let item: BatchItem = serde_json::from_value(json!({
            "url": "https://www.IOL.co.za/news/1",
            "title": "Headline",
            "content": "Body",
            "source": "ignored",
            "published_date": null,
            "searched_at": "2024-01-01T00:00:00Z",
            "individuals_mentioned": ["A"],
            "keywords_used": ["fraud", "graft", "fraud"],
            "score": 0.7
        }))
        .unwrap();

        let s = Sighting::from_item(item, "fallback").unwrap();
        assert_eq!(s.source.as_deref(), Some("iol.co.za"));
        assert_eq!(s.published_date, at(2024, 1, 1, 0));
        assert_eq!(s.individuals, BTreeSet::from(["A".to_string()]));
        assert_eq!(s.keywords.len(), 2);
    }

    #[test]
    fn test_sighting_requires_url_and_searched_at() {
        let no_url = BatchItem {
            searched_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(matches!(
            Sighting::from_item(no_url, "A"),
            Err(RecordError::MissingUrl)
        ));

        let bad_time = BatchItem {
            url: Some("https://news24.com/x".into()),
            searched_at: Some("soon".into()),
            ..Default::default()
        };
        assert!(matches!(
            Sighting::from_item(bad_time, "A"),
            Err(RecordError::SearchedAt(Some(_)))
        ));
    }

    #[test]
    fn test_null_mentions_use_default_individual() {
        let item = BatchItem {
            url: Some("https://news24.com/x".into()),
            searched_at: Some("2024-01-01T00:00:00Z".into()),
            individuals_mentioned: None,
            ..Default::default()
        };
        let s = Sighting::from_item(item, "Jacob Zuma").unwrap();
        assert_eq!(s.individuals, BTreeSet::from(["Jacob Zuma".to_string()]));
        assert_eq!(s.title, "");
    }

    #[test]
    fn test_split_batch_shapes() {
        assert_eq!(split_batch(br#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(split_batch(br#"{"url":"x"}"#).unwrap().len(), 1);
        assert!(matches!(split_batch(b"42"), Err(FileError::Shape)));
        assert!(matches!(split_batch(b"[{"), Err(FileError::Parse(_))));
    }

    #[test]
    fn test_set_encoding_is_canonical() {
        let a: BTreeSet<String> = ["b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(encode_set(&a), r#"["a","b"]"#);
        assert_eq!(decode_set(Some(r#"["b","a","a"]"#.into())).unwrap(), a);
        assert!(decode_set(None).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_stored_set_is_an_error() {
        assert!(matches!(
            decode_set(Some(r#"{"Old Person"}"#.into())),
            Err(sqlx::Error::Decode(_))
        ));
        assert!(decode_set(Some("[1, 2]".into())).is_err());
    }
}
