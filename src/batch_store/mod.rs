//! Batch file storage.
//!
//! The [`BatchStore`] trait is the whole contract the loader has with the
//! object store: list keys page by page, read one object, write one object.
//! The search stage writes; the load stage only lists and reads.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`s3::S3BatchStore`] | S3 or an S3-compatible endpoint (MinIO, LocalStack) |
//! | [`fs::FsBatchStore`] | a local directory mirroring the key layout |
//! | [`memory::MemoryBatchStore`] | tests |

pub mod fs;
pub mod memory;
pub mod s3;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{StoreConfig, StoreKind};

/// One page of a key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in ascending byte order.
    pub keys: Vec<String>,
    /// Present when more keys follow; pass it back to fetch the next page.
    pub next_token: Option<String>,
}

/// Append-only store of batch files.
///
/// Listings return keys in ascending lexicographic (byte) order, restricted
/// to `prefix` and strictly greater than `start_after` when given.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Human-readable location, for logs (e.g. `s3://bucket`).
    fn describe(&self) -> String;

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage>;

    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    async fn write(&self, key: &str, body: &[u8]) -> Result<()>;
}

/// Build the store described by `[store]`.
///
/// Fails when the backend cannot be used at all, e.g. S3 credentials are
/// missing from the environment.
pub fn from_config(config: &StoreConfig) -> Result<Box<dyn BatchStore>> {
    match config.kind {
        StoreKind::S3 => {
            let store = s3::S3BatchStore::from_env(config.clone())
                .context("cannot configure S3 batch store")?;
            Ok(Box::new(store))
        }
        StoreKind::Fs => {
            let root = config
                .root
                .clone()
                .context("store.root must be set when store.kind is 'fs'")?;
            Ok(Box::new(fs::FsBatchStore::new(root, config.page_size)))
        }
    }
}

/// Slice a sorted key list into one page. Shared by the local backends,
/// which use the last key of a page as the continuation token.
pub(crate) fn page_from_sorted<'a, I>(
    keys: I,
    prefix: &str,
    start_after: Option<&str>,
    continuation: Option<&str>,
    page_size: usize,
) -> ListPage
where
    I: IntoIterator<Item = &'a String>,
{
    let floor = match (start_after, continuation) {
        (Some(a), Some(c)) => Some(a.max(c)),
        (a, c) => a.or(c),
    };

    let mut selected: Vec<String> = keys
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .filter(|k| floor.map_or(true, |f| k.as_str() > f))
        .take(page_size.max(1) + 1)
        .cloned()
        .collect();

    let next_token = if selected.len() > page_size.max(1) {
        selected.truncate(page_size.max(1));
        selected.last().cloned()
    } else {
        None
    };

    ListPage {
        keys: selected,
        next_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        ["a/1", "a/2", "a/3", "b/1"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_page_respects_prefix_and_start_after() {
        let all = keys();
        let page = page_from_sorted(&all, "a/", Some("a/1"), None, 10);
        assert_eq!(page.keys, vec!["a/2", "a/3"]);
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn test_page_token_chains() {
        let all = keys();
        let first = page_from_sorted(&all, "a/", None, None, 2);
        assert_eq!(first.keys, vec!["a/1", "a/2"]);
        assert_eq!(first.next_token.as_deref(), Some("a/2"));

        let second = page_from_sorted(&all, "a/", None, first.next_token.as_deref(), 2);
        assert_eq!(second.keys, vec!["a/3"]);
        assert_eq!(second.next_token, None);
    }
}
