//! Lazy enumeration of batch keys after a watermark.
//!
//! [`BatchSelector`] walks one individual's key directory in ascending order,
//! fetching listing pages only when the previous page is used up. Because
//! batch keys embed fixed-width dates, ascending key order is chronological
//! order, so "after the watermark" is a plain string comparison.

use anyhow::Result;
use chrono::NaiveDate;
use std::collections::VecDeque;

use crate::batch_store::BatchStore;
use crate::models::{key_root, path_segment, BatchKey};

pub struct BatchSelector<'a> {
    store: &'a dyn BatchStore,
    /// `{prefix}/{individual}/`; every candidate starts with this.
    root: String,
    /// Keys must sort strictly after this.
    boundary: String,
    /// Directory of the watermark date; everything inside it was loaded.
    loaded_dir: Option<String>,
    /// Last key handed out, so the walk can be resumed.
    cursor: Option<String>,
    buffer: VecDeque<String>,
    next_token: Option<String>,
    exhausted: bool,
}

impl<'a> BatchSelector<'a> {
    /// Select batches for `individual` dated after `watermark`.
    ///
    /// With no watermark the boundary is the individual's directory itself
    /// and every batch is selected.
    pub fn new(
        store: &'a dyn BatchStore,
        prefix: &str,
        individual: &str,
        watermark: Option<NaiveDate>,
    ) -> Self {
        let root = key_root(prefix, &path_segment(individual));
        let loaded_dir = watermark.map(|d| format!("{}{}/", root, d.format("%Y%m%d")));
        let boundary = loaded_dir.clone().unwrap_or_else(|| root.clone());

        Self {
            store,
            root,
            boundary,
            loaded_dir,
            cursor: None,
            buffer: VecDeque::new(),
            next_token: None,
            exhausted: false,
        }
    }

    /// Select batches for `individual` dated on or after `first_date`.
    ///
    /// The directory of `first_date` itself is listed, so a batch written
    /// later on an already-loaded day is still found.
    pub fn from_date(
        store: &'a dyn BatchStore,
        prefix: &str,
        individual: &str,
        first_date: Option<NaiveDate>,
    ) -> Self {
        Self::new(store, prefix, individual, first_date.and_then(|d| d.pred_opt()))
    }

    /// Continue a previous walk after `key` instead of from the boundary.
    pub fn resume_after(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if key > self.boundary {
            self.cursor = Some(key);
        }
        self.buffer.clear();
        self.next_token = None;
        self.exhausted = false;
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn last_key(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Next batch key, or `None` once the listing is exhausted.
    pub async fn next_key(&mut self) -> Result<Option<String>> {
        loop {
            while let Some(key) = self.buffer.pop_front() {
                if !self.admits(&key) {
                    continue;
                }
                if BatchKey::parse(&key).is_none() {
                    tracing::warn!(key = %key, "skipping key outside the batch key layout");
                    continue;
                }
                self.cursor = Some(key.clone());
                return Ok(Some(key));
            }

            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Drain the remaining keys. Mostly for dry runs and tests.
    pub async fn collect_all(&mut self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(key) = self.next_key().await? {
            keys.push(key);
        }
        Ok(keys)
    }

    fn admits(&self, key: &str) -> bool {
        if key <= self.boundary.as_str() || !key.starts_with(&self.root) {
            return false;
        }
        if let Some(ref dir) = self.loaded_dir {
            if key.starts_with(dir.as_str()) {
                return false;
            }
        }
        match self.cursor {
            Some(ref c) => key > c.as_str(),
            None => true,
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let start_after = match self.cursor {
            Some(ref c) => c.clone(),
            None => self.boundary.clone(),
        };
        let page = self
            .store
            .list_page(&self.root, Some(&start_after), self.next_token.as_deref())
            .await?;

        tracing::debug!(
            root = %self.root,
            start_after = %start_after,
            keys = page.keys.len(),
            more = page.next_token.is_some(),
            "listed batch page"
        );

        self.buffer.extend(page.keys);
        self.next_token = page.next_token;
        if self.next_token.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_store::memory::MemoryBatchStore;

    fn store_with(keys: &[&str], page_size: usize) -> MemoryBatchStore {
        let store = MemoryBatchStore::with_page_size(page_size);
        for k in keys {
            store.insert(*k, b"[]".to_vec());
        }
        store
    }

    const KEYS: [&str; 3] = [
        "p/ind/20240101/20240101_080000.json",
        "p/ind/20240102/20240102_080000.json",
        "p/ind/20240103/20240103_080000.json",
    ];

    #[tokio::test]
    async fn test_watermark_selects_strictly_later_dates() {
        let store = store_with(&KEYS, 1000);
        let mut selector = BatchSelector::new(
            &store,
            "p",
            "ind",
            Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
        );
        assert_eq!(selector.boundary(), "p/ind/20240102/");
        assert_eq!(
            selector.collect_all().await.unwrap(),
            vec!["p/ind/20240103/20240103_080000.json"]
        );
    }

    #[tokio::test]
    async fn test_from_date_includes_that_days_directory() {
        let mut keys = KEYS.to_vec();
        keys.push("p/ind/20240102/20240102_160000.json");
        let store = store_with(&keys, 1000);

        let mut selector = BatchSelector::from_date(
            &store,
            "p",
            "ind",
            Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
        );
        assert_eq!(selector.boundary(), "p/ind/20240101/");
        assert_eq!(
            selector.collect_all().await.unwrap(),
            vec![
                "p/ind/20240102/20240102_080000.json",
                "p/ind/20240102/20240102_160000.json",
                "p/ind/20240103/20240103_080000.json",
            ]
        );
    }

    #[tokio::test]
    async fn test_no_watermark_selects_everything_for_individual() {
        let mut keys = KEYS.to_vec();
        keys.push("p/other/20240101/20240101_080000.json");
        keys.push("p/ind_extra/20240101/20240101_080000.json");
        let store = store_with(&keys, 1000);

        let mut selector = BatchSelector::new(&store, "p", "ind", None);
        assert_eq!(selector.boundary(), "p/ind/");
        assert_eq!(selector.collect_all().await.unwrap(), KEYS.to_vec());
    }

    #[tokio::test]
    async fn test_pagination_is_transparent_and_lazy() {
        let store = store_with(&KEYS, 1);
        let mut selector = BatchSelector::new(&store, "p", "ind", None);

        assert_eq!(selector.next_key().await.unwrap().as_deref(), Some(KEYS[0]));
        let calls_after_first = store.list_calls();
        assert_eq!(calls_after_first, 1);

        let rest = selector.collect_all().await.unwrap();
        assert_eq!(rest, vec![KEYS[1], KEYS[2]]);
        assert!(store.list_calls() > calls_after_first);
    }

    #[tokio::test]
    async fn test_resume_after_restarts_from_key() {
        let store = store_with(&KEYS, 2);
        let mut first = BatchSelector::new(&store, "p", "ind", None);
        let k0 = first.next_key().await.unwrap().unwrap();
        assert_eq!(first.last_key(), Some(k0.as_str()));

        let mut resumed = BatchSelector::new(&store, "p", "ind", None).resume_after(k0);
        assert_eq!(
            resumed.collect_all().await.unwrap(),
            vec![KEYS[1], KEYS[2]]
        );
    }

    #[tokio::test]
    async fn test_skips_keys_outside_layout() {
        let store = store_with(
            &[
                "p/ind/20240104/notes.txt",
                "p/ind/20240104/20240104_000000.json",
                "p/ind/legacy.json",
            ],
            1000,
        );
        let mut selector = BatchSelector::new(
            &store,
            "p",
            "ind",
            Some(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()),
        );
        assert_eq!(
            selector.collect_all().await.unwrap(),
            vec!["p/ind/20240104/20240104_000000.json"]
        );
    }

    #[tokio::test]
    async fn test_individual_with_spaces_uses_path_segment() {
        let store = store_with(&["p/Jacob_Zuma/20240101/20240101_000000.json"], 1000);
        let mut selector = BatchSelector::new(&store, "p", "Jacob Zuma", None);
        assert_eq!(selector.collect_all().await.unwrap().len(), 1);
    }
}
