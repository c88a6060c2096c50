//! In-memory [`BatchStore`] for tests.
//!
//! Keys live in a `BTreeMap` behind a `RwLock`, so listings come out sorted
//! the same way S3 returns them. The page size is configurable to exercise
//! pagination, and list calls are counted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{page_from_sorted, BatchStore, ListPage};

pub struct MemoryBatchStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    page_size: usize,
    list_calls: AtomicUsize,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap()
            .insert(key.into(), body.into());
    }

    /// Number of `list_page` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }
}

impl Default for MemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read().unwrap();
        Ok(page_from_sorted(
            objects.keys(),
            prefix,
            start_after,
            continuation,
            self.page_size,
        ))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such key: {}", key))
    }

    async fn write(&self, key: &str, body: &[u8]) -> Result<()> {
        self.insert(key, body.to_vec());
        Ok(())
    }
}
