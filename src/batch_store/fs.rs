//! Local directory [`BatchStore`].
//!
//! Object keys map onto relative paths under `root` (`/` separated). Useful
//! for development and for replaying a bucket that was synced to disk.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{page_from_sorted, BatchStore, ListPage};

pub struct FsBatchStore {
    root: PathBuf,
    page_size: usize,
}

impl FsBatchStore {
    pub fn new(root: PathBuf, page_size: usize) -> Self {
        Self {
            root,
            page_size: page_size.max(1),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            bail!("invalid batch key for filesystem store: '{}'", key);
        }
        Ok(self.root.join(relative))
    }

    /// All keys under the directory part of `prefix`, sorted.
    fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        // Only walk the deepest directory the prefix names.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&start) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root)?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // In-flight writes
            if key.ends_with(".partial") {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl BatchStore for FsBatchStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        let keys = self.scan(prefix)?;
        Ok(page_from_sorted(
            &keys,
            prefix,
            start_after,
            continuation,
            self.page_size,
        ))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn write(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            bail!("batch file already exists: {}", key);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so listings never see a half-written file.
        let tmp = path.with_extension("json.partial");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_list_and_read() {
        let tmp = TempDir::new().unwrap();
        let store = FsBatchStore::new(tmp.path().to_path_buf(), 1000);

        store
            .write("p/Ann/20240102/20240102_000000.json", b"[]")
            .await
            .unwrap();
        store
            .write("p/Ann/20240101/20240101_000000.json", b"[1]")
            .await
            .unwrap();
        store
            .write("p/Bob/20240101/20240101_000000.json", b"[2]")
            .await
            .unwrap();

        let page = store.list_page("p/Ann/", None, None).await.unwrap();
        assert_eq!(
            page.keys,
            vec![
                "p/Ann/20240101/20240101_000000.json",
                "p/Ann/20240102/20240102_000000.json"
            ]
        );
        assert_eq!(
            store
                .read("p/Ann/20240101/20240101_000000.json")
                .await
                .unwrap(),
            b"[1]"
        );
    }

    #[tokio::test]
    async fn test_batch_files_are_write_once() {
        let tmp = TempDir::new().unwrap();
        let store = FsBatchStore::new(tmp.path().to_path_buf(), 1000);
        store.write("p/A/x.json", b"[]").await.unwrap();
        assert!(store.write("p/A/x.json", b"[1]").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FsBatchStore::new(tmp.path().to_path_buf(), 1000);
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.write("/abs.json", b"[]").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_prefix_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = FsBatchStore::new(tmp.path().to_path_buf(), 1000);
        let page = store.list_page("p/Nobody/", None, None).await.unwrap();
        assert!(page.keys.is_empty());
    }
}
