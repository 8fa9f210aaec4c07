//! Extracted-transcript content store.
//!
//! Flat directory of UTF-8 text files keyed by
//! `sha256(transcript_id|source_url)`, so a re-fetch of the same unit of work
//! lands on the same path and the analysis worker can prefer the cache over
//! a re-download.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ContentStore { dir: dir.into() }
    }

    /// Content key for one `(transcript, url)` unit.
    pub fn key(transcript_id: i64, source_url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{transcript_id}|{source_url}").as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, transcript_id: i64, source_url: &str) -> PathBuf {
        self.dir
            .join(format!("{}.txt", Self::key(transcript_id, source_url)))
    }

    /// Read a cached extraction; `None` when absent.
    pub async fn load(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("content read failed: {}", path.display())),
        }
    }

    /// Persist an extraction and return its path.
    pub async fn store(
        &self,
        transcript_id: i64,
        source_url: &str,
        text: &str,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("content dir create failed: {}", self.dir.display()))?;
        let path = self.path_for(transcript_id, source_url);
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("content write failed: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_distinct() {
        let a = ContentStore::key(1, "https://host/a");
        let b = ContentStore::key(1, "https://host/a");
        let c = ContentStore::key(1, "https://host/b");
        let d = ContentStore::key(2, "https://host/a");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn store_then_load_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ContentStore::new(dir.path());

        let path = store.store(7, "https://host/a", "call text").await?;
        assert_eq!(store.load(&path).await?.as_deref(), Some("call text"));

        let missing = store.path_for(8, "https://host/z");
        assert_eq!(store.load(&missing).await?, None);
        Ok(())
    }
}
