//! The per-build file-hash memo.
//!
//! Hashes are SHA-256 over file bytes. The memo is append-only within a
//! build: many workers may request the same path concurrently, and the
//! per-path cell guarantees the file is read and hashed at most once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

type HashCell = Arc<OnceCell<Option<String>>>;

#[derive(Default)]
pub struct FileHashes {
    cells: Mutex<HashMap<Utf8PathBuf, HashCell>>,
}

impl FileHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The content hash of `path`, or `None` if the file is unreadable.
    /// Failures are memoized too so a bad path is only probed once.
    pub async fn hash(&self, path: &Utf8Path) -> Option<String> {
        let cell = {
            let mut cells = self.cells.lock().expect("file hash memo poisoned");
            cells.entry(path.to_owned()).or_default().clone()
        };
        cell.get_or_init(|| hash_file(path.to_owned())).await.clone()
    }

    /// Drops every memoized hash. Called at the transition from the
    /// incremental check to execution, when tasks start rewriting outputs.
    pub fn clear(&self) {
        self.cells.lock().expect("file hash memo poisoned").clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cells.lock().expect("file hash memo poisoned").len()
    }
}

async fn hash_file(path: Utf8PathBuf) -> Option<String> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            Some(hex::encode(hasher.finalize()))
        }
        Err(err) => {
            debug!("unable to hash {path}: {err}");
            None
        }
    }
}

/// SHA-256 over an already-assembled string, hex encoded. Used for the
/// environment fingerprint.
pub(crate) fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[tokio::test]
    async fn test_hash_is_memoized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().join("a.txt")).expect("utf8");
        std::fs::write(&path, "hello")?;

        let hashes = FileHashes::new();
        let first = hashes.hash(&path).await.expect("file is readable");

        // Rewrite the file; the memo must still serve the original hash.
        std::fs::write(&path, "changed")?;
        let second = hashes.hash(&path).await.expect("memoized");
        assert_eq!(first, second);

        hashes.clear();
        let third = hashes.hash(&path).await.expect("re-read after clear");
        assert_ne!(first, third);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_file_is_memoized_as_none() {
        let hashes = FileHashes::new();
        let missing = Utf8Path::new("/definitely/not/here.txt");
        assert_eq!(hashes.hash(missing).await, None);
        assert_eq!(hashes.hash(missing).await, None);
        assert_eq!(hashes.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().join("big.txt")).expect("utf8");
        std::fs::write(&path, "payload")?;

        let hashes = std::sync::Arc::new(FileHashes::new());
        let mut joins = Vec::new();
        for _ in 0..8 {
            let hashes = hashes.clone();
            let path = path.clone();
            joins.push(tokio::spawn(async move { hashes.hash(&path).await }));
        }
        let mut results = Vec::new();
        for join in joins {
            results.push(join.await?);
        }
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(hashes.len(), 1);
        Ok(())
    }
}
