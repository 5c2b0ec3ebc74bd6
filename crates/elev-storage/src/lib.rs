//! Content-addressed artifact storage, retry policy, and the relational cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod db;
mod enrichment;
pub mod repository;

pub use enrichment::{ArtifactDisposition, ElevationView, ErrorLogEntry, NewErrorLog};
pub use repository::{EntityRepository, RepositoryError, SyncRunRecord};

pub const CRATE_NAME: &str = "elev-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Artifact blobs keyed by the SHA-256 of their bytes.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub const EXTENSION: &'static str = "sqlite";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `ab/abcdef....sqlite`: two-character fan-out keeps directories small.
    pub fn artifact_relative_path(content_hash: &str) -> PathBuf {
        let fan = content_hash.get(..2).unwrap_or("xx");
        PathBuf::from(fan).join(format!("{content_hash}.{}", Self::EXTENSION))
    }

    pub fn path_for(&self, content_hash: &str) -> PathBuf {
        self.root.join(Self::artifact_relative_path(content_hash))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(&self, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::artifact_relative_path(&content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Copy an operator-supplied file into the store.
    pub async fn store_file(&self, source: &Path) -> anyhow::Result<StoredArtifact> {
        let bytes = fs::read(source)
            .await
            .with_context(|| format!("reading artifact file {}", source.display()))?;
        self.store_bytes(&bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl From<elev_core::ErrorClass> for RetryDisposition {
    fn from(class: elev_core::ErrorClass) -> Self {
        if class.is_retryable() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            ArtifactStore::artifact_relative_path(&hash),
            PathBuf::from("b9").join(format!("{hash}.sqlite"))
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store.store_bytes(b"SQLite format 3\0same").await.expect("first store");
        let second = store.store_bytes(b"SQLite format 3\0same").await.expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert_eq!(first.absolute_path, store.path_for(&first.content_hash));
    }

    #[tokio::test]
    async fn imported_files_land_at_their_hash() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("upload.bin");
        std::fs::write(&src, b"operator bytes").unwrap();
        let store = ArtifactStore::new(dir.path().join("store"));
        let stored = store.store_file(&src).await.unwrap();
        assert_eq!(stored.absolute_path, store.path_for(&stored.content_hash));
        assert_eq!(stored.byte_size, 14);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn retry_disposition_follows_error_class() {
        use elev_core::ErrorClass;
        assert_eq!(RetryDisposition::from(ErrorClass::Transient), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::from(ErrorClass::Persistence), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::from(ErrorClass::Validation), RetryDisposition::NonRetryable);
        assert_eq!(
            RetryDisposition::from(ErrorClass::ContextConflict),
            RetryDisposition::NonRetryable
        );
    }
}
