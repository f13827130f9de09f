//! Blob bucket adapter
//!
//! The bucket is an external key-value service holding full step definitions
//! (`step/<id>`) and inter-step payloads (`step-data/<id>`). The hub only
//! needs get/put/delete; backends plug in behind the [`Bucket`] trait.

use crate::error::{HubError, Result};
use crate::models::StepDefinition;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// Bucket key for a step definition.
pub fn step_key(id: &str) -> String {
    format!("step/{}", id)
}

/// Bucket key for a step's inter-step payload.
pub fn step_data_key(id: &str) -> String {
    format!("step-data/{}", id)
}

/// Storage seam for step definitions and payloads.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Fetch a value. `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, replacing any previous one.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Load and decode the definition blob for `id`.
///
/// A miss here is fatal for the mutation that needed it: without the edge
/// lists no DAG traversal can proceed.
pub async fn fetch_definition(bucket: &dyn Bucket, id: &str) -> Result<StepDefinition> {
    let key = step_key(id);
    let bytes = bucket
        .get(&key)
        .await?
        .ok_or_else(|| HubError::Bucket(format!("missing definition blob {}", key)))?;
    let def = serde_json::from_slice(&bytes)
        .map_err(|e| HubError::Bucket(format!("undecodable definition blob {}: {}", key, e)))?;
    Ok(def)
}

/// Encode and store the definition blob for a step.
pub async fn store_definition(bucket: &dyn Bucket, def: &StepDefinition) -> Result<()> {
    let bytes = serde_json::to_vec(def)?;
    bucket.put(&step_key(&def.id), &bytes).await
}

/// Filesystem-backed bucket: one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    /// Create the bucket rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| HubError::Bucket(format!("failed to create bucket root: {}", e)))?;
        Ok(Self { root })
    }

    /// Map a key to a path. Key segments are sanitized so an id cannot
    /// escape the bucket root.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            let safe: String = segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            if safe.is_empty() || safe.chars().all(|c| c == '.') {
                path.push("_");
            } else {
                path.push(safe);
            }
        }
        path
    }
}

#[async_trait]
impl Bucket for FsBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HubError::Bucket(format!("read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HubError::Bucket(format!("mkdir for {}: {}", key, e)))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| HubError::Bucket(format!("write {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| HubError::Bucket(format!("rename {}: {}", key, e)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HubError::Bucket(format!("delete {}: {}", key, e))),
        }
    }
}

/// In-memory bucket for tests.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// True if the bucket currently holds `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_bucket_roundtrip() {
        let bucket = MemoryBucket::new();
        assert!(bucket.get("step/a").await.unwrap().is_none());

        bucket.put("step/a", b"payload").await.unwrap();
        assert_eq!(bucket.get("step/a").await.unwrap().unwrap(), b"payload");

        bucket.delete("step/a").await.unwrap();
        assert!(bucket.get("step/a").await.unwrap().is_none());
        // Double delete is fine.
        bucket.delete("step/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_bucket_roundtrip() {
        let dir = TempDir::new().unwrap();
        let bucket = FsBucket::new(dir.path().join("bucket")).unwrap();

        bucket.put("step-data/a", b"bytes").await.unwrap();
        assert_eq!(bucket.get("step-data/a").await.unwrap().unwrap(), b"bytes");

        bucket.put("step-data/a", b"rewritten").await.unwrap();
        assert_eq!(
            bucket.get("step-data/a").await.unwrap().unwrap(),
            b"rewritten"
        );

        bucket.delete("step-data/a").await.unwrap();
        assert!(bucket.get("step-data/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_bucket_sanitizes_hostile_keys() {
        let dir = TempDir::new().unwrap();
        let bucket = FsBucket::new(dir.path().join("bucket")).unwrap();

        bucket.put("step/../../escape", b"x").await.unwrap();
        // The file must land inside the bucket root.
        assert!(bucket.get("step/../../escape").await.unwrap().is_some());
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_definition_helpers() {
        let bucket = MemoryBucket::new();
        let def = StepDefinition::new("a").with_children(vec!["b".to_string()]);

        store_definition(&bucket, &def).await.unwrap();
        let back = fetch_definition(&bucket, "a").await.unwrap();
        assert_eq!(back.children, vec!["b".to_string()]);

        let missing = fetch_definition(&bucket, "ghost").await;
        assert!(matches!(missing, Err(HubError::Bucket(_))));
    }
}
