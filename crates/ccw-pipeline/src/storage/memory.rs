use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{ChecksumWriter, DownloadedObject, ObjectStore, ObjectSummary};

/// Bucket held in process memory.
///
/// `set_unavailable(true)` makes every call fail, which is how tests simulate an
/// unreachable bucket.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects().insert(key.into(), data.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("bucket {} is unavailable", self.bucket);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .objects()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as i64,
                last_modified: Some(now),
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects().contains_key(key))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        self.get(key)
            .ok_or_else(|| anyhow!("No such key: {}", key))
    }

    async fn download_to(&self, key: &str, path: &Path) -> Result<DownloadedObject> {
        let data = self.download(key).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let mut checksum = ChecksumWriter::new();
        checksum.update(&data);
        Ok(checksum.finish())
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_available()?;
        self.put(key, data);
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.check_available()?;
        let mut objects = self.objects();
        let data = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| anyhow!("No such key: {}", source_key))?;
        objects.insert(dest_key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects().remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = MemoryStorage::new("ccw-rif");
        storage.put("Incoming/a/0_manifest.xml", "x");
        storage.put("Incoming/a/b.rif", "yy");
        storage.put("Done/a/0_manifest.xml", "z");

        let listed = storage.list("Incoming/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["Incoming/a/0_manifest.xml", "Incoming/a/b.rif"]);
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let storage = MemoryStorage::new("ccw-rif");
        storage.put("Incoming/a.rif", "data");

        storage.copy("Incoming/a.rif", "Done/a.rif").await.unwrap();
        storage.delete("Incoming/a.rif").await.unwrap();
        storage.delete("Incoming/a.rif").await.unwrap();

        assert!(!storage.exists("Incoming/a.rif").await.unwrap());
        assert_eq!(storage.get("Done/a.rif").unwrap(), b"data");
        assert!(storage.copy("Incoming/a.rif", "Done/b.rif").await.is_err());
    }

    #[tokio::test]
    async fn test_download_to_file() {
        let storage = MemoryStorage::new("ccw-rif");
        storage.put("Incoming/a.rif", "Hello, World!");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/a.rif");

        let downloaded = storage.download_to("Incoming/a.rif", &path).await.unwrap();
        assert_eq!(downloaded.size, 13);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Hello, World!");
    }

    #[tokio::test]
    async fn test_unavailable() {
        let storage = MemoryStorage::new("ccw-rif");
        storage.set_unavailable(true);
        assert!(storage.list("Incoming/").await.is_err());
        assert!(storage.exists("x").await.is_err());
        storage.set_unavailable(false);
        assert!(storage.list("Incoming/").await.is_ok());
    }
}
