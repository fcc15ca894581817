//! Object store access
//!
//! [`ObjectStore`] is the narrow set of bucket operations the pipeline needs.
//! [`S3Storage`] talks to S3 (or MinIO); [`MemoryStorage`] backs tests and dry
//! runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of streaming an object to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedObject {
    pub size: u64,
    pub sha256: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every object whose key starts with `prefix`, across all result pages.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Stream an object into `path`, replacing any existing file.
    async fn download_to(&self, key: &str, path: &Path) -> Result<DownloadedObject>;

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

pub(crate) struct ChecksumWriter {
    hasher: Sha256,
    size: u64,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn finish(self) -> DownloadedObject {
        DownloadedObject {
            size: self.size,
            sha256: format!("{:x}", self.hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_writer() {
        let mut writer = ChecksumWriter::new();
        writer.update(b"Hello, ");
        writer.update(b"World!");
        let summary = writer.finish();
        assert_eq!(summary.size, 13);
        assert_eq!(
            summary.sha256,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
