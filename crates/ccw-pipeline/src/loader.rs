//! Hand-off of fetched data files to the record loader
//!
//! Parsing RIF records and writing them to the warehouse happens behind
//! [`DataSetLoader`]. The job calls it once per data file, in manifest entry
//! order.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::manifest::DataSetManifest;

pub use crate::gateway::DataSetFile;

#[async_trait]
pub trait DataSetLoader: Send + Sync {
    /// Load one data file; returns the number of records loaded.
    async fn load_file(&self, manifest: &DataSetManifest, file: &DataSetFile) -> anyhow::Result<u64>;

    /// Called after a cycle that found nothing to process.
    async fn no_data_available(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub records: u64,
    pub bytes: u64,
}

impl LoadSummary {
    pub fn add(&mut self, file: &DataSetFile, records: u64) {
        self.files += 1;
        self.records += records;
        self.bytes += file.size;
    }
}

/// Counts records without writing anything.
///
/// RIF files carry one header line followed by one record per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunLoader;

#[async_trait]
impl DataSetLoader for DryRunLoader {
    async fn load_file(&self, manifest: &DataSetManifest, file: &DataSetFile) -> anyhow::Result<u64> {
        let handle = tokio::fs::File::open(&file.local_path).await?;
        let mut lines = BufReader::new(handle).lines();

        let mut non_empty = 0u64;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                non_empty += 1;
            }
        }
        let records = non_empty.saturating_sub(1);

        info!(
            manifest_key = %manifest.manifest_key(),
            file = %file.file_name,
            file_type = %file.file_type,
            claims = file.file_type.is_claim(),
            bytes = file.size,
            sha256 = %file.sha256,
            records,
            "Dry run: counted records"
        );
        Ok(records)
    }

    async fn no_data_available(&self) {
        info!("Dry run: no data available this cycle");
    }
}

/// Remembers which files were loaded, optionally failing chosen ones.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    loaded: Mutex<Vec<(String, String)>>,
    idle_cycles: Mutex<usize>,
    fail_on: HashSet<String>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(file_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fail_on: file_names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `(manifest key, file name)` pairs in load order.
    pub fn loaded(&self) -> Vec<(String, String)> {
        lock(&self.loaded).clone()
    }

    pub fn idle_cycles(&self) -> usize {
        *lock(&self.idle_cycles)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DataSetLoader for RecordingLoader {
    async fn load_file(&self, manifest: &DataSetManifest, file: &DataSetFile) -> anyhow::Result<u64> {
        if self.fail_on.contains(&file.file_name) {
            anyhow::bail!("rejected {}", file.file_name);
        }
        lock(&self.loaded).push((manifest.manifest_key(), file.file_name.clone()));
        Ok(1)
    }

    async fn no_data_available(&self) {
        *lock(&self.idle_cycles) += 1;
    }
}
