//! Bucket transfers for the load job
//!
//! The gateway lists descriptors, fetches manifests and data files, and moves
//! finished batches to their completed prefix. Object transfers run with at
//! most `concurrency` requests in flight. Downloads land in a directory owned
//! by this gateway instance and are kept for the current cycle only.

use anyhow::anyhow;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ccw_common::types::RifFileType;

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{
    DataSetLocation, DataSetManifest, DataSetManifestEntry, FileTypeFilter, ManifestKey,
    ManifestKeyPattern,
};
use crate::storage::ObjectStore;

/// A data file fetched to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetFile {
    pub file_name: String,
    pub file_type: RifFileType,
    pub object_key: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    /// Objects copied to the completed prefix by this call.
    pub copied: usize,
    /// Objects whose completed copy already existed from an earlier attempt.
    pub already_present: usize,
}

pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
    pattern: ManifestKeyPattern,
    concurrency: usize,
    download_root: PathBuf,
    downloads: Mutex<HashMap<String, DataSetFile>>,
    closed: AtomicBool,
}

impl ObjectStoreGateway {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        concurrency: usize,
        download_dir: &Path,
    ) -> PipelineResult<Self> {
        let download_root = download_dir.join(format!("ccw-pipeline-{}", Uuid::new_v4()));

        Ok(Self {
            store,
            pattern: ManifestKeyPattern::new()?,
            concurrency: concurrency.max(1),
            download_root,
            downloads: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.is_closed() {
            return Err(PipelineError::Closed("object store gateway"));
        }
        Ok(())
    }

    fn downloads(&self) -> MutexGuard<'_, HashMap<String, DataSetFile>> {
        self.downloads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Descriptor keys directly under the location's pending prefix.
    ///
    /// Keys that look like descriptors but cannot be parsed are logged and
    /// skipped.
    pub async fn list_manifest_keys(
        &self,
        location: &DataSetLocation,
    ) -> PipelineResult<Vec<ManifestKey>> {
        self.ensure_open()?;

        let listing_prefix = format!("{}/", location.pending_prefix);
        let objects = self.store.list(&listing_prefix).await?;

        let mut keys = Vec::new();
        for object in objects {
            match self.pattern.parse(&location.pending_prefix, &object.key) {
                Ok(Some(key)) => keys.push(key),
                Ok(None) => {}
                Err(e) => warn!(object_key = %object.key, error = %e, "Ignoring unreadable manifest key"),
            }
        }

        debug!(
            prefix = %location.pending_prefix,
            manifests = keys.len(),
            "Listed manifest descriptors"
        );
        Ok(keys)
    }

    pub async fn fetch_manifest(
        &self,
        key: &ManifestKey,
        location: &DataSetLocation,
    ) -> PipelineResult<DataSetManifest> {
        self.ensure_open()?;
        let bytes = self.store.download(&key.object_key()).await?;
        DataSetManifest::from_xml(key.clone(), location.clone(), &bytes)
    }

    /// Fetch several descriptors; results come back in the order requested.
    pub async fn fetch_manifests(
        &self,
        keys: &[(ManifestKey, DataSetLocation)],
    ) -> Vec<PipelineResult<DataSetManifest>> {
        stream::iter(keys)
            .map(|(key, location)| self.fetch_manifest(key, location))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Names of entries whose data file has not yet arrived.
    pub async fn missing_entries(&self, manifest: &DataSetManifest) -> PipelineResult<Vec<String>> {
        self.ensure_open()?;

        let presence: Vec<(String, bool)> = stream::iter(manifest.entries())
            .map(|entry| async move {
                let present = self.store.exists(&manifest.entry_key(entry)).await?;
                Ok::<_, PipelineError>((entry.name.clone(), present))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok(presence
            .into_iter()
            .filter_map(|(name, present)| (!present).then_some(name))
            .collect())
    }

    /// Download every entry the filter accepts, in manifest entry order.
    pub async fn fetch_entries(
        &self,
        manifest: &DataSetManifest,
        filter: &FileTypeFilter,
    ) -> PipelineResult<Vec<DataSetFile>> {
        self.ensure_open()?;

        let accepted: Vec<&DataSetManifestEntry> = manifest
            .entries()
            .iter()
            .filter(|entry| filter.accepts_entry(entry))
            .collect();

        info!(
            manifest_key = %manifest.manifest_key(),
            files = accepted.len(),
            skipped = manifest.entries().len() - accepted.len(),
            concurrency = self.concurrency,
            "Downloading data files"
        );

        stream::iter(accepted)
            .map(|entry| self.fetch_entry(manifest, entry))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    async fn fetch_entry(
        &self,
        manifest: &DataSetManifest,
        entry: &DataSetManifestEntry,
    ) -> PipelineResult<DataSetFile> {
        self.ensure_open()?;

        let object_key = manifest.entry_key(entry);
        let cached = self.downloads().get(&object_key).cloned();
        if let Some(cached) = cached {
            if cached.local_path.exists() {
                debug!(%object_key, "Reusing downloaded data file");
                return Ok(cached);
            }
        }

        let local_path = self
            .download_root
            .join(manifest.key().timestamp_text().replace(':', "-"))
            .join(manifest.key().sequence_id().to_string())
            .join(&entry.name);

        let downloaded = self.store.download_to(&object_key, &local_path).await?;

        let file = DataSetFile {
            file_name: entry.name.clone(),
            file_type: entry.file_type,
            object_key: object_key.clone(),
            local_path,
            size: downloaded.size,
            sha256: downloaded.sha256,
        };
        self.downloads().insert(object_key, file.clone());
        Ok(file)
    }

    /// Move the descriptor and every data file to the completed prefix.
    ///
    /// Each object is copied only if the completed copy is absent, then removed
    /// from the pending prefix, so an interrupted move can simply be repeated.
    /// The descriptor moves last, after all of its data files.
    pub async fn relocate(&self, manifest: &DataSetManifest) -> PipelineResult<RelocationSummary> {
        self.ensure_open()?;

        let mut pairs = manifest.relocation_pairs();
        let descriptor = pairs
            .pop()
            .ok_or_else(|| PipelineError::Precondition("manifest without descriptor".to_string()))?;

        let copied: Vec<bool> = stream::iter(&pairs)
            .map(|(source, dest)| self.move_object(source, dest))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let descriptor_copied = self.move_object(&descriptor.0, &descriptor.1).await?;

        let summary = copied
            .into_iter()
            .chain(std::iter::once(descriptor_copied))
            .fold(RelocationSummary::default(), |mut summary, was_copied| {
                if was_copied {
                    summary.copied += 1;
                } else {
                    summary.already_present += 1;
                }
                summary
            });

        info!(
            manifest_key = %manifest.manifest_key(),
            completed_prefix = %manifest.location().completed_prefix,
            copied = summary.copied,
            already_present = summary.already_present,
            "Relocated data set"
        );
        Ok(summary)
    }

    async fn move_object(&self, source: &str, dest: &str) -> PipelineResult<bool> {
        let copied = if self.store.exists(dest).await? {
            false
        } else {
            if !self.store.exists(source).await? {
                return Err(anyhow!("'{}' is missing and was never copied to '{}'", source, dest).into());
            }
            self.store.copy(source, dest).await?;
            true
        };

        self.store.delete(source).await?;
        Ok(copied)
    }

    /// Drop this cycle's downloaded files.
    pub fn release_downloads(&self) {
        let files: Vec<DataSetFile> = self.downloads().drain().map(|(_, file)| file).collect();
        for file in files {
            if let Err(e) = std::fs::remove_file(&file.local_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.local_path.display(), error = %e, "Failed to remove download");
                }
            }
        }
    }

    /// Release the download directory. Further operations fail with
    /// [`PipelineError::Closed`]; calling this again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.downloads().clear();
        match std::fs::remove_dir_all(&self.download_root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.download_root.display(),
                error = %e,
                "Failed to remove download directory"
            ),
        }
        debug!("Object store gateway closed");
    }
}

impl Drop for ObjectStoreGateway {
    fn drop(&mut self) {
        self.close();
    }
}
