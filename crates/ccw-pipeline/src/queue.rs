//! Selection of the next manifest to process
//!
//! Manifests are processed strictly in `(timestamp, sequenceId)` order across
//! every watched prefix. Each call to [`DataSetQueue::next_manifest`] lists the
//! bucket, records newly seen manifests as `DISCOVERED`, then walks the pending
//! manifests oldest first:
//!
//! - future-dated manifests are invisible until their timestamp has passed
//! - `COMPLETED` manifests are skipped
//! - manifests with no entry the file-type filter accepts are skipped
//! - a `DISCOVERED` manifest is claimed by moving it to `STARTED`
//! - a `STARTED` manifest blocks everything after it until its owner stops
//!   sending heartbeats for longer than the claim timeout
//!
//! Losing the claim race to another instance counts as finding the manifest
//! `STARTED`: nothing later is claimed in the same call.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::ObjectStoreGateway;
use crate::manifest::{DataSetLocation, DataSetManifest, FileTypeFilter, ManifestKey};
use crate::status::{ManifestRecord, ManifestStatus, ManifestStatusStore};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Pending/completed prefix pairs to watch, e.g. regular and synthetic.
    pub locations: Vec<DataSetLocation>,
    pub filter: FileTypeFilter,
    /// Time without a heartbeat after which another instance may take over a
    /// `STARTED` manifest.
    pub claim_timeout: Duration,
    /// Keep track of `COMPLETED` manifests still sitting in a pending prefix.
    pub track_unrelocated: bool,
}

/// A manifest this instance now owns.
#[derive(Debug, Clone)]
pub struct ClaimedManifest {
    pub manifest: Arc<DataSetManifest>,
    pub record: ManifestRecord,
    /// Taken over from a stale claim rather than freshly discovered.
    pub resumed: bool,
}

pub struct DataSetQueue {
    clock: Arc<dyn Clock>,
    store: Arc<dyn ManifestStatusStore>,
    gateway: Arc<ObjectStoreGateway>,
    settings: QueueSettings,
    manifests: Mutex<HashMap<String, Arc<DataSetManifest>>>,
    unrelocated: Mutex<Vec<Arc<DataSetManifest>>>,
    closed: AtomicBool,
}

impl DataSetQueue {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn ManifestStatusStore>,
        gateway: Arc<ObjectStoreGateway>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            clock,
            store,
            gateway,
            settings,
            manifests: Mutex::new(HashMap::new()),
            unrelocated: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<DataSetManifest>>> {
        self.manifests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unrelocated(&self) -> MutexGuard<'_, Vec<Arc<DataSetManifest>>> {
        self.unrelocated.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, object_key: &str) -> Option<Arc<DataSetManifest>> {
        self.cache().get(object_key).cloned()
    }

    /// `COMPLETED` manifests the last scan found still in a pending prefix.
    pub fn take_unrelocated(&self) -> Vec<Arc<DataSetManifest>> {
        std::mem::take(&mut *self.unrelocated())
    }

    /// Claim the next manifest to process, if any is ready.
    pub async fn next_manifest(&self) -> PipelineResult<Option<ClaimedManifest>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed("data set queue"));
        }
        self.unrelocated().clear();

        let now = self.clock.now();
        let listed = self.list_available(now).await?;
        let object_keys: Vec<String> = listed.iter().map(|(key, _)| key.object_key()).collect();
        self.cache().retain(|key, _| object_keys.contains(key));

        let mut records = self.store.read_many(&object_keys).await?;
        let mut failures = self.load_descriptors(&listed, &records).await;

        for (key, _) in &listed {
            let object_key = key.object_key();
            if records.contains_key(&object_key) {
                continue;
            }
            if let Some(manifest) = self.cached(&object_key) {
                let record = self.store.insert_discovered(&manifest, now).await?;
                debug!(%object_key, status = %record.status, "Recorded manifest");
                records.insert(object_key, record);
            }
        }

        for (key, _) in &listed {
            let object_key = key.object_key();
            let record = records.get(&object_key);

            if record.map(|r| r.status) == Some(ManifestStatus::Completed) {
                if self.settings.track_unrelocated {
                    if let Some(manifest) = self.cached(&object_key) {
                        self.unrelocated().push(manifest);
                    }
                }
                continue;
            }

            let (Some(manifest), Some(record)) = (self.cached(&object_key), record) else {
                // Everything before this one is done or skipped, so a batch we
                // cannot read holds up the queue.
                return Err(failures.remove(&object_key).unwrap_or_else(|| {
                    PipelineError::manifest_parse(&object_key, "descriptor unavailable")
                }));
            };

            if !self.settings.filter.accepts_manifest(&manifest) {
                debug!(%object_key, "Skipping manifest: no entry passes the file type filter");
                continue;
            }

            match record.status {
                ManifestStatus::Discovered => {
                    if self
                        .store
                        .transition(&object_key, ManifestStatus::Discovered, ManifestStatus::Started, now)
                        .await?
                    {
                        info!(%object_key, "Claimed manifest");
                        return self.claimed(manifest, false).await.map(Some);
                    }
                    info!(%object_key, "Manifest claimed by another instance; later manifests must wait");
                    return Ok(None);
                }
                ManifestStatus::Started if record.is_stale(now, self.settings.claim_timeout) => {
                    if self
                        .store
                        .reclaim_stale(&object_key, now - self.settings.claim_timeout, now)
                        .await?
                    {
                        warn!(
                            %object_key,
                            started_at = ?record.started_at,
                            last_heartbeat = ?record.last_heartbeat(),
                            "Taking over stale manifest claim"
                        );
                        return self.claimed(manifest, true).await.map(Some);
                    }
                    info!(%object_key, "Stale manifest was taken over by another instance");
                    return Ok(None);
                }
                ManifestStatus::Started => {
                    info!(
                        %object_key,
                        last_heartbeat = ?record.last_heartbeat(),
                        "Earlier manifest still in progress; later manifests must wait"
                    );
                    return Ok(None);
                }
                ManifestStatus::Completed => {}
            }
        }

        Ok(None)
    }

    /// Descriptor keys from every location whose timestamp has passed, oldest
    /// first.
    async fn list_available(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> PipelineResult<Vec<(ManifestKey, DataSetLocation)>> {
        let mut listed = Vec::new();
        for location in &self.settings.locations {
            for key in self.gateway.list_manifest_keys(location).await? {
                listed.push((key, location.clone()));
            }
        }

        let total = listed.len();
        listed.retain(|(key, _)| key.timestamp() <= now);
        if listed.len() < total {
            debug!(future_dated = total - listed.len(), "Ignoring manifests dated in the future");
        }

        listed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(listed)
    }

    /// Fetch descriptors not yet cached. Returns the failures by object key.
    async fn load_descriptors(
        &self,
        listed: &[(ManifestKey, DataSetLocation)],
        records: &HashMap<String, ManifestRecord>,
    ) -> HashMap<String, PipelineError> {
        let wanted: Vec<(ManifestKey, DataSetLocation)> = listed
            .iter()
            .filter(|(key, _)| {
                let object_key = key.object_key();
                let completed = records
                    .get(&object_key)
                    .is_some_and(|r| r.status == ManifestStatus::Completed);
                (!completed || self.settings.track_unrelocated) && self.cached(&object_key).is_none()
            })
            .cloned()
            .collect();

        let mut failures = HashMap::new();
        for ((key, _), result) in wanted.iter().zip(self.gateway.fetch_manifests(&wanted).await) {
            match result {
                Ok(manifest) => {
                    self.cache().insert(key.object_key(), Arc::new(manifest));
                }
                Err(e) => {
                    warn!(object_key = %key.object_key(), error = %e, "Could not read manifest");
                    failures.insert(key.object_key(), e);
                }
            }
        }
        failures
    }

    async fn claimed(
        &self,
        manifest: Arc<DataSetManifest>,
        resumed: bool,
    ) -> PipelineResult<ClaimedManifest> {
        let object_key = manifest.manifest_key();
        let record = self.store.read(&object_key).await?.ok_or_else(|| {
            PipelineError::Precondition(format!("claimed manifest '{}' has no record", object_key))
        })?;

        Ok(ClaimedManifest {
            manifest,
            record,
            resumed,
        })
    }

    /// Drop cached descriptors; later calls fail with [`PipelineError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache().clear();
        self.unrelocated().clear();
        debug!("Data set queue closed");
    }
}
