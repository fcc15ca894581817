//! The RIF load job
//!
//! One call to [`RifLoadJob::call`] is one cycle: find the next manifest, wait
//! for all of its data files, pre-validate synthetic batches, hand the files to
//! the loader, then mark the manifest completed and move it out of the pending
//! prefix.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::clock::Clock;
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::ObjectStoreGateway;
use crate::loader::{DataSetLoader, LoadSummary};
use crate::manifest::{DataSetManifest, FileTypeFilter};
use crate::prevalidate::PreValidator;
use crate::queue::{ClaimedManifest, DataSetQueue};
use crate::reporter::LoadJobStatusReporter;
use crate::status::{ManifestStatus, ManifestStatusStore};

/// What a cycle achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    NoWork,
    WorkDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Checking,
    NothingToDo,
    AwaitingData,
    Validating,
    Processing,
    Completing,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Checking => "checking",
            JobState::NothingToDo => "nothing_to_do",
            JobState::AwaitingData => "awaiting_data",
            JobState::Validating => "validating",
            JobState::Processing => "processing",
            JobState::Completing => "completing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct LoadJobSettings {
    /// How long to wait for a manifest's data files before failing the cycle.
    pub await_data_timeout: Duration,
    pub await_data_poll_interval: Duration,
    /// How often the claim on the manifest being worked on is renewed.
    pub heartbeat_interval: Duration,
    /// Move completed batches to their completed prefix.
    pub relocate_completed: bool,
    pub filter: FileTypeFilter,
}

impl Default for LoadJobSettings {
    fn default() -> Self {
        Self {
            await_data_timeout: Duration::from_secs(3600),
            await_data_poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            relocate_completed: true,
            filter: FileTypeFilter::allow_all(),
        }
    }
}

/// Collaborators the job drives.
pub struct LoadJobParts {
    pub queue: Arc<DataSetQueue>,
    pub gateway: Arc<ObjectStoreGateway>,
    pub store: Arc<dyn ManifestStatusStore>,
    pub clock: Arc<dyn Clock>,
    pub validator: PreValidator,
    pub loader: Arc<dyn DataSetLoader>,
    pub reporter: Arc<dyn LoadJobStatusReporter>,
}

pub struct RifLoadJob {
    settings: LoadJobSettings,
    queue: Arc<DataSetQueue>,
    gateway: Arc<ObjectStoreGateway>,
    store: Arc<dyn ManifestStatusStore>,
    clock: Arc<dyn Clock>,
    validator: PreValidator,
    loader: Arc<dyn DataSetLoader>,
    reporter: Arc<dyn LoadJobStatusReporter>,
    state: Mutex<JobState>,
    cycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl RifLoadJob {
    pub fn new(settings: LoadJobSettings, parts: LoadJobParts) -> Self {
        Self {
            settings,
            queue: parts.queue,
            gateway: parts.gateway,
            store: parts.store,
            clock: parts.clock,
            validator: parts.validator,
            loader: parts.loader,
            reporter: parts.reporter,
            state: Mutex::new(JobState::Idle),
            cycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one cycle. Cycles on the same job never overlap.
    pub async fn call(&self) -> PipelineResult<JobOutcome> {
        let _cycle = self.cycle.lock().await;
        if self.is_closed() {
            return Err(PipelineError::Closed("load job"));
        }

        self.set_state(JobState::Checking);
        self.reporter.report_checking_bucket_for_manifest();

        let result = self.run_cycle().await;

        self.gateway.release_downloads();
        self.set_state(JobState::Idle);
        result
    }

    async fn run_cycle(&self) -> PipelineResult<JobOutcome> {
        let claimed = self.queue.next_manifest().await?;
        self.retry_relocations().await;

        let Some(claimed) = claimed else {
            self.set_state(JobState::NothingToDo);
            self.reporter.report_nothing_to_do();
            self.loader.no_data_available().await;
            return Ok(JobOutcome::NoWork);
        };

        let span = tracing::info_span!(
            "manifest",
            manifest_key = %claimed.manifest.manifest_key(),
            synthetic = claimed.manifest.is_synthetic()
        );
        self.process_manifest(claimed).instrument(span).await?;
        Ok(JobOutcome::WorkDone)
    }

    async fn process_manifest(&self, claimed: ClaimedManifest) -> PipelineResult<()> {
        let manifest = claimed.manifest;
        let manifest_key = manifest.manifest_key();
        if claimed.resumed {
            info!("Resuming manifest left unfinished by an earlier run");
        }
        let _heartbeat = ClaimHeartbeat::start(
            self.store.clone(),
            self.clock.clone(),
            manifest_key.clone(),
            self.settings.heartbeat_interval,
        );

        self.await_data(&manifest).await?;

        if manifest.is_synthetic() {
            self.set_state(JobState::Validating);
            if !self.validator.is_valid(&manifest).await? {
                error!(
                    validator = self.validator.name(),
                    "Pre-validation rejected the data set; leaving it STARTED"
                );
                return Err(PipelineError::PreValidationFailed(manifest_key));
            }
        }

        self.set_state(JobState::Processing);
        self.reporter.report_processing_manifest_data(&manifest_key);
        let summary = self.load(&manifest).await?;

        self.set_state(JobState::Completing);
        let completed = self
            .store
            .transition(
                &manifest_key,
                ManifestStatus::Started,
                ManifestStatus::Completed,
                self.clock.now(),
            )
            .await?;
        if !completed {
            return Err(PipelineError::ClaimLost(manifest_key));
        }

        if self.settings.relocate_completed {
            if let Err(e) = self.gateway.relocate(&manifest).await {
                error!(error = %e, "Failed to move completed data set; will retry next cycle");
            }
        }

        info!(
            files = summary.files,
            records = summary.records,
            bytes = summary.bytes,
            "Data set loaded"
        );
        self.reporter.report_completed_manifest(&manifest_key);
        Ok(())
    }

    /// Poll until every data file of `manifest` is present.
    async fn await_data(&self, manifest: &DataSetManifest) -> PipelineResult<()> {
        self.set_state(JobState::AwaitingData);
        let manifest_key = manifest.manifest_key();
        let started = Instant::now();
        let deadline = started + self.settings.await_data_timeout;

        loop {
            self.reporter.report_awaiting_manifest_data(&manifest_key);
            let missing = self.gateway.missing_entries(manifest).await?;
            if missing.is_empty() {
                debug!("All data files present");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::DataTimeout {
                    manifest_key,
                    waited_secs: started.elapsed().as_secs(),
                    missing,
                });
            }

            info!(missing = ?missing, "Waiting for data files");
            let pause = self
                .settings
                .await_data_poll_interval
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(pause).await;
        }
    }

    async fn load(&self, manifest: &DataSetManifest) -> PipelineResult<LoadSummary> {
        let manifest_key = manifest.manifest_key();
        let files = self.gateway.fetch_entries(manifest, &self.settings.filter).await?;

        let mut summary = LoadSummary::default();
        for file in &files {
            self.store
                .update_data_file(&manifest_key, &file.file_name, ManifestStatus::Started, self.clock.now())
                .await?;

            let records = self
                .loader
                .load_file(manifest, file)
                .await
                .map_err(|e| PipelineError::Loader {
                    manifest_key: manifest_key.clone(),
                    source: e.into(),
                })?;

            self.store
                .update_data_file(
                    &manifest_key,
                    &file.file_name,
                    ManifestStatus::Completed,
                    self.clock.now(),
                )
                .await?;
            summary.add(file, records);
        }
        Ok(summary)
    }

    /// Move any `COMPLETED` batch whose earlier relocation did not finish.
    async fn retry_relocations(&self) {
        if !self.settings.relocate_completed {
            return;
        }
        for manifest in self.queue.take_unrelocated() {
            warn!(
                manifest_key = %manifest.manifest_key(),
                "Completed data set still in pending prefix; moving it again"
            );
            if let Err(e) = self.gateway.relocate(&manifest).await {
                error!(manifest_key = %manifest.manifest_key(), error = %e, "Relocation retry failed");
            }
        }
    }

    /// Release the queue and then the gateway. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        self.gateway.close();
        info!("Load job closed");
    }
}

/// Renews the claim on a manifest in the background until dropped.
struct ClaimHeartbeat {
    task: JoinHandle<()>,
}

impl ClaimHeartbeat {
    fn start(
        store: Arc<dyn ManifestStatusStore>,
        clock: Arc<dyn Clock>,
        manifest_key: String,
        every: Duration,
    ) -> Self {
        let every = every.max(Duration::from_secs(1));
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                match store.heartbeat(&manifest_key, clock.now()).await {
                    Ok(true) => debug!(%manifest_key, "Renewed manifest claim"),
                    Ok(false) => {
                        warn!(%manifest_key, "Manifest is no longer STARTED; stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(%manifest_key, error = %e, "Failed to renew manifest claim"),
                }
            }
        });
        Self { task }
    }
}

impl Drop for ClaimHeartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::loader::RecordingLoader;
    use crate::manifest::{DataSetLocation, DataSetManifestEntry, ManifestKey};
    use crate::queue::QueueSettings;
    use crate::reporter::{RecordingStatusReporter, StatusEvent};
    use crate::status::InMemoryStatusStore;
    use crate::storage::MemoryStorage;
    use ccw_common::types::RifFileType;

    struct Harness {
        storage: Arc<MemoryStorage>,
        store: Arc<InMemoryStatusStore>,
        reporter: Arc<RecordingStatusReporter>,
        loader: Arc<RecordingLoader>,
        job: RifLoadJob,
        _dir: tempfile::TempDir,
    }

    fn harness(settings: LoadJobSettings) -> Harness {
        let storage = Arc::new(MemoryStorage::new("ccw-rif"));
        let store = Arc::new(InMemoryStatusStore::new());
        let reporter = Arc::new(RecordingStatusReporter::new());
        let loader = Arc::new(RecordingLoader::new());
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ObjectStoreGateway::new(storage.clone(), 4, dir.path()).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(DataSetQueue::new(
            clock.clone(),
            store.clone(),
            gateway.clone(),
            QueueSettings {
                locations: vec![DataSetLocation::regular()],
                filter: settings.filter.clone(),
                claim_timeout: chrono::Duration::minutes(30),
                track_unrelocated: settings.relocate_completed,
            },
        ));
        let job = RifLoadJob::new(
            settings,
            LoadJobParts {
                queue,
                gateway,
                store: store.clone(),
                clock,
                validator: PreValidator::NoOp,
                loader: loader.clone(),
                reporter: reporter.clone(),
            },
        );
        Harness {
            storage,
            store,
            reporter,
            loader,
            job,
            _dir: dir,
        }
    }

    fn batch(storage: &MemoryStorage, with_data: bool) -> DataSetManifest {
        let manifest = DataSetManifest::new(
            ManifestKey::new("Incoming", "2024-01-01T00:00:00Z", 0).unwrap(),
            DataSetLocation::regular(),
            false,
            vec![DataSetManifestEntry {
                name: "beneficiaries.rif".to_string(),
                file_type: RifFileType::Beneficiary,
            }],
        );
        storage.put(manifest.manifest_key(), manifest.to_xml().unwrap());
        if with_data {
            for entry in manifest.entries() {
                storage.put(manifest.entry_key(entry), "HDR\nrow\n");
            }
        }
        manifest
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let h = harness(LoadJobSettings::default());
        assert_eq!(h.job.call().await.unwrap(), JobOutcome::NoWork);
        assert_eq!(
            h.reporter.events(),
            vec![StatusEvent::CheckingBucket, StatusEvent::NothingToDo]
        );
        assert_eq!(h.loader.idle_cycles(), 1);
        assert_eq!(h.job.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn test_single_manifest_cycle() {
        let h = harness(LoadJobSettings::default());
        let manifest = batch(&h.storage, true);
        let key = manifest.manifest_key();

        assert_eq!(h.job.call().await.unwrap(), JobOutcome::WorkDone);
        assert_eq!(
            h.reporter.events(),
            vec![
                StatusEvent::CheckingBucket,
                StatusEvent::AwaitingData(key.clone()),
                StatusEvent::Processing(key.clone()),
                StatusEvent::Completed(key.clone()),
            ]
        );
        assert_eq!(h.store.status_of(&key), Some(ManifestStatus::Completed));
        let record = h.store.read(&key).await.unwrap().unwrap();
        assert_eq!(record.data_files[0].status, ManifestStatus::Completed);
        assert_eq!(h.storage.keys_under("Done/").len(), 2);
        assert!(h.storage.keys_under("Incoming/").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_timeout_leaves_manifest_started() {
        let h = harness(LoadJobSettings {
            await_data_timeout: Duration::from_secs(30),
            await_data_poll_interval: Duration::from_secs(10),
            ..LoadJobSettings::default()
        });
        let key = batch(&h.storage, false).manifest_key();

        let err = h.job.call().await.unwrap_err();
        assert!(matches!(err, PipelineError::DataTimeout { .. }));
        assert_eq!(h.store.status_of(&key), Some(ManifestStatus::Started));
        assert!(h.loader.loaded().is_empty());

        let awaiting = h
            .reporter
            .events()
            .into_iter()
            .filter(|e| matches!(e, StatusEvent::AwaitingData(_)))
            .count();
        assert_eq!(awaiting, 4);
    }

    #[tokio::test]
    async fn test_logical_completion_without_relocation() {
        let h = harness(LoadJobSettings {
            relocate_completed: false,
            ..LoadJobSettings::default()
        });
        let key = batch(&h.storage, true).manifest_key();

        assert_eq!(h.job.call().await.unwrap(), JobOutcome::WorkDone);
        assert_eq!(h.store.status_of(&key), Some(ManifestStatus::Completed));
        assert!(h.storage.keys_under("Done/").is_empty());

        assert_eq!(h.job.call().await.unwrap(), JobOutcome::NoWork);
        assert_eq!(h.loader.loaded().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness(LoadJobSettings::default());
        h.job.close();
        h.job.close();
        assert!(h.job.is_closed());
        assert!(matches!(h.job.call().await, Err(PipelineError::Closed(_))));
    }
}
