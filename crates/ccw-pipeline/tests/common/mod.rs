//! Shared fixtures for load job integration tests
//!
//! Builds a [`RifLoadJob`] over in-memory storage and status store, with a
//! manual clock so tests decide which manifests are already due.

#![allow(dead_code, clippy::unwrap_used)]

use ccw_common::types::RifFileType;
use ccw_pipeline::{
    clock::{Clock, ManualClock},
    gateway::ObjectStoreGateway,
    loader::{DataSetLoader, RecordingLoader},
    manifest::{
        DataSetLocation, DataSetManifest, DataSetManifestEntry, FileTypeFilter, ManifestKey,
        PreValidationProperties,
    },
    prevalidate::PreValidator,
    queue::{DataSetQueue, QueueSettings},
    reporter::RecordingStatusReporter,
    status::InMemoryStatusStore,
    storage::MemoryStorage,
    LoadJobParts, LoadJobSettings, RifLoadJob,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "ccw-rif-test";

pub fn at(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
}

/// Knobs for one job instance.
pub struct JobOptions {
    pub locations: Vec<DataSetLocation>,
    pub filter: FileTypeFilter,
    pub validator: PreValidator,
    pub await_data_timeout: Duration,
    pub relocate_completed: bool,
    /// Loader to use instead of the shared recording one.
    pub loader: Option<Arc<dyn DataSetLoader>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            locations: vec![DataSetLocation::regular()],
            filter: FileTypeFilter::allow_all(),
            validator: PreValidator::NoOp,
            await_data_timeout: Duration::from_secs(60),
            relocate_completed: true,
            loader: None,
        }
    }
}

pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub store: Arc<InMemoryStatusStore>,
    pub clock: Arc<ManualClock>,
    pub reporter: Arc<RecordingStatusReporter>,
    pub loader: Arc<RecordingLoader>,
    pub job: RifLoadJob,
    dirs: Vec<tempfile::TempDir>,
}

impl Harness {
    pub fn new(options: JobOptions) -> Self {
        let storage = Arc::new(MemoryStorage::new(BUCKET));
        let store = Arc::new(InMemoryStatusStore::new());
        let clock = Arc::new(ManualClock::new(at("2024-06-01T00:00:00Z")));
        let reporter = Arc::new(RecordingStatusReporter::new());
        let loader = Arc::new(RecordingLoader::new());
        let dir = tempfile::tempdir().unwrap();

        let job = build_job(
            &storage,
            &store,
            clock.clone(),
            loader.clone(),
            reporter.clone(),
            options,
            dir.path(),
        );

        Self {
            storage,
            store,
            clock,
            reporter,
            loader,
            job,
            dirs: vec![dir],
        }
    }

    /// A second job over the same bucket and status store, as another
    /// pipeline instance would be.
    pub fn sibling(&mut self, options: JobOptions) -> RifLoadJob {
        let dir = tempfile::tempdir().unwrap();
        let job = build_job(
            &self.storage,
            &self.store,
            self.clock.clone(),
            self.loader.clone(),
            Arc::new(RecordingStatusReporter::new()),
            options,
            dir.path(),
        );
        self.dirs.push(dir);
        job
    }
}

fn build_job(
    storage: &Arc<MemoryStorage>,
    store: &Arc<InMemoryStatusStore>,
    clock: Arc<ManualClock>,
    loader: Arc<RecordingLoader>,
    reporter: Arc<RecordingStatusReporter>,
    options: JobOptions,
    download_dir: &std::path::Path,
) -> RifLoadJob {
    let clock: Arc<dyn Clock> = clock;
    let loader: Arc<dyn DataSetLoader> = match options.loader {
        Some(custom) => custom,
        None => loader,
    };
    let gateway = Arc::new(ObjectStoreGateway::new(storage.clone(), 4, download_dir).unwrap());
    let queue = Arc::new(DataSetQueue::new(
        clock.clone(),
        store.clone(),
        gateway.clone(),
        QueueSettings {
            locations: options.locations,
            filter: options.filter.clone(),
            claim_timeout: chrono::Duration::hours(6),
            track_unrelocated: options.relocate_completed,
        },
    ));

    RifLoadJob::new(
        LoadJobSettings {
            await_data_timeout: options.await_data_timeout,
            await_data_poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            relocate_completed: options.relocate_completed,
            filter: options.filter,
        },
        LoadJobParts {
            queue,
            gateway,
            store: store.clone(),
            clock,
            validator: options.validator,
            loader,
            reporter,
        },
    )
}

/// Describes one batch to upload.
pub struct Batch<'a> {
    pub location: DataSetLocation,
    pub timestamp: &'a str,
    pub sequence_id: u32,
    pub entries: Vec<(&'a str, RifFileType)>,
    pub with_data: bool,
    pub props: Option<PreValidationProperties>,
}

impl<'a> Batch<'a> {
    pub fn regular(timestamp: &'a str, sequence_id: u32) -> Self {
        Self {
            location: DataSetLocation::regular(),
            timestamp,
            sequence_id,
            entries: vec![
                ("beneficiaries.rif", RifFileType::Beneficiary),
                ("carrier.rif", RifFileType::Carrier),
            ],
            with_data: true,
            props: None,
        }
    }

    pub fn synthetic(timestamp: &'a str, sequence_id: u32) -> Self {
        Self {
            location: DataSetLocation::synthetic(),
            ..Self::regular(timestamp, sequence_id)
        }
    }

    pub fn entries(mut self, entries: Vec<(&'a str, RifFileType)>) -> Self {
        self.entries = entries;
        self
    }

    pub fn without_data(mut self) -> Self {
        self.with_data = false;
        self
    }

    pub fn props(mut self, props: PreValidationProperties) -> Self {
        self.props = Some(props);
        self
    }
}

/// Upload the descriptor, and the data files unless told not to.
pub fn put_batch(storage: &MemoryStorage, batch: Batch<'_>) -> DataSetManifest {
    let synthetic = batch.location == DataSetLocation::synthetic();
    let key = ManifestKey::new(
        batch.location.pending_prefix.clone(),
        batch.timestamp,
        batch.sequence_id,
    )
    .unwrap();
    let entries = batch
        .entries
        .iter()
        .map(|(name, file_type)| DataSetManifestEntry {
            name: name.to_string(),
            file_type: *file_type,
        })
        .collect();

    let mut manifest = DataSetManifest::new(key, batch.location, synthetic, entries);
    if let Some(props) = batch.props {
        manifest = manifest.with_pre_validation_properties(props);
    }

    storage.put(manifest.manifest_key(), manifest.to_xml().unwrap());
    if batch.with_data {
        for entry in manifest.entries() {
            storage.put(manifest.entry_key(entry), "BENE_ID|CLM_ID\n-1|-10\n");
        }
    }
    manifest
}
