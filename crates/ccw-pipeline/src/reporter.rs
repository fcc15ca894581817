//! Progress notifications from the load job

use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Receives the job's progress as it moves through a cycle.
///
/// Within one cycle the calls arrive in this order: checking, then either
/// nothing-to-do or awaiting (one or more times), processing and completed.
pub trait LoadJobStatusReporter: Send + Sync {
    fn report_checking_bucket_for_manifest(&self);
    fn report_nothing_to_do(&self);
    fn report_awaiting_manifest_data(&self, manifest_key: &str);
    fn report_processing_manifest_data(&self, manifest_key: &str);
    fn report_completed_manifest(&self, manifest_key: &str);
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusReporter;

impl LoadJobStatusReporter for TracingStatusReporter {
    fn report_checking_bucket_for_manifest(&self) {
        info!(event = "checking_bucket", "Checking bucket for manifests");
    }

    fn report_nothing_to_do(&self) {
        info!(event = "nothing_to_do", "No manifest ready for processing");
    }

    fn report_awaiting_manifest_data(&self, manifest_key: &str) {
        info!(event = "awaiting_data", %manifest_key, "Waiting for data files");
    }

    fn report_processing_manifest_data(&self, manifest_key: &str) {
        info!(event = "processing", %manifest_key, "Processing data set");
    }

    fn report_completed_manifest(&self, manifest_key: &str) {
        info!(event = "completed", %manifest_key, "Data set completed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    CheckingBucket,
    NothingToDo,
    AwaitingData(String),
    Processing(String),
    Completed(String),
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StatusEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: StatusEvent) {
        self.lock().push(event);
    }
}

impl LoadJobStatusReporter for RecordingStatusReporter {
    fn report_checking_bucket_for_manifest(&self) {
        self.push(StatusEvent::CheckingBucket);
    }

    fn report_nothing_to_do(&self) {
        self.push(StatusEvent::NothingToDo);
    }

    fn report_awaiting_manifest_data(&self, manifest_key: &str) {
        self.push(StatusEvent::AwaitingData(manifest_key.to_string()));
    }

    fn report_processing_manifest_data(&self, manifest_key: &str) {
        self.push(StatusEvent::Processing(manifest_key.to_string()));
    }

    fn report_completed_manifest(&self, manifest_key: &str) {
        self.push(StatusEvent::Completed(manifest_key.to_string()));
    }
}
