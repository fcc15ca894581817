//! Polling loop around the load job

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::job::{JobOutcome, RifLoadJob};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub data_sets_loaded: u64,
    pub failed_cycles: u64,
}

/// Calls the job until cancelled. A cycle that did work is followed
/// immediately by another; idle or failed cycles wait `poll_interval` first.
///
/// Cancellation only cuts the wait between cycles short. A cycle already
/// running is always allowed to finish.
pub struct JobRunner {
    job: Arc<RifLoadJob>,
    poll_interval: Duration,
}

impl JobRunner {
    pub fn new(job: Arc<RifLoadJob>, poll_interval: Duration) -> Self {
        Self { job, poll_interval }
    }

    /// Run until `shutdown` fires, then close the job.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(poll_interval_secs = self.poll_interval.as_secs(), "Load job runner started");

        while !shutdown.is_cancelled() {
            summary.cycles += 1;
            match self.job.call().await {
                Ok(JobOutcome::WorkDone) => {
                    summary.data_sets_loaded += 1;
                    continue;
                }
                Ok(JobOutcome::NoWork) => {}
                Err(e) if e.is_transient() => {
                    summary.failed_cycles += 1;
                    warn!(error = %e, "Load cycle failed; will retry");
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    error!(error = %e, "Load cycle failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.job.close();
        info!(
            cycles = summary.cycles,
            data_sets_loaded = summary.data_sets_loaded,
            failed_cycles = summary.failed_cycles,
            "Load job runner stopped"
        );
        summary
    }
}
