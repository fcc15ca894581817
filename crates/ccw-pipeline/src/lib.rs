//! CCW RIF load pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Watches an S3 bucket for RIF data sets announced by manifest descriptors and
//! feeds them, one batch at a time and in timestamp order, to a record loader.
//!
//! - [`manifest`]: descriptor keys, XML codec, file type filter
//! - [`status`]: the DISCOVERED / STARTED / COMPLETED lifecycle and its stores
//! - [`storage`] and [`gateway`]: bucket access and bounded-concurrency transfers
//! - [`queue`]: ordering and claiming of the next manifest
//! - [`prevalidate`]: collision checks for synthetic batches
//! - [`job`] and [`runner`]: one load cycle, and the polling loop around it

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod loader;
pub mod manifest;
pub mod prevalidate;
pub mod queue;
pub mod reporter;
pub mod runner;
pub mod status;
pub mod storage;

pub use error::{PipelineError, PipelineResult};
pub use job::{JobOutcome, JobState, LoadJobParts, LoadJobSettings, RifLoadJob};
