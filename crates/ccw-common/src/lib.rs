//! CCW Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the CCW pipeline workspace.
//!
//! - **Error Handling**: [`CcwError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Types**: record types shared by every pipeline component
//!
//! # Example
//!
//! ```no_run
//! use ccw_common::logging::{init_logging, LogConfig};
//! use ccw_common::types::RifFileType;
//!
//! fn main() -> ccw_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let file_type: RifFileType = "CARRIER".parse()?;
//!     tracing::info!(%file_type, "parsed");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{CcwError, Result};
