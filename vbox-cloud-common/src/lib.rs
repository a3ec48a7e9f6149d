//! # vbox-cloud Common
//!
//! Shared utilities for the vbox-cloud components.
//!
//! ## Logging
//!
//! ```no_run
//! use vbox_cloud_common::{init_logging_with, LogFormat};
//!
//! init_logging_with("info", LogFormat::Pretty).unwrap();
//! tracing::info!(vm_id = "9a3f...", "Instance started");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json, init_logging_with, log_filter, LogFormat};
