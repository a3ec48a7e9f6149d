//! Error types for the VirtualBox adapter.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The requested instance, image or volume does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// VBoxManage could not be spawned or exited with a non-zero status.
    #[error("VBoxManage {command} failed (status {status:?}): {message}")]
    ToolInvocationFailed {
        /// Subcommand that failed (e.g. "createvm")
        command: String,
        /// Exit status, if the process ran at all
        status: Option<i32>,
        /// Captured stderr or spawn error
        message: String,
    },

    /// VBoxManage did not finish within the configured bound.
    #[error("VBoxManage {command} timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
    },

    /// The operation is not implemented for this hypervisor.
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    /// The instance is in a state that does not allow the requested action.
    #[error("Invalid instance state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration or request options.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cloud-init media could not be built.
    #[error("Cloud-init media error: {0}")]
    CloudInit(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
