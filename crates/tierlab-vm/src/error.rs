//! Error types for tierlab-vm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tierlab-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while talking to the virtualization substrate.
#[derive(Debug, Error)]
pub enum VmError {
    /// An external tool exited unsuccessfully
    #[error("`{program}` failed ({status}): {stderr}")]
    Command {
        /// Program and arguments that were run
        program: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// An external tool could not be spawned at all
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        /// Program that could not be spawned
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Resource is unknown to the substrate
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Resource is in a state that does not allow the operation
    #[error("invalid state for {id}: expected {expected}, got {actual}")]
    InvalidState {
        /// Resource the operation targeted
        id: String,
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The shared base image is missing and cannot be materialized
    #[error("base image not found: {}", .0.display())]
    BaseMissing(PathBuf),

    /// An overlay already exists and reuse was not allowed
    #[error("overlay image already exists: {}", .0.display())]
    ImageExists(PathBuf),

    /// Failure injected by the in-memory substrate
    #[error("injected failure: {0}")]
    Injected(String),

    /// Output from a tool could not be interpreted
    #[error("unexpected output from `{program}`: {output}")]
    Parse {
        /// Program whose output was rejected
        program: String,
        /// Offending output
        output: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
