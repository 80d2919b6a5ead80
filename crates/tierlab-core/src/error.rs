//! Error types for tierlab-core.

use crate::command::LifecycleCommand;
use std::path::PathBuf;
use thiserror::Error;
use tierlab_vm::{ResourceId, ResourceState, VmError};

/// Result type alias for tierlab-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building or driving a topology.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration value missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Topology invariant violated
    #[error("invalid topology: {0}")]
    Validation(String),

    /// A prerequisite resource is not in the required state
    #[error("{resource} is not ready: {dependency} is {observed}, expected {required}")]
    DependencyNotReady {
        /// Resource the step acts on
        resource: ResourceId,
        /// Prerequisite that is not ready
        dependency: ResourceId,
        /// State the prerequisite must be in
        required: String,
        /// State the prerequisite was observed in
        observed: ResourceState,
    },

    /// A substrate call failed
    #[error("{command} {resource} (target {target}) failed: {source}")]
    Provider {
        /// Resource the step acts on
        resource: ResourceId,
        /// Command being executed
        command: LifecycleCommand,
        /// State the step was driving towards
        target: ResourceState,
        /// Substrate error
        #[source]
        source: VmError,
    },

    /// An overlay exists and reuse was disallowed
    #[error("overlay for {resource} already exists at {}", path.display())]
    ImageExists {
        /// Overlay resource
        resource: ResourceId,
        /// Existing overlay file
        path: PathBuf,
    },

    /// A lifecycle command stopped at a failing step
    #[error("{command} stopped at {resource} (target {target}): {source}")]
    StepFailed {
        /// Command being executed
        command: LifecycleCommand,
        /// Resource whose step failed
        resource: ResourceId,
        /// State the step was driving towards
        target: ResourceState,
        /// Cause of the failure
        #[source]
        source: Box<CoreError>,
    },

    /// Lifecycle state cache could not be read or written
    #[error("state file {}: {message}", path.display())]
    State {
        /// State file
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
