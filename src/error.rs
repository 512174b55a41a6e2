//! Error types for the container lifecycle engine.

use std::time::Duration;

use crate::sandbox::SandboxError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// A lifecycle method was called in a state that cannot accept it.
    #[error("invalid state transition for container")]
    InvalidTransition,

    /// Operation requires an attached sandbox container, but none is present.
    #[error("container not found")]
    ContainerNotFound,

    /// An allocation reused a GUID that is already present in the store.
    #[error("container guid already allocated: {0}")]
    GuidAlreadyAllocated(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// The executor does not have enough of the named resource left.
    #[error("insufficient resources: {resource}")]
    InsufficientResources {
        /// Which resource ran out ("memory", "disk", or "containers").
        resource: &'static str,
    },

    // =========================================================================
    // Action Errors
    // =========================================================================
    /// An action exceeded its per-action timeout.
    #[error("action {action} timed out after {timeout:?}")]
    ActionTimeout {
        /// Name of the action that timed out.
        action: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The sandbox process exited with a non-zero status.
    #[error("process returned with exit value: {status}")]
    NonZeroExit {
        /// Exit status of the process.
        status: u32,
    },

    // =========================================================================
    // Create/Run Input Errors
    // =========================================================================
    /// An egress rule could not be converted to a sandbox net-out rule.
    #[error("invalid egress rule: {0}")]
    InvalidEgressRule(String),

    // =========================================================================
    // Cleanup Errors
    // =========================================================================
    /// Cached-dependency release or volume unmount failed during Destroy.
    #[error("failed to cleanup bindmount artifacts")]
    BindMountCleanup,

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Error from the sandbox provider.
    #[error("sandbox provider error: {0}")]
    Sandbox(#[from] SandboxError),

    /// The dependency manager failed to download or release artifacts.
    #[error("dependency manager error: {0}")]
    Dependency(String),

    /// A volume mount or unmount failed.
    #[error("volume manager error: {0}")]
    Volume(String),

    /// The credential manager failed.
    #[error("credential manager error: {0}")]
    Credential(String),

    /// The proxy manager failed.
    #[error("proxy manager error: {0}")]
    Proxy(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Operation not supported by the wired implementation.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}
