//! Constants for the container lifecycle engine.
//!
//! Completion reasons, wire-visible property keys, and default limits are
//! defined here to prevent magic values throughout the codebase.

use std::time::Duration;

// =============================================================================
// Completion Reasons
// =============================================================================

/// Cached-dependency download failed during Create.
pub const DOWNLOAD_CACHED_DEPENDENCIES_FAILED: &str = "failed to download cached artifacts";

/// The sandbox provider failed to create the container.
pub const CONTAINER_INITIALIZATION_FAILED: &str = "failed to initialize container";

/// A Reserved container outlived its reservation window.
pub const CONTAINER_EXPIRED: &str = "expired container";

/// A Created container whose sandbox the provider no longer knows about.
pub const CONTAINER_MISSING: &str = "missing garden container";

/// A volume mount failed during Create.
pub const VOLUME_MOUNT_FAILED: &str = "failed to mount volume";

/// Cached-dependency release or volume unmount failed during Destroy.
pub const BIND_MOUNT_CLEANUP_FAILED: &str = "failed to cleanup bindmount artifacts";

/// The credential manager could not create the credentials directory.
pub const CRED_DIR_FAILED: &str = "failed to create credentials directory";

/// Stop arrived before a supervisor process was attached.
pub const STOPPED_BEFORE_RUNNING: &str = "stopped-before-running";

// =============================================================================
// Sandbox Properties
// =============================================================================

/// Property key marking which executor owns a sandbox container.
pub const CONTAINER_OWNER_PROPERTY: &str = "executor:owner";

/// Prefix applied to network properties on the sandbox spec.
pub const NETWORK_PROPERTY_PREFIX: &str = "network.";

/// Environment variable pointing at the injected trusted-certificate path.
pub const TRUSTED_CERTS_ENV: &str = "CF_SYSTEM_CERT_PATH";

/// Fixed in-container destination for the declarative healthcheck binary.
pub const HEALTHCHECK_DST_PATH: &str = "/etc/cf-assets/healthcheck";

// =============================================================================
// Supervision
// =============================================================================

/// Member name of the action-steps runner in the ordered group.
/// Its errors are surfaced verbatim rather than member-prefixed.
pub const STEPS_RUNNER_MEMBER: &str = "runner";

/// Member name of the credential-rotation runner.
pub const CRED_RUNNER_MEMBER: &str = "cred-manager-runner";

/// Member name of the proxy-configuration runner.
pub const PROXY_RUNNER_MEMBER: &str = "proxy-config-runner";

// =============================================================================
// Channels
// =============================================================================

/// Capacity of the lifecycle-event broadcast channel. Slow subscribers
/// lose the oldest events, never block emitters.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Defaults
// =============================================================================

/// How long a Reserved container may sit before Expire completes it.
pub const DEFAULT_RESERVED_EXPIRATION: Duration = Duration::from_secs(60);

/// Interval between registry pruning sweeps.
pub const DEFAULT_PRUNING_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound of the CPU-share scale; a container with CPUWeight 100
/// receives exactly this many shares.
pub const DEFAULT_MAX_CPU_SHARES: u64 = 1024;

/// Default hard inode limit applied to every container's disk quota.
pub const DEFAULT_INODE_LIMIT: u64 = 200_000;

/// CPU weight bounds (inclusive).
pub const MIN_CPU_WEIGHT: u32 = 1;
/// See [`MIN_CPU_WEIGHT`].
pub const MAX_CPU_WEIGHT: u32 = 100;
