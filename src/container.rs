//! Container info model and its state machine.
//!
//! A [`Container`] is the externally observable view of one work unit:
//! resource reservation, run parameters, resolved network facts, and the
//! terminal [`RunResult`]. State only ever advances along
//!
//! ```text
//!   Reserved ──▶ Initializing ──▶ Created ──▶ Running ──▶ Completed
//!       │              │             │           │            ▲
//!       └──────────────┴─────────────┴───────────┴────────────┘
//!                    (expire / stop / destroy / reap)
//! ```
//!
//! Mutation happens only through the transition methods; invalid moves
//! fail with [`Error::InvalidTransition`] and leave the value untouched.
//! Callers receive deep copies (`Clone`), so observed views never tear.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Capacity reserved; no run parameters attached yet.
    Reserved,
    /// Run parameters attached; sandbox not yet created.
    Initializing,
    /// Sandbox container exists; supervisor not yet started.
    Created,
    /// Supervised activities are up and the group signalled ready.
    Running,
    /// Terminal. `RunResult` is immutable from here on.
    Completed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reserved => write!(f, "reserved"),
            Self::Initializing => write!(f, "initializing"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Returns whether `from → to` is a legal forward transition.
fn valid_transition(from: ContainerState, to: ContainerState) -> bool {
    use ContainerState::*;
    match to {
        Reserved => false,
        Initializing => from == Reserved,
        Created => from == Initializing,
        Running => from == Created,
        // Completed is reachable from any non-terminal state.
        Completed => from != Completed,
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Scope of the container's disk quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskScope {
    /// Quota covers the container's total disk usage, rootfs included.
    #[default]
    Total,
    /// Quota covers only writes on top of the rootfs.
    Exclusive,
}

// =============================================================================
// Wire Types
// =============================================================================

/// An ordered environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    /// Creates an environment variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A host/container port pair, joined with its TLS-proxy counterpart.
///
/// Zero means "unset": a freshly requested mapping has only
/// `container_port`; the rest is resolved from the sandbox after Create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub container_tls_proxy_port: u16,
    pub host_tls_proxy_port: u16,
}

/// A volume to mount through the volume manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume driver name.
    pub driver: String,
    /// Driver-scoped volume identifier.
    pub volume_id: String,
    /// Opaque driver configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Mount point inside the container.
    pub container_path: String,
    /// `ro` or `rw`.
    pub mode: BindMountMode,
}

/// Mount mode for bind mounts and volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountMode {
    #[default]
    Ro,
    Rw,
}

/// A cached artifact to be downloaded before the sandbox is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDependency {
    pub name: String,
    /// Source URI.
    pub from: String,
    /// In-container destination path.
    pub to: String,
    /// Stable cache key; downloads with the same key are deduplicated.
    pub cache_key: String,
    /// Source label for the download's log lines.
    #[serde(default)]
    pub log_source: String,
}

/// An outbound-traffic allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    /// `tcp`, `udp`, `icmp`, or `all`.
    pub protocol: String,
    /// Destination CIDRs or ranges.
    pub destinations: Vec<String>,
    /// Allowed destination ports (TCP/UDP only).
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Log routing metadata for a container's app log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub guid: String,
    pub index: u32,
    pub source_name: String,
}

/// Terminal outcome of a container run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub failed: bool,
    pub failure_reason: String,
    /// Set as soon as a Stop is requested, even before completion.
    pub stopped: bool,
}

// =============================================================================
// Actions
// =============================================================================

/// One action to perform inside the sandbox, in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionSpec {
    /// Run a process inside the sandbox.
    Run(RunActionSpec),
}

/// Parameters of a [`ActionSpec::Run`] action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunActionSpec {
    /// Executable path inside the container.
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// User to run as; empty means the container default.
    #[serde(default)]
    pub user: String,
    /// Per-action timeout in milliseconds; 0 disables the timeout.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl RunActionSpec {
    /// The configured timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Reservation request: resources plus the facts known at allocation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// Relative CPU weight, 1..=100.
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub max_pids: u64,
    #[serde(default)]
    pub disk_scope: DiskScope,
    #[serde(default)]
    pub rootfs_path: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub network_properties: HashMap<String, String>,
}

/// Run parameters attached by Initialize, advancing Reserved → Initializing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub egress_rules: Vec<EgressRule>,
    #[serde(default)]
    pub log_config: LogConfig,
    #[serde(default)]
    pub cached_dependencies: Vec<CachedDependency>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub trusted_system_certificates_path: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub image_username: String,
    #[serde(default)]
    pub image_password: String,
}

// =============================================================================
// Container
// =============================================================================

/// The externally observable view of one container.
///
/// `Clone` is the deep copy handed to observers: every field is owned, so
/// a returned copy is independent of later mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub guid: String,
    pub state: ContainerState,
    pub allocated_at: DateTime<Utc>,

    // Resource reservation.
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_weight: u32,
    pub max_pids: u64,
    pub disk_scope: DiskScope,

    // Image.
    pub rootfs_path: String,
    pub image_username: String,
    pub image_password: String,
    pub privileged: bool,

    // Run parameters.
    pub env: Vec<EnvVar>,
    pub ports: Vec<PortMapping>,
    pub log_config: LogConfig,
    pub cached_dependencies: Vec<CachedDependency>,
    pub volume_mounts: Vec<VolumeMount>,
    pub egress_rules: Vec<EgressRule>,
    pub trusted_system_certificates_path: String,
    pub actions: Vec<ActionSpec>,
    pub network_properties: HashMap<String, String>,

    // Resolved after sandbox creation.
    pub external_ip: String,
    pub internal_ip: String,
    /// Memory limit in bytes as applied to the sandbox.
    pub memory_limit_bytes: u64,
    /// Disk limit in bytes as applied to the sandbox.
    pub disk_limit_bytes: u64,

    pub run_result: RunResult,
}

impl Container {
    /// Creates a freshly reserved container from an allocation request.
    #[must_use]
    pub fn reserve(guid: impl Into<String>, req: &AllocationRequest, now: DateTime<Utc>) -> Self {
        Self {
            guid: guid.into(),
            state: ContainerState::Reserved,
            allocated_at: now,
            memory_mb: req.memory_mb,
            disk_mb: req.disk_mb,
            cpu_weight: req.cpu_weight.clamp(
                crate::constants::MIN_CPU_WEIGHT,
                crate::constants::MAX_CPU_WEIGHT,
            ),
            max_pids: req.max_pids,
            disk_scope: req.disk_scope,
            rootfs_path: req.rootfs_path.clone(),
            image_username: String::new(),
            image_password: String::new(),
            privileged: false,
            env: Vec::new(),
            ports: req.ports.clone(),
            log_config: LogConfig::default(),
            cached_dependencies: Vec::new(),
            volume_mounts: Vec::new(),
            egress_rules: Vec::new(),
            trusted_system_certificates_path: String::new(),
            actions: Vec::new(),
            network_properties: req.network_properties.clone(),
            external_ip: String::new(),
            internal_ip: String::new(),
            memory_limit_bytes: 0,
            disk_limit_bytes: 0,
            run_result: RunResult::default(),
        }
    }

    /// Returns whether a transition from the current state to `to` is legal.
    #[must_use]
    pub fn validate_transition_to(&self, to: ContainerState) -> bool {
        valid_transition(self.state, to)
    }

    /// Attaches run parameters, advancing Reserved → Initializing.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] unless the container is Reserved.
    pub fn transition_to_initialize(&mut self, req: &RunRequest) -> Result<()> {
        if !valid_transition(self.state, ContainerState::Initializing) {
            return Err(Error::InvalidTransition);
        }
        self.state = ContainerState::Initializing;
        self.actions = req.actions.clone();
        self.env = req.env.clone();
        self.egress_rules = req.egress_rules.clone();
        self.log_config = req.log_config.clone();
        self.cached_dependencies = req.cached_dependencies.clone();
        self.volume_mounts = req.volume_mounts.clone();
        self.trusted_system_certificates_path = req.trusted_system_certificates_path.clone();
        self.privileged = req.privileged;
        self.image_username = req.image_username.clone();
        self.image_password = req.image_password.clone();
        Ok(())
    }

    /// Advances Initializing → Created.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] unless the container is Initializing.
    pub fn transition_to_create(&mut self) -> Result<()> {
        if !valid_transition(self.state, ContainerState::Created) {
            return Err(Error::InvalidTransition);
        }
        self.state = ContainerState::Created;
        Ok(())
    }

    /// Moves the container to the terminal Completed state.
    ///
    /// Returns `false` without mutating anything when the container is
    /// already Completed; the first completion wins and its `RunResult`
    /// is immutable afterwards.
    pub fn transition_to_complete(&mut self, failed: bool, reason: impl Into<String>) -> bool {
        if self.state == ContainerState::Completed {
            return false;
        }
        self.state = ContainerState::Completed;
        self.run_result.failed = failed;
        self.run_result.failure_reason = reason.into();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved() -> Container {
        Container::reserve(
            "g1",
            &AllocationRequest {
                memory_mb: 64,
                disk_mb: 128,
                cpu_weight: 50,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_forward_transitions_only() {
        use ContainerState::*;
        assert!(valid_transition(Reserved, Initializing));
        assert!(valid_transition(Initializing, Created));
        assert!(valid_transition(Created, Running));
        assert!(valid_transition(Running, Completed));
        assert!(valid_transition(Reserved, Completed));

        assert!(!valid_transition(Created, Initializing));
        assert!(!valid_transition(Completed, Running));
        assert!(!valid_transition(Completed, Completed));
        assert!(!valid_transition(Running, Reserved));
    }

    #[test]
    fn test_initialize_requires_reserved() {
        let mut c = reserved();
        c.transition_to_initialize(&RunRequest::default()).unwrap();
        assert_eq!(c.state, ContainerState::Initializing);

        let err = c
            .transition_to_initialize(&RunRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition));
        assert_eq!(c.state, ContainerState::Initializing);
    }

    #[test]
    fn test_complete_is_terminal_and_first_wins() {
        let mut c = reserved();
        assert!(c.transition_to_complete(true, "expired container"));
        assert!(!c.transition_to_complete(false, "second"));
        assert!(c.run_result.failed);
        assert_eq!(c.run_result.failure_reason, "expired container");
    }

    #[test]
    fn test_cpu_weight_clamped_on_reserve() {
        let c = Container::reserve(
            "g",
            &AllocationRequest {
                cpu_weight: 0,
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(c.cpu_weight, 1);
    }

    #[test]
    fn test_run_action_timeout_zero_disables() {
        let spec = RunActionSpec::default();
        assert!(spec.timeout().is_none());
        let spec = RunActionSpec {
            timeout_ms: 100,
            ..Default::default()
        };
        assert_eq!(spec.timeout(), Some(Duration::from_millis(100)));
    }
}
