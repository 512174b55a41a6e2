//! Sandbox provider contract.
//!
//! The engine never isolates anything itself; it drives an external
//! provider through this seam. Implementations realize containers with
//! whatever mechanism they like (namespaces, microVMs); the engine only
//! relies on the operations and the two distinguished error kinds below.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::container::{BindMountMode, EnvVar};

/// Result type for provider operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by a sandbox provider.
///
/// `ContainerNotFound` and `ConcurrentDestroy` are distinguished because
/// Destroy treats them as success; everything else is opaque.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The provider does not know the referenced container.
    #[error("sandbox container not found: {0}")]
    ContainerNotFound(String),

    /// Another destroy for the same handle is already in flight.
    #[error("sandbox container is already being destroyed: {0}")]
    ConcurrentDestroy(String),

    /// Any other provider failure.
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Spec Types
// =============================================================================

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

impl BindMount {
    /// Creates a read-only host bind mount.
    #[must_use]
    pub fn read_only(src_path: impl Into<String>, dst_path: impl Into<String>) -> Self {
        Self {
            src_path: src_path.into(),
            dst_path: dst_path.into(),
            mode: BindMountMode::Ro,
        }
    }
}

/// Image reference with optional registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub uri: String,
    pub username: String,
    pub password: String,
}

/// Disk quota for the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLimits {
    pub byte_hard: u64,
    pub inode_hard: u64,
    /// `true` limits total usage including the rootfs.
    pub total_scope: bool,
}

/// Resource limits applied at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub disk: DiskLimits,
    pub pid_max: u64,
    pub cpu_shares: u64,
}

/// An inbound port to map; `host_port` 0 asks the provider to choose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInRule {
    pub host_port: u16,
    pub container_port: u16,
}

/// An outbound-traffic allowance, converted from an egress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetOutRule {
    pub protocol: NetOutProtocol,
    pub destinations: Vec<String>,
    pub ports: Vec<u16>,
}

/// Protocols a [`NetOutRule`] can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetOutProtocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// Everything the provider needs to create one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Provider-side handle; the engine always uses the container GUID.
    pub handle: String,
    pub privileged: bool,
    pub image: ImageRef,
    pub env: Vec<EnvVar>,
    pub bind_mounts: Vec<BindMount>,
    pub limits: SandboxLimits,
    pub net_in: Vec<NetInRule>,
    pub net_out: Vec<NetOutRule>,
    pub properties: HashMap<String, String>,
}

// =============================================================================
// Info Types
// =============================================================================

/// A resolved container-port → host-port assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedPort {
    pub host_port: u16,
    pub container_port: u16,
}

/// Runtime facts about a created container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub external_ip: String,
    pub container_ip: String,
    pub mapped_ports: Vec<MappedPort>,
}

// =============================================================================
// Process Streaming
// =============================================================================

/// Script to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScript {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    /// User to run as; empty means the container default.
    pub user: String,
}

/// One payload from a running process's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessPayload {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Final payload; the stream ends after this.
    Exited(u32),
}

/// Receiver side of a process's payload stream.
pub type ProcessStream = mpsc::Receiver<ProcessPayload>;

/// Arguments to [`SandboxProvider::stream_out`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOutSpec {
    /// Path inside the container to archive.
    pub path: String,
    /// User to impersonate while reading.
    pub user: String,
}

/// Byte stream of the archived filesystem subtree.
pub type ArchiveStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

// =============================================================================
// Provider Trait
// =============================================================================

/// The external component that realizes containers.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Creates a container and returns its handle.
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<String>;

    /// Destroys the container with the given handle.
    async fn destroy(&self, handle: &str) -> SandboxResult<()>;

    /// Returns runtime facts about a created container.
    async fn info(&self, handle: &str) -> SandboxResult<SandboxInfo>;

    /// Streams an archive of `spec.path` out of the container filesystem.
    async fn stream_out(&self, handle: &str, spec: StreamOutSpec) -> SandboxResult<ArchiveStream>;

    /// Starts a process inside the container and returns its payload stream.
    async fn run(&self, handle: &str, script: RunScript) -> SandboxResult<ProcessStream>;

    /// Liveness check of the provider itself.
    async fn ping(&self) -> SandboxResult<()>;

    /// Handles of every container the provider currently knows about.
    /// Used by startup/periodic reconciliation.
    async fn list_handles(&self) -> SandboxResult<Vec<String>>;
}
