//! Contracts of the cooperating managers consumed by the store.
//!
//! Each manager owns one concern around the sandbox: cached artifacts,
//! volume mounts, instance credentials, and the outbound-proxy sidecar.
//! The store composes them but never looks inside. The `Noop*`
//! implementations at the bottom wire a standalone engine with all four
//! concerns disabled.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::container::{Container, EnvVar};
use crate::error::{Error, Result};
use crate::sandbox::BindMount;
use crate::supervisor::{IdleRunner, Runner};

// =============================================================================
// Dependency Manager
// =============================================================================

/// Opaque handle returned at download time, required at release time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

/// Result of downloading a container's cached dependencies.
#[derive(Default)]
pub struct BindMountSet {
    /// Bind mounts to add to the sandbox spec.
    pub bind_mounts: Vec<BindMount>,
    /// Keys to hand back on release.
    pub cache_keys: Vec<CacheKey>,
}

/// Downloads cached artifacts and yields their bind mounts.
#[async_trait]
pub trait DependencyManager: Send + Sync {
    /// Downloads every cached dependency of `container`.
    async fn download_cached_dependencies(&self, container: &Container) -> Result<BindMountSet>;

    /// Releases previously downloaded artifacts.
    async fn release_cached_dependencies(&self, keys: Vec<CacheKey>) -> Result<()>;
}

// =============================================================================
// Volume Manager
// =============================================================================

/// A volume resolved to a host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMount {
    pub path: String,
}

/// Mounts and unmounts volumes by driver and volume id.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn mount(
        &self,
        driver: &str,
        volume_id: &str,
        config: &serde_json::Value,
    ) -> Result<HostMount>;

    async fn unmount(&self, driver: &str, volume_id: &str) -> Result<()>;
}

// =============================================================================
// Credential Manager
// =============================================================================

/// Notification that the instance credentials were rotated.
///
/// Carried on a `watch` channel: intermediate ticks coalesce, but the
/// most recent rotation is always observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredRotation {
    pub generation: u64,
}

/// Receiver side of the rotation channel.
pub type CredRotationSignal = watch::Receiver<CredRotation>;

/// Provisions per-container credentials and keeps them fresh.
#[async_trait]
pub trait CredManager: Send + Sync {
    /// Creates the credentials directory; returns its bind mounts and
    /// the environment additions the container needs to find it.
    async fn create_cred_dir(&self, container: &Container)
        -> Result<(Vec<BindMount>, Vec<EnvVar>)>;

    /// Returns the long-lived rotation runner plus the signal channel
    /// the proxy runner listens on.
    fn runner(&self, container: &Container) -> (Box<dyn Runner>, CredRotationSignal);
}

// =============================================================================
// Proxy Manager
// =============================================================================

/// One app-port → proxy-port association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPortMapping {
    pub app_port: u16,
    pub proxy_port: u16,
}

/// The proxy-configuration runner plus the LDS port it will publish.
pub struct ProxyRunner {
    pub runner: Box<dyn Runner>,
    /// Port the sidecar's configuration-discovery endpoint listens on.
    pub lds_port: u16,
}

/// Configures the outbound-proxy sidecar for a container.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Extra bind mounts the sidecar needs inside the sandbox.
    async fn bind_mounts(&self, container: &Container) -> Result<Vec<BindMount>>;

    /// The authoritative proxy-port mapping, plus extra container ports
    /// to open for the sidecar itself.
    fn proxy_ports(&self, container: &Container) -> (Vec<ProxyPortMapping>, Vec<u16>);

    /// Returns the long-lived configuration runner. It reconfigures the
    /// sidecar whenever `rotations` observes a new credential generation.
    fn runner(&self, container: &Container, rotations: CredRotationSignal)
        -> Result<ProxyRunner>;
}

// =============================================================================
// No-op Implementations
// =============================================================================

/// Dependency manager for containers without cached dependencies.
pub struct NoopDependencyManager;

#[async_trait]
impl DependencyManager for NoopDependencyManager {
    async fn download_cached_dependencies(&self, container: &Container) -> Result<BindMountSet> {
        if container.cached_dependencies.is_empty() {
            return Ok(BindMountSet::default());
        }
        Err(Error::Dependency(
            "no artifact cache configured".to_string(),
        ))
    }

    async fn release_cached_dependencies(&self, _keys: Vec<CacheKey>) -> Result<()> {
        Ok(())
    }
}

/// Volume manager that refuses every mount.
pub struct NoopVolumeManager;

#[async_trait]
impl VolumeManager for NoopVolumeManager {
    async fn mount(
        &self,
        driver: &str,
        _volume_id: &str,
        _config: &serde_json::Value,
    ) -> Result<HostMount> {
        Err(Error::NotSupported(format!(
            "volume driver not available: {driver}"
        )))
    }

    async fn unmount(&self, _driver: &str, _volume_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Credential manager that provisions nothing and never rotates.
pub struct NoopCredManager;

#[async_trait]
impl CredManager for NoopCredManager {
    async fn create_cred_dir(
        &self,
        _container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvVar>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn runner(&self, _container: &Container) -> (Box<dyn Runner>, CredRotationSignal) {
        let (tx, rx) = watch::channel(CredRotation::default());
        // The sender lives inside the runner so the channel stays open
        // for the lifetime of the container.
        (Box::new(HoldingIdleRunner { _rotations: tx }), rx)
    }
}

/// [`IdleRunner`] that additionally keeps the rotation sender alive.
struct HoldingIdleRunner {
    _rotations: watch::Sender<CredRotation>,
}

#[async_trait]
impl Runner for HoldingIdleRunner {
    async fn run(
        self: Box<Self>,
        ready: crate::supervisor::ReadySignal,
        mut interrupt: crate::supervisor::InterruptSignal,
    ) -> Result<()> {
        ready.notify();
        interrupt.interrupted().await;
        Ok(())
    }
}

/// Proxy manager for containers without a sidecar.
pub struct NoopProxyManager;

#[async_trait]
impl ProxyManager for NoopProxyManager {
    async fn bind_mounts(&self, _container: &Container) -> Result<Vec<BindMount>> {
        Ok(Vec::new())
    }

    fn proxy_ports(&self, _container: &Container) -> (Vec<ProxyPortMapping>, Vec<u16>) {
        (Vec::new(), Vec::new())
    }

    fn runner(
        &self,
        _container: &Container,
        _rotations: CredRotationSignal,
    ) -> Result<ProxyRunner> {
        Ok(ProxyRunner {
            runner: Box::new(IdleRunner),
            lds_port: 0,
        })
    }
}
