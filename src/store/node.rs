//! Per-container store node: the state machine at the heart of the
//! engine.
//!
//! A node owns one [`Container`] and mediates every interaction with the
//! sandbox provider and the cooperating managers. Two locks keep it
//! coherent:
//!
//! - the **info lock** (`std::sync::Mutex`) guards the container view,
//!   the sandbox handle, and the cache keys. It is never held across
//!   blocking I/O, so `info()` observers never wait on the provider.
//! - the **op lock** (`tokio::sync::Mutex`) serializes Create / Run /
//!   Stop / Destroy, and is held across provider I/O, including the
//!   supervisor drain inside Destroy, since no other lifecycle call is
//!   legal during teardown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::constants::{
    CONTAINER_EXPIRED, CONTAINER_INITIALIZATION_FAILED, CONTAINER_MISSING,
    CONTAINER_OWNER_PROPERTY, CRED_DIR_FAILED, CRED_RUNNER_MEMBER,
    DOWNLOAD_CACHED_DEPENDENCIES_FAILED, HEALTHCHECK_DST_PATH, NETWORK_PROPERTY_PREFIX,
    PROXY_RUNNER_MEMBER, STEPS_RUNNER_MEMBER, STOPPED_BEFORE_RUNNING, TRUSTED_CERTS_ENV,
    VOLUME_MOUNT_FAILED,
};
use crate::container::{Container, ContainerState, DiskScope, EgressRule, EnvVar, PortMapping,
    RunRequest};
use crate::error::{Error, Result};
use crate::event::LifecycleEvent;
use crate::managers::{CacheKey, ProxyPortMapping};
use crate::metrics::Outcome;
use crate::sandbox::{
    ArchiveStream, BindMount, DiskLimits, ImageRef, NetInRule, NetOutProtocol, NetOutRule,
    SandboxError, SandboxInfo, SandboxLimits, SandboxSpec, StreamOutSpec,
};
use crate::supervisor::{GroupResult, Member, OrderedGroup, ProcessHandle};
use crate::transform::StepsConfig;

use super::{Collaborators, StoreConfig};

/// State guarded by the info lock.
struct NodeInner {
    info: Container,
    /// Provider-side handle; present once Create succeeded.
    handle: Option<String>,
    /// Cache keys recorded on Create success, released on Destroy.
    cache_keys: Vec<CacheKey>,
}

/// The per-container state machine.
pub struct StoreNode {
    config: Arc<StoreConfig>,
    deps: Arc<Collaborators>,
    inner: Mutex<NodeInner>,
    op_lock: tokio::sync::Mutex<()>,
    /// Supervisor handle, present once Run has been requested.
    process: Mutex<Option<ProcessHandle>>,
}

impl StoreNode {
    pub(crate) fn new(
        config: Arc<StoreConfig>,
        deps: Arc<Collaborators>,
        container: Container,
    ) -> Self {
        Self {
            config,
            deps,
            inner: Mutex::new(NodeInner {
                info: container,
                handle: None,
                cache_keys: Vec::new(),
            }),
            op_lock: tokio::sync::Mutex::new(()),
            process: Mutex::new(None),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Returns a deep copy of the current container view.
    #[must_use]
    pub fn info(&self) -> Container {
        self.inner.lock().unwrap().info.clone()
    }

    /// Streams an archive of `path` out of the sandbox filesystem,
    /// impersonating root.
    ///
    /// # Errors
    ///
    /// [`Error::ContainerNotFound`] when no sandbox handle is attached.
    pub async fn get_files(&self, path: &str) -> Result<ArchiveStream> {
        let handle = self.inner.lock().unwrap().handle.clone();
        let Some(handle) = handle else {
            return Err(Error::ContainerNotFound);
        };
        Ok(self
            .deps
            .provider
            .stream_out(
                &handle,
                StreamOutSpec {
                    path: path.to_string(),
                    user: "root".to_string(),
                },
            )
            .await?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Attaches run parameters, advancing Reserved → Initializing.
    pub fn initialize(&self, req: &RunRequest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.info.transition_to_initialize(req)
    }

    /// Resolves every bind mount, creates the sandbox container, and
    /// advances Initializing → Created.
    ///
    /// Failures before the provider call complete the node with a
    /// categorical reason; the underlying error is returned either way.
    pub async fn create(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let mut info = self.info();
        if !info.validate_transition_to(ContainerState::Created) {
            return Err(Error::InvalidTransition);
        }
        let guid = info.guid.clone();

        let mount_set = match self.deps.dependencies.download_cached_dependencies(&info).await {
            Ok(set) => set,
            Err(err) => {
                tracing::error!(guid = %guid, error = %err, "failed to download cached dependencies");
                self.complete(true, DOWNLOAD_CACHED_DEPENDENCIES_FAILED);
                return Err(err);
            }
        };
        let mut bind_mounts = mount_set.bind_mounts;

        if !self.config.host_trusted_certificates_path.is_empty()
            && !info.trusted_system_certificates_path.is_empty()
        {
            bind_mounts.push(BindMount::read_only(
                &self.config.host_trusted_certificates_path,
                &info.trusted_system_certificates_path,
            ));
            info.env.push(EnvVar::new(
                TRUSTED_CERTS_ENV,
                info.trusted_system_certificates_path.clone(),
            ));
        }

        match self.mount_volumes(&info).await {
            Ok(mounts) => bind_mounts.extend(mounts),
            Err(err) => {
                tracing::error!(guid = %guid, error = %err, "failed to mount volume");
                self.complete(true, VOLUME_MOUNT_FAILED);
                return Err(err);
            }
        }

        bind_mounts.extend(self.deps.proxy.bind_mounts(&info).await?);

        match self.deps.credentials.create_cred_dir(&info).await {
            Ok((mounts, envs)) => {
                bind_mounts.extend(mounts);
                info.env.extend(envs);
            }
            Err(err) => {
                tracing::error!(guid = %guid, error = %err, "failed to create credentials directory");
                self.complete(true, CRED_DIR_FAILED);
                return Err(err);
            }
        }

        if self.config.healthcheck_enabled {
            bind_mounts.push(BindMount::read_only(
                &self.config.healthcheck_path,
                HEALTHCHECK_DST_PATH,
            ));
        }

        let handle = match self.create_in_sandbox(&mut info, bind_mounts).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(guid = %guid, error = %err, "failed to create sandbox container");
                self.complete(true, CONTAINER_INITIALIZATION_FAILED);
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.handle = Some(handle);
            inner.info = info;
            inner.cache_keys = mount_set.cache_keys;
        }
        Ok(())
    }

    /// Composes the credential, proxy, and steps runners into an ordered
    /// group and launches it; the node transitions to Running once the
    /// group signals ready and to Completed when it exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let (info, handle) = {
            let inner = self.inner.lock().unwrap();
            if inner.info.state != ContainerState::Created {
                return Err(Error::InvalidTransition);
            }
            (inner.info.clone(), inner.handle.clone())
        };
        let handle = handle.ok_or(Error::ContainerNotFound)?;

        let (cred_runner, rotations) = self.deps.credentials.runner(&info);
        let proxy_runner = match self.deps.proxy.runner(&info, rotations) {
            Ok(runner) => runner,
            Err(err) => {
                self.complete(true, err.to_string());
                return Err(err);
            }
        };

        let steps = self.deps.transformer.steps_runner(
            &info,
            &handle,
            StepsConfig {
                lds_port: proxy_runner.lds_port,
            },
        )?;

        let group = OrderedGroup::new(vec![
            Member::new(CRED_RUNNER_MEMBER, cred_runner),
            Member::new(PROXY_RUNNER_MEMBER, proxy_runner.runner),
            Member::new(STEPS_RUNNER_MEMBER, steps),
        ]);
        let process = group.spawn();
        *self.process.lock().unwrap() = Some(process.clone());

        let node = Arc::clone(&self);
        tokio::spawn(async move {
            node.monitor(process).await;
        });
        Ok(())
    }

    async fn monitor(self: Arc<Self>, process: ProcessHandle) {
        if process.ready().await {
            let info = {
                let mut inner = self.inner.lock().unwrap();
                inner.info.state = ContainerState::Running;
                inner.info.clone()
            };
            tracing::info!(guid = %info.guid, "container running");
            self.deps.events.emit(LifecycleEvent::Running(info));
        }

        let result = process.wait().await;
        self.complete_with_group_result(result);
    }

    /// Flags the run result as stopped and interrupts the supervisor;
    /// completes directly when no supervisor was ever attached.
    /// Idempotent past the first call.
    pub async fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked();
        Ok(())
    }

    fn stop_locked(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.info.run_result.stopped = true;
        }
        let process = self.process.lock().unwrap().clone();
        match process {
            Some(process) => {
                process.signal_interrupt();
                tracing::debug!(guid = %self.guid(), "signalled supervisor");
            }
            None => self.complete(true, STOPPED_BEFORE_RUNNING),
        }
    }

    /// Stops the node, destroys the sandbox container, and releases
    /// cached dependencies and volume mounts.
    ///
    /// Cleanup is best-effort: release/unmount failures coalesce into a
    /// single [`Error::BindMountCleanup`]; a sandbox that is already
    /// gone or concurrently being destroyed is not a failure.
    pub async fn destroy(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;

        self.stop_locked();
        let process = self.process.lock().unwrap().clone();
        if let Some(process) = process {
            let _ = process.wait().await;
        }

        self.destroy_sandbox().await?;

        let (guid, volume_mounts, cache_keys) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.info.guid.clone(),
                inner.info.volume_mounts.clone(),
                std::mem::take(&mut inner.cache_keys),
            )
        };

        let mut cleanup_failed = false;
        if !cache_keys.is_empty() {
            if let Err(err) = self
                .deps
                .dependencies
                .release_cached_dependencies(cache_keys)
                .await
            {
                tracing::error!(guid = %guid, error = %err, "failed to release cached dependencies");
                cleanup_failed = true;
            }
        }
        for volume in &volume_mounts {
            if let Err(err) = self
                .deps
                .volumes
                .unmount(&volume.driver, &volume.volume_id)
                .await
            {
                tracing::error!(
                    guid = %guid,
                    driver = %volume.driver,
                    volume_id = %volume.volume_id,
                    error = %err,
                    "failed to unmount volume"
                );
                cleanup_failed = true;
            }
        }

        if cleanup_failed {
            Err(Error::BindMountCleanup)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Completes a Reserved container whose reservation has lapsed.
    /// Returns whether the node expired.
    pub fn expire(&self, now: DateTime<Utc>) -> bool {
        let event_info = {
            let mut inner = self.inner.lock().unwrap();
            if inner.info.state != ContainerState::Reserved {
                return false;
            }
            let lifespan = now.signed_duration_since(inner.info.allocated_at);
            let lapsed = lifespan
                .to_std()
                .is_ok_and(|d| d >= self.config.reserved_expiration_time);
            if !lapsed {
                return false;
            }
            inner
                .info
                .transition_to_complete(true, CONTAINER_EXPIRED)
                .then(|| inner.info.clone())
        };
        match event_info {
            Some(info) => {
                tracing::info!(guid = %info.guid, "reservation expired");
                self.deps.events.emit(LifecycleEvent::Completed(info));
                true
            }
            None => false,
        }
    }

    /// Completes a Created container whose sandbox handle is gone.
    /// Returns whether the node was reaped.
    pub fn reap(&self) -> bool {
        let event_info = {
            let mut inner = self.inner.lock().unwrap();
            if inner.info.state != ContainerState::Created || inner.handle.is_some() {
                return false;
            }
            inner
                .info
                .transition_to_complete(true, CONTAINER_MISSING)
                .then(|| inner.info.clone())
        };
        match event_info {
            Some(info) => {
                tracing::info!(guid = %info.guid, "reaped container missing from sandbox provider");
                self.deps.events.emit(LifecycleEvent::Completed(info));
                true
            }
            None => false,
        }
    }

    /// Detaches the sandbox handle after the provider reported the
    /// container gone; the next [`StoreNode::reap`] then completes it.
    pub fn detach_handle(&self) {
        self.inner.lock().unwrap().handle = None;
    }

    // =========================================================================
    // Completion
    // =========================================================================

    fn complete(&self, failed: bool, reason: impl Into<String>) {
        let event_info = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .info
                .transition_to_complete(failed, reason)
                .then(|| inner.info.clone())
        };
        if let Some(info) = event_info {
            tracing::info!(
                guid = %info.guid,
                failed,
                reason = %info.run_result.failure_reason,
                "container completed"
            );
            self.deps.events.emit(LifecycleEvent::Completed(info));
        }
    }

    fn complete_with_group_result(&self, result: GroupResult) {
        match result {
            Ok(()) => self.complete(false, String::new()),
            Err(err) => {
                // The steps runner's errors are user-facing and surface
                // verbatim; other members get a name prefix.
                let reason = if err.member == STEPS_RUNNER_MEMBER {
                    err.message
                } else {
                    format!("{} exited: {}", err.member, err.message)
                };
                self.complete(true, reason);
            }
        }
    }

    // =========================================================================
    // Sandbox Interaction
    // =========================================================================

    async fn mount_volumes(&self, info: &Container) -> Result<Vec<BindMount>> {
        let mut mounts = Vec::with_capacity(info.volume_mounts.len());
        for volume in &info.volume_mounts {
            let host = self
                .deps
                .volumes
                .mount(&volume.driver, &volume.volume_id, &volume.config)
                .await?;
            mounts.push(BindMount {
                src_path: host.path,
                dst_path: volume.container_path.clone(),
                mode: volume.mode,
            });
        }
        Ok(mounts)
    }

    async fn create_in_sandbox(
        &self,
        info: &mut Container,
        bind_mounts: Vec<BindMount>,
    ) -> Result<String> {
        let net_out = convert_egress_rules(&info.egress_rules)?;

        let (proxy_mappings, extra_ports) = self.deps.proxy.proxy_ports(info);
        for port in extra_ports {
            info.ports.push(PortMapping {
                container_port: port,
                ..Default::default()
            });
        }

        let net_in = info
            .ports
            .iter()
            .map(|p| NetInRule {
                host_port: p.host_port,
                container_port: p.container_port,
            })
            .collect();

        let limits = SandboxLimits {
            memory_bytes: info.memory_mb * 1024 * 1024,
            disk: DiskLimits {
                byte_hard: info.disk_mb * 1024 * 1024,
                inode_hard: self.config.inode_limit,
                total_scope: info.disk_scope == DiskScope::Total,
            },
            pid_max: info.max_pids,
            cpu_shares: cpu_shares(self.config.max_cpu_shares, info.cpu_weight),
        };

        let spec = SandboxSpec {
            handle: info.guid.clone(),
            privileged: info.privileged,
            image: ImageRef {
                uri: info.rootfs_path.clone(),
                username: info.image_username.clone(),
                password: info.image_password.clone(),
            },
            env: info.env.clone(),
            bind_mounts,
            limits,
            net_in,
            net_out,
            properties: self.sandbox_properties(info),
        };

        let start = Instant::now();
        let handle = match self.deps.provider.create(spec).await {
            Ok(handle) => {
                let took = start.elapsed();
                tracing::info!(guid = %info.guid, took = ?took, "created container in sandbox provider");
                self.deps.metrics.observe_creation(Outcome::Succeeded, took);
                handle
            }
            Err(err) => {
                let took = start.elapsed();
                tracing::error!(guid = %info.guid, took = ?took, error = %err, "sandbox provider failed to create container");
                self.deps.metrics.observe_creation(Outcome::Failed, took);
                return Err(err.into());
            }
        };

        let sandbox_info = self.deps.provider.info(&handle).await?;
        info.ports = port_mappings_from_info(&sandbox_info, &proxy_mappings);

        match self.deps.provider.info(&handle).await {
            Ok(sandbox_info) => {
                info.external_ip = sandbox_info.external_ip;
                info.internal_ip = sandbox_info.container_ip;
            }
            Err(err) => {
                tracing::error!(guid = %info.guid, error = %err, "failed to fetch container IPs");
                let _ = self.destroy_sandbox().await;
                return Err(err.into());
            }
        }

        info.transition_to_create()?;
        info.memory_limit_bytes = limits.memory_bytes;
        info.disk_limit_bytes = limits.disk.byte_hard;
        Ok(handle)
    }

    async fn destroy_sandbox(&self) -> Result<()> {
        let guid = self.guid();
        let start = Instant::now();
        let result = self.deps.provider.destroy(&guid).await;
        let took = start.elapsed();

        match result {
            Ok(()) => {}
            Err(SandboxError::ContainerNotFound(_)) => {
                tracing::warn!(guid = %guid, "container already gone from sandbox provider");
            }
            Err(SandboxError::ConcurrentDestroy(_)) => {
                tracing::warn!(guid = %guid, "container destroy already in progress");
            }
            Err(err) => {
                tracing::error!(guid = %guid, took = ?took, error = %err, "sandbox provider failed to destroy container");
                self.deps.metrics.observe_destruction(Outcome::Failed, took);
                return Err(err.into());
            }
        }

        tracing::info!(guid = %guid, took = ?took, "destroyed container in sandbox provider");
        self.deps.metrics.observe_destruction(Outcome::Succeeded, took);
        Ok(())
    }

    fn sandbox_properties(&self, info: &Container) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        for (key, value) in &info.network_properties {
            properties.insert(format!("{NETWORK_PROPERTY_PREFIX}{key}"), value.clone());
        }
        properties.insert(
            CONTAINER_OWNER_PROPERTY.to_string(),
            self.config.owner_name.clone(),
        );
        properties
    }

    fn guid(&self) -> String {
        self.inner.lock().unwrap().info.guid.clone()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Shares granted to a container: ⌊max_shares · weight / 100⌋.
fn cpu_shares(max_shares: u64, weight: u32) -> u64 {
    max_shares * u64::from(weight) / 100
}

fn convert_egress_rules(rules: &[EgressRule]) -> Result<Vec<NetOutRule>> {
    rules
        .iter()
        .map(|rule| {
            let protocol = match rule.protocol.to_ascii_lowercase().as_str() {
                "tcp" => NetOutProtocol::Tcp,
                "udp" => NetOutProtocol::Udp,
                "icmp" => NetOutProtocol::Icmp,
                "all" | "" => NetOutProtocol::All,
                other => {
                    return Err(Error::InvalidEgressRule(format!(
                        "unknown protocol: {other}"
                    )))
                }
            };
            Ok(NetOutRule {
                protocol,
                destinations: rule.destinations.clone(),
                ports: rule.ports.clone(),
            })
        })
        .collect()
}

/// Joins the provider's resolved port assignments with the proxy-port
/// mapping: each app port pairs with its host port and its TLS-proxy
/// counterpart, and ports that *are* proxy ports are not listed on
/// their own.
fn port_mappings_from_info(
    info: &SandboxInfo,
    proxy_mappings: &[ProxyPortMapping],
) -> Vec<PortMapping> {
    let proxy_ports: HashSet<u16> = proxy_mappings.iter().map(|m| m.proxy_port).collect();
    let app_to_proxy: HashMap<u16, u16> = proxy_mappings
        .iter()
        .map(|m| (m.app_port, m.proxy_port))
        .collect();
    let container_to_host: HashMap<u16, u16> = info
        .mapped_ports
        .iter()
        .map(|p| (p.container_port, p.host_port))
        .collect();

    let mut ports = Vec::new();
    for mapped in &info.mapped_ports {
        if proxy_ports.contains(&mapped.container_port) {
            continue;
        }
        let container_tls_proxy_port = app_to_proxy
            .get(&mapped.container_port)
            .copied()
            .unwrap_or(0);
        let host_tls_proxy_port = if container_tls_proxy_port != 0 {
            container_to_host
                .get(&container_tls_proxy_port)
                .copied()
                .unwrap_or(0)
        } else {
            0
        };
        ports.push(PortMapping {
            host_port: mapped.host_port,
            container_port: mapped.container_port,
            container_tls_proxy_port,
            host_tls_proxy_port,
        });
    }
    ports.sort_by_key(|p| p.container_port);
    ports
}
