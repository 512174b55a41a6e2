//! Shared fakes and harness for the integration suites.
//!
//! Every fake records the calls it receives and lets tests inject
//! failures through interior mutability, so a single harness instance
//! can be steered after the store is built.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use stevedore::capacity::ExecutorResources;
use stevedore::container::{
    ActionSpec, AllocationRequest, Container, ContainerState, EnvVar, RunActionSpec, RunRequest,
};
use stevedore::error::{Error, Result};
use stevedore::event::LifecycleEvent;
use stevedore::managers::{
    BindMountSet, CacheKey, CredManager, CredRotation, CredRotationSignal, DependencyManager,
    HostMount, ProxyManager, ProxyPortMapping, ProxyRunner, VolumeManager,
};
use stevedore::metrics::EngineMetrics;
use stevedore::sandbox::{
    ArchiveStream, MappedPort, ProcessPayload, ProcessStream, RunScript, SandboxError,
    SandboxInfo, SandboxProvider, SandboxResult, SandboxSpec, StreamOutSpec,
};
use stevedore::store::{ContainerStore, StoreConfig};
use stevedore::supervisor::{InterruptSignal, ReadySignal, Runner};

// =============================================================================
// Fake Sandbox Provider
// =============================================================================

#[derive(Default)]
pub struct FakeSandboxState {
    pub created: Vec<SandboxSpec>,
    pub destroyed: Vec<String>,
    pub run_scripts: Vec<RunScript>,
    pub info_calls: usize,

    pub create_error: Option<String>,
    /// Fail the Nth (1-based) info call.
    pub fail_info_call: Option<usize>,
    pub destroy_error: Option<SandboxError>,
    /// Exit status delivered by `run`; `None` keeps the stream open
    /// forever (a process that never produces output).
    pub run_exit_status: Option<u32>,
    /// Mapped ports returned by `info`; empty derives host = container.
    pub mapped_ports: Vec<MappedPort>,

    handles: Vec<String>,
    open_streams: Vec<mpsc::Sender<ProcessPayload>>,
}

#[derive(Default)]
pub struct FakeSandbox {
    pub state: Mutex<FakeSandboxState>,
}

impl FakeSandbox {
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn run_scripts(&self) -> Vec<RunScript> {
        self.state.lock().unwrap().run_scripts.clone()
    }

    /// Simulates the provider forgetting a container out from under us.
    pub fn drop_handle(&self, handle: &str) {
        self.state
            .lock()
            .unwrap()
            .handles
            .retain(|h| h != handle);
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = &state.create_error {
            return Err(SandboxError::Other(msg.clone()));
        }
        let handle = spec.handle.clone();
        state.created.push(spec);
        state.handles.push(handle.clone());
        Ok(handle)
    }

    async fn destroy(&self, handle: &str) -> SandboxResult<()> {
        let mut state = self.state.lock().unwrap();
        state.destroyed.push(handle.to_string());
        if let Some(err) = state.destroy_error.clone() {
            return Err(err);
        }
        state.handles.retain(|h| h != handle);
        Ok(())
    }

    async fn info(&self, handle: &str) -> SandboxResult<SandboxInfo> {
        let mut state = self.state.lock().unwrap();
        state.info_calls += 1;
        if state.fail_info_call == Some(state.info_calls) {
            return Err(SandboxError::Other("info failed".to_string()));
        }
        let spec = state
            .created
            .iter()
            .find(|s| s.handle == handle)
            .ok_or_else(|| SandboxError::ContainerNotFound(handle.to_string()))?;
        let mapped_ports = if state.mapped_ports.is_empty() {
            spec.net_in
                .iter()
                .map(|rule| MappedPort {
                    container_port: rule.container_port,
                    host_port: rule.container_port,
                })
                .collect()
        } else {
            state.mapped_ports.clone()
        };
        Ok(SandboxInfo {
            external_ip: "10.0.0.1".to_string(),
            container_ip: "172.16.0.2".to_string(),
            mapped_ports,
        })
    }

    async fn stream_out(
        &self,
        _handle: &str,
        _spec: StreamOutSpec,
    ) -> SandboxResult<ArchiveStream> {
        Ok(Box::new(tokio::io::empty()))
    }

    async fn run(&self, _handle: &str, script: RunScript) -> SandboxResult<ProcessStream> {
        let mut state = self.state.lock().unwrap();
        state.run_scripts.push(script);
        let (tx, rx) = mpsc::channel(1);
        match state.run_exit_status {
            Some(status) => {
                let _ = tx.try_send(ProcessPayload::Exited(status));
            }
            None => state.open_streams.push(tx),
        }
        Ok(rx)
    }

    async fn ping(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn list_handles(&self) -> SandboxResult<Vec<String>> {
        Ok(self.state.lock().unwrap().handles.clone())
    }
}

// =============================================================================
// Fake Dependency Manager
// =============================================================================

#[derive(Default)]
pub struct FakeDependencyManager {
    pub download_error: Mutex<Option<String>>,
    pub downloads: AtomicUsize,
    pub released: Mutex<Vec<Vec<CacheKey>>>,
}

impl FakeDependencyManager {
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

#[async_trait]
impl DependencyManager for FakeDependencyManager {
    async fn download_cached_dependencies(&self, container: &Container) -> Result<BindMountSet> {
        if let Some(msg) = self.download_error.lock().unwrap().clone() {
            return Err(Error::Dependency(msg));
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(BindMountSet {
            bind_mounts: Vec::new(),
            cache_keys: vec![CacheKey(format!("{}-deps", container.guid))],
        })
    }

    async fn release_cached_dependencies(&self, keys: Vec<CacheKey>) -> Result<()> {
        self.released.lock().unwrap().push(keys);
        Ok(())
    }
}

// =============================================================================
// Fake Volume Manager
// =============================================================================

#[derive(Default)]
pub struct FakeVolumeManager {
    pub mount_error: Mutex<Option<String>>,
    pub unmount_error: Mutex<Option<String>>,
    pub mounts: Mutex<Vec<(String, String)>>,
    pub unmounts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl VolumeManager for FakeVolumeManager {
    async fn mount(
        &self,
        driver: &str,
        volume_id: &str,
        _config: &serde_json::Value,
    ) -> Result<HostMount> {
        if let Some(msg) = self.mount_error.lock().unwrap().clone() {
            return Err(Error::Volume(msg));
        }
        self.mounts
            .lock()
            .unwrap()
            .push((driver.to_string(), volume_id.to_string()));
        Ok(HostMount {
            path: format!("/var/vcap/volumes/{driver}/{volume_id}"),
        })
    }

    async fn unmount(&self, driver: &str, volume_id: &str) -> Result<()> {
        if let Some(msg) = self.unmount_error.lock().unwrap().clone() {
            return Err(Error::Volume(msg));
        }
        self.unmounts
            .lock()
            .unwrap()
            .push((driver.to_string(), volume_id.to_string()));
        Ok(())
    }
}

// =============================================================================
// Fake Credential Manager
// =============================================================================

#[derive(Default)]
pub struct FakeCredManager {
    pub create_error: Mutex<Option<String>>,
    pub cred_dirs: AtomicUsize,
    /// Sender halves captured when a runner is built, so tests can push
    /// rotations or fail the running member on demand.
    rotation_tx: Mutex<Option<watch::Sender<CredRotation>>>,
    fail_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl FakeCredManager {
    /// Pushes a credential rotation to the proxy runner.
    pub fn rotate(&self, generation: u64) {
        if let Some(tx) = self.rotation_tx.lock().unwrap().as_ref() {
            let _ = tx.send(CredRotation { generation });
        }
    }

    /// Makes the running credential member exit with an error.
    pub fn fail_runner(&self, message: &str) {
        if let Some(tx) = self.fail_tx.lock().unwrap().take() {
            let _ = tx.send(message.to_string());
        }
    }
}

struct FakeCredRunner {
    fail_rx: oneshot::Receiver<String>,
}

#[async_trait]
impl Runner for FakeCredRunner {
    async fn run(
        mut self: Box<Self>,
        ready: ReadySignal,
        mut interrupt: InterruptSignal,
    ) -> Result<()> {
        ready.notify();
        tokio::select! {
            _ = interrupt.interrupted() => return Ok(()),
            msg = &mut self.fail_rx => {
                if let Ok(msg) = msg {
                    return Err(Error::Credential(msg));
                }
            }
        }
        // Harness dropped the failure trigger; park until interrupted.
        interrupt.interrupted().await;
        Ok(())
    }
}

#[async_trait]
impl CredManager for FakeCredManager {
    async fn create_cred_dir(
        &self,
        _container: &Container,
    ) -> Result<(Vec<stevedore::sandbox::BindMount>, Vec<EnvVar>)> {
        if let Some(msg) = self.create_error.lock().unwrap().clone() {
            return Err(Error::Credential(msg));
        }
        self.cred_dirs.fetch_add(1, Ordering::SeqCst);
        Ok((
            Vec::new(),
            vec![EnvVar::new("INSTANCE_CERT", "/etc/cf-instance-credentials/cert")],
        ))
    }

    fn runner(&self, _container: &Container) -> (Box<dyn Runner>, CredRotationSignal) {
        let (rotation_tx, rotation_rx) = watch::channel(CredRotation::default());
        let (fail_tx, fail_rx) = oneshot::channel();
        *self.rotation_tx.lock().unwrap() = Some(rotation_tx);
        *self.fail_tx.lock().unwrap() = Some(fail_tx);
        (Box::new(FakeCredRunner { fail_rx }), rotation_rx)
    }
}

// =============================================================================
// Fake Proxy Manager
// =============================================================================

#[derive(Default)]
pub struct FakeProxyManager {
    pub mappings: Mutex<Vec<ProxyPortMapping>>,
    pub extra_ports: Mutex<Vec<u16>>,
    pub lds_port: Mutex<u16>,
    /// Last rotation generation the proxy runner observed.
    pub observed_rotation: Arc<Mutex<u64>>,
}

impl FakeProxyManager {
    pub fn set_proxy_ports(&self, mappings: Vec<ProxyPortMapping>, extra: Vec<u16>) {
        *self.mappings.lock().unwrap() = mappings;
        *self.extra_ports.lock().unwrap() = extra;
    }
}

struct FakeProxyRunner {
    rotations: CredRotationSignal,
    observed: Arc<Mutex<u64>>,
}

#[async_trait]
impl Runner for FakeProxyRunner {
    async fn run(
        mut self: Box<Self>,
        ready: ReadySignal,
        mut interrupt: InterruptSignal,
    ) -> Result<()> {
        ready.notify();
        loop {
            let changed = tokio::select! {
                _ = interrupt.interrupted() => return Ok(()),
                changed = self.rotations.changed() => changed,
            };
            if changed.is_err() {
                // Rotation source gone; park until interrupted.
                interrupt.interrupted().await;
                return Ok(());
            }
            *self.observed.lock().unwrap() = self.rotations.borrow().generation;
        }
    }
}

#[async_trait]
impl ProxyManager for FakeProxyManager {
    async fn bind_mounts(
        &self,
        _container: &Container,
    ) -> Result<Vec<stevedore::sandbox::BindMount>> {
        Ok(Vec::new())
    }

    fn proxy_ports(&self, _container: &Container) -> (Vec<ProxyPortMapping>, Vec<u16>) {
        (
            self.mappings.lock().unwrap().clone(),
            self.extra_ports.lock().unwrap().clone(),
        )
    }

    fn runner(
        &self,
        _container: &Container,
        rotations: CredRotationSignal,
    ) -> Result<ProxyRunner> {
        Ok(ProxyRunner {
            runner: Box::new(FakeProxyRunner {
                rotations,
                observed: Arc::clone(&self.observed_rotation),
            }),
            lds_port: *self.lds_port.lock().unwrap(),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub store: Arc<ContainerStore>,
    pub provider: Arc<FakeSandbox>,
    pub dependencies: Arc<FakeDependencyManager>,
    pub volumes: Arc<FakeVolumeManager>,
    pub credentials: Arc<FakeCredManager>,
    pub proxy: Arc<FakeProxyManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default(), default_capacity())
    }

    pub fn with_config(config: StoreConfig, capacity: ExecutorResources) -> Self {
        let provider = Arc::new(FakeSandbox::default());
        {
            // Processes exit 0 unless a test says otherwise.
            provider.state.lock().unwrap().run_exit_status = Some(0);
        }
        let dependencies = Arc::new(FakeDependencyManager::default());
        let volumes = Arc::new(FakeVolumeManager::default());
        let credentials = Arc::new(FakeCredManager::default());
        let proxy = Arc::new(FakeProxyManager::default());

        let store = Arc::new(ContainerStore::new(
            config,
            capacity,
            Arc::clone(&provider) as Arc<dyn SandboxProvider>,
            Arc::clone(&dependencies) as Arc<dyn DependencyManager>,
            Arc::clone(&volumes) as Arc<dyn VolumeManager>,
            Arc::clone(&credentials) as Arc<dyn CredManager>,
            Arc::clone(&proxy) as Arc<dyn ProxyManager>,
            Arc::new(EngineMetrics::unregistered()),
        ));

        Self {
            store,
            provider,
            dependencies,
            volumes,
            credentials,
            proxy,
        }
    }

    /// Allocates, initializes, and creates `guid` with one echo action.
    pub async fn created_container(&self, guid: &str) -> Container {
        self.store.reserve(guid, &alloc_request()).unwrap();
        self.store.initialize(guid, &run_request()).unwrap();
        self.store.create(guid).await.unwrap();
        self.store.get(guid).unwrap()
    }
}

// =============================================================================
// Request Builders
// =============================================================================

pub fn default_capacity() -> ExecutorResources {
    ExecutorResources {
        memory_mb: 1024,
        disk_mb: 1024,
        containers: 42,
    }
}

pub fn alloc_request() -> AllocationRequest {
    AllocationRequest {
        memory_mb: 64,
        disk_mb: 128,
        cpu_weight: 50,
        max_pids: 1024,
        rootfs_path: "docker:///cloudfoundry/cflinuxfs".to_string(),
        ..Default::default()
    }
}

pub fn run_request() -> RunRequest {
    run_request_with_actions(vec![echo_action(0)])
}

pub fn run_request_with_actions(actions: Vec<ActionSpec>) -> RunRequest {
    RunRequest {
        actions,
        env: vec![EnvVar::new("VCAP_APPLICATION", "{}")],
        ..Default::default()
    }
}

pub fn echo_action(timeout_ms: u64) -> ActionSpec {
    ActionSpec::Run(RunActionSpec {
        path: "/bin/echo".to_string(),
        args: vec!["hi".to_string()],
        timeout_ms,
        ..Default::default()
    })
}

// =============================================================================
// Event Helpers
// =============================================================================

/// Receives the next event within two seconds or panics.
pub async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a lifecycle event")
        .expect("event hub closed")
}

/// Polls the store until `guid` reaches `state` or two seconds pass.
pub async fn wait_for_state(store: &ContainerStore, guid: &str, state: ContainerState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = store.get(guid).ok().map(|c| c.state);
        if current == Some(state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("container {guid} never reached {state}; currently {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
