//! Guid-indexed collection of store nodes.
//!
//! The [`ContainerStore`] owns every live [`StoreNode`], the capacity
//! registry, and the collaborator set shared by all nodes. Lookups
//! clone the node `Arc` and drop the map lock before any lifecycle
//! call, so a slow Create on one container never blocks another.

mod node;

pub use node::StoreNode;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::capacity::{CapacityRegistry, ExecutorResources};
use crate::constants::{
    DEFAULT_INODE_LIMIT, DEFAULT_MAX_CPU_SHARES, DEFAULT_RESERVED_EXPIRATION,
};
use crate::container::{AllocationRequest, Container, ContainerState, RunRequest};
use crate::error::{Error, Result};
use crate::event::{EventHub, LifecycleEvent};
use crate::managers::{CredManager, DependencyManager, ProxyManager, VolumeManager};
use crate::metrics::EngineMetrics;
use crate::sandbox::{ArchiveStream, SandboxProvider};
use crate::transform::Transformer;

/// Store-wide configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Value of the owner property stamped on every sandbox container.
    pub owner_name: String,
    /// Hard inode limit applied to every container's disk quota.
    pub inode_limit: u64,
    /// Shares granted to a container with CPUWeight 100.
    pub max_cpu_shares: u64,
    /// How long a Reserved container may sit before Expire completes it.
    pub reserved_expiration_time: Duration,
    /// Mount the declarative healthcheck binary into every container.
    pub healthcheck_enabled: bool,
    /// Host path of the declarative healthcheck binary.
    pub healthcheck_path: String,
    /// Host path of the trusted-certificate bundle; empty disables
    /// certificate injection.
    pub host_trusted_certificates_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            owner_name: "executor".to_string(),
            inode_limit: DEFAULT_INODE_LIMIT,
            max_cpu_shares: DEFAULT_MAX_CPU_SHARES,
            reserved_expiration_time: DEFAULT_RESERVED_EXPIRATION,
            healthcheck_enabled: false,
            healthcheck_path: String::new(),
            host_trusted_certificates_path: String::new(),
        }
    }
}

/// Collaborator set shared by every node of one store.
pub(crate) struct Collaborators {
    pub provider: Arc<dyn SandboxProvider>,
    pub dependencies: Arc<dyn DependencyManager>,
    pub volumes: Arc<dyn VolumeManager>,
    pub credentials: Arc<dyn CredManager>,
    pub proxy: Arc<dyn ProxyManager>,
    pub transformer: Transformer,
    pub events: EventHub,
    pub metrics: Arc<EngineMetrics>,
}

/// The per-executor container store.
pub struct ContainerStore {
    config: Arc<StoreConfig>,
    deps: Arc<Collaborators>,
    capacity: CapacityRegistry,
    nodes: RwLock<HashMap<String, Arc<StoreNode>>>,
}

impl ContainerStore {
    /// Creates a store over the given capacity and collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StoreConfig,
        total_capacity: ExecutorResources,
        provider: Arc<dyn SandboxProvider>,
        dependencies: Arc<dyn DependencyManager>,
        volumes: Arc<dyn VolumeManager>,
        credentials: Arc<dyn CredManager>,
        proxy: Arc<dyn ProxyManager>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        metrics.set_remaining(total_capacity);
        let transformer = Transformer::new(Arc::clone(&provider));
        Self {
            config: Arc::new(config),
            deps: Arc::new(Collaborators {
                provider,
                dependencies,
                volumes,
                credentials,
                proxy,
                transformer,
                events: EventHub::new(),
                metrics,
            }),
            capacity: CapacityRegistry::new(total_capacity),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Reserves capacity for a new container and inserts its node in
    /// state Reserved. An empty `guid` gets a generated one.
    pub fn reserve(&self, guid: &str, req: &AllocationRequest) -> Result<Container> {
        let guid = if guid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            guid.to_string()
        };
        let resources = ExecutorResources::for_container(req.memory_mb, req.disk_mb);

        let container = {
            let mut nodes = self.nodes.write().unwrap();
            if nodes.contains_key(&guid) {
                return Err(Error::GuidAlreadyAllocated(guid));
            }
            self.capacity.allocate(resources)?;
            let container = Container::reserve(&guid, req, Utc::now());
            let node = Arc::new(StoreNode::new(
                Arc::clone(&self.config),
                Arc::clone(&self.deps),
                container.clone(),
            ));
            nodes.insert(guid.clone(), node);
            container
        };

        tracing::info!(guid = %guid, memory_mb = req.memory_mb, disk_mb = req.disk_mb, "reserved container");
        self.deps.metrics.set_remaining(self.capacity.remaining());
        self.deps
            .events
            .emit(LifecycleEvent::Reserved(container.clone()));
        Ok(container)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns a deep copy of one container's view.
    pub fn get(&self, guid: &str) -> Result<Container> {
        Ok(self.node(guid)?.info())
    }

    /// Returns deep copies of every container in the store.
    #[must_use]
    pub fn list(&self) -> Vec<Container> {
        let nodes: Vec<Arc<StoreNode>> =
            self.nodes.read().unwrap().values().cloned().collect();
        let mut infos: Vec<Container> = nodes.iter().map(|n| n.info()).collect();
        infos.sort_by(|a, b| a.guid.cmp(&b.guid));
        infos
    }

    /// Subscribes to lifecycle events of every container.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.deps.events.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Attaches run parameters to a Reserved container.
    pub fn initialize(&self, guid: &str, req: &RunRequest) -> Result<()> {
        self.node(guid)?.initialize(req)
    }

    /// Creates the sandbox container for an Initializing container.
    pub async fn create(&self, guid: &str) -> Result<()> {
        self.node(guid)?.create().await
    }

    /// Starts the supervised run of a Created container.
    pub async fn run(&self, guid: &str) -> Result<()> {
        self.node(guid)?.run().await
    }

    /// Stops a container's supervised run.
    pub async fn stop(&self, guid: &str) -> Result<()> {
        self.node(guid)?.stop().await
    }

    /// Destroys a container and removes it from the store, freeing its
    /// reservation. Cleanup errors are returned after removal.
    pub async fn destroy(&self, guid: &str) -> Result<()> {
        let node = self.node(guid)?;
        let result = node.destroy().await;
        self.remove(guid);
        result
    }

    /// Streams an archive out of a container's filesystem.
    pub async fn get_files(&self, guid: &str, path: &str) -> Result<ArchiveStream> {
        self.node(guid)?.get_files(path).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Expires and removes Reserved containers whose reservation lapsed.
    /// Returns how many were pruned.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let nodes: Vec<(String, Arc<StoreNode>)> = self
            .nodes
            .read()
            .unwrap()
            .iter()
            .map(|(guid, node)| (guid.clone(), Arc::clone(node)))
            .collect();

        let mut pruned = 0;
        for (guid, node) in nodes {
            if node.expire(now) {
                self.remove(&guid);
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::info!(pruned, "pruned expired reservations");
        }
        pruned
    }

    /// Reaps and removes Created containers the sandbox provider no
    /// longer knows about. Returns how many were reaped.
    pub async fn reap_missing(&self) -> Result<usize> {
        let live: HashSet<String> = self
            .deps
            .provider
            .list_handles()
            .await?
            .into_iter()
            .collect();

        let nodes: Vec<(String, Arc<StoreNode>)> = self
            .nodes
            .read()
            .unwrap()
            .iter()
            .map(|(guid, node)| (guid.clone(), Arc::clone(node)))
            .collect();

        let mut reaped = 0;
        for (guid, node) in nodes {
            if node.info().state == ContainerState::Created && !live.contains(&guid) {
                node.detach_handle();
                if node.reap() {
                    self.remove(&guid);
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "reaped containers missing from sandbox provider");
        }
        Ok(reaped)
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Total capacity of this executor.
    #[must_use]
    pub fn total_resources(&self) -> ExecutorResources {
        self.capacity.total()
    }

    /// Currently unreserved capacity.
    #[must_use]
    pub fn remaining_resources(&self) -> ExecutorResources {
        self.capacity.remaining()
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn node(&self, guid: &str) -> Result<Arc<StoreNode>> {
        self.nodes
            .read()
            .unwrap()
            .get(guid)
            .cloned()
            .ok_or(Error::ContainerNotFound)
    }

    fn remove(&self, guid: &str) {
        let node = self.nodes.write().unwrap().remove(guid);
        if let Some(node) = node {
            let info = node.info();
            self.capacity
                .free(ExecutorResources::for_container(info.memory_mb, info.disk_mb));
            self.deps.metrics.set_remaining(self.capacity.remaining());
        }
    }
}
