//! stevedored - container lifecycle executor daemon.
//!
//! Wires a [`ContainerStore`] behind the HTTP surface, runs the
//! reservation pruning loop, reconciles against the sandbox backend at
//! startup, and drains in-flight runs on SIGINT/SIGTERM.
//!
//! The only sandbox backend compiled in today is `loopback`, an
//! in-process backend that tracks containers in memory and completes
//! every process immediately. Real isolation backends implement
//! [`SandboxProvider`] and plug in at this seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stevedore::capacity::ExecutorResources;
use stevedore::managers::{
    NoopCredManager, NoopDependencyManager, NoopProxyManager, NoopVolumeManager,
};
use stevedore::metrics::EngineMetrics;
use stevedore::sandbox::{
    ArchiveStream, MappedPort, ProcessPayload, ProcessStream, RunScript, SandboxError,
    SandboxInfo, SandboxProvider, SandboxResult, SandboxSpec, StreamOutSpec,
};
use stevedore::server::{self, AppState};
use stevedore::store::{ContainerStore, StoreConfig};

// =============================================================================
// CLI
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "stevedored")]
#[command(version, about = "Container lifecycle executor daemon", long_about = None)]
struct Args {
    /// Address the HTTP surface listens on.
    #[arg(long, default_value = "127.0.0.1:1700")]
    listen: String,

    /// Owner property stamped on every sandbox container.
    #[arg(long, default_value = "executor")]
    owner_name: String,

    /// Shares granted to a container with CPUWeight 100.
    #[arg(long, default_value_t = stevedore::constants::DEFAULT_MAX_CPU_SHARES)]
    max_cpu_shares: u64,

    /// Total allocatable memory in MiB.
    #[arg(long, default_value_t = 8192)]
    memory_mb: u64,

    /// Total allocatable disk in MiB.
    #[arg(long, default_value_t = 16384)]
    disk_mb: u64,

    /// Maximum concurrent containers.
    #[arg(long, default_value_t = 256)]
    containers: u64,

    /// Seconds a Reserved container may sit before it expires.
    #[arg(long, default_value_t = 60)]
    reserved_expiration_secs: u64,

    /// Seconds between reservation pruning sweeps.
    #[arg(long, default_value_t = 30)]
    pruning_interval_secs: u64,

    /// Host path of the trusted-certificate bundle (empty disables
    /// certificate injection).
    #[arg(long, default_value = "")]
    trusted_certificates_path: String,

    /// Host path of the declarative healthcheck binary; enables the
    /// healthcheck bind mount when set.
    #[arg(long)]
    healthcheck_path: Option<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> stevedore::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore=info,stevedored=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    info!(listen = %args.listen, "starting stevedored");

    let provider: Arc<dyn SandboxProvider> = Arc::new(LoopbackProvider::default());
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(EngineMetrics::new(&registry)?);

    let config = StoreConfig {
        owner_name: args.owner_name.clone(),
        max_cpu_shares: args.max_cpu_shares,
        reserved_expiration_time: Duration::from_secs(args.reserved_expiration_secs),
        healthcheck_enabled: args.healthcheck_path.is_some(),
        healthcheck_path: args.healthcheck_path.clone().unwrap_or_default(),
        host_trusted_certificates_path: args.trusted_certificates_path.clone(),
        ..Default::default()
    };
    let capacity = ExecutorResources {
        memory_mb: args.memory_mb,
        disk_mb: args.disk_mb,
        containers: args.containers,
    };

    let store = Arc::new(ContainerStore::new(
        config,
        capacity,
        Arc::clone(&provider),
        Arc::new(NoopDependencyManager),
        Arc::new(NoopVolumeManager),
        Arc::new(NoopCredManager),
        Arc::new(NoopProxyManager),
        metrics,
    ));

    // The store does not persist; the sandbox backend is the source of
    // truth after a restart.
    let reaped = store.reap_missing().await?;
    if reaped > 0 {
        info!(reaped, "startup reconciliation reaped containers");
    }

    let pruner = {
        let store = Arc::clone(&store);
        let interval = Duration::from_secs(args.pruning_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.prune_expired(chrono::Utc::now());
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "http surface listening");

    let state = AppState::new(Arc::clone(&store), provider);
    server::serve(listener, state, shutdown_signal()).await?;

    pruner.abort();
    info!("stevedored stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}

// =============================================================================
// Loopback Backend
// =============================================================================

/// Host-port base for container ports the caller left unassigned.
const LOOPBACK_PORT_BASE: u16 = 61000;

/// In-process sandbox backend.
#[derive(Default)]
struct LoopbackProvider {
    containers: Mutex<HashMap<String, SandboxSpec>>,
}

#[async_trait]
impl SandboxProvider for LoopbackProvider {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<String> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.handle) {
            return Err(SandboxError::Other(format!(
                "handle already in use: {}",
                spec.handle
            )));
        }
        let handle = spec.handle.clone();
        containers.insert(handle.clone(), spec);
        Ok(handle)
    }

    async fn destroy(&self, handle: &str) -> SandboxResult<()> {
        match self.containers.lock().unwrap().remove(handle) {
            Some(_) => Ok(()),
            None => Err(SandboxError::ContainerNotFound(handle.to_string())),
        }
    }

    async fn info(&self, handle: &str) -> SandboxResult<SandboxInfo> {
        let containers = self.containers.lock().unwrap();
        let spec = containers
            .get(handle)
            .ok_or_else(|| SandboxError::ContainerNotFound(handle.to_string()))?;
        let mapped_ports = spec
            .net_in
            .iter()
            .enumerate()
            .map(|(i, rule)| MappedPort {
                container_port: rule.container_port,
                host_port: if rule.host_port != 0 {
                    rule.host_port
                } else {
                    LOOPBACK_PORT_BASE + i as u16
                },
            })
            .collect();
        Ok(SandboxInfo {
            external_ip: "127.0.0.1".to_string(),
            container_ip: "127.0.0.1".to_string(),
            mapped_ports,
        })
    }

    async fn stream_out(
        &self,
        handle: &str,
        _spec: StreamOutSpec,
    ) -> SandboxResult<ArchiveStream> {
        if !self.containers.lock().unwrap().contains_key(handle) {
            return Err(SandboxError::ContainerNotFound(handle.to_string()));
        }
        Ok(Box::new(tokio::io::empty()))
    }

    async fn run(&self, handle: &str, script: RunScript) -> SandboxResult<ProcessStream> {
        if !self.containers.lock().unwrap().contains_key(handle) {
            return Err(SandboxError::ContainerNotFound(handle.to_string()));
        }
        tracing::debug!(handle, path = %script.path, "loopback run");
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(ProcessPayload::Exited(0)).await;
        Ok(rx)
    }

    async fn ping(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn list_handles(&self) -> SandboxResult<Vec<String>> {
        Ok(self.containers.lock().unwrap().keys().cloned().collect())
    }
}
