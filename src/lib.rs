//! # stevedore
//!
//! **Container lifecycle engine for an executor node**
//!
//! This crate drives work units ("containers") through a strict lifecycle
//! against an external sandbox provider. Each container reserves
//! resources, attaches run parameters, gets a sandbox created for it,
//! and is then supervised through an ordered group of long-lived
//! activities until it completes.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           stevedore                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      HTTP Surface                           │    │
//! │  │  allocate → initialize → run          list / delete / ping  │    │
//! │  └──────────────────────────┬──────────────────────────────────┘    │
//! │                             │                                       │
//! │  ┌──────────────────────────┼──────────────────────────────────┐    │
//! │  │  ContainerStore          ▼                                  │    │
//! │  │  guid ──▶ StoreNode   (capacity registry, event hub)        │    │
//! │  │            │                                                │    │
//! │  │   Reserved ▶ Initializing ▶ Created ▶ Running ▶ Completed   │    │
//! │  └────────────┼────────────────────────────────────────────────┘    │
//! │               │                                                     │
//! │  ┌────────────┼────────────────────────────────────────────────┐    │
//! │  │  Ordered supervision (per running container)                │    │
//! │  │  credential runner ──▶ proxy runner ──▶ action steps        │    │
//! │  │  (start in order, ready gates next, teardown in reverse)    │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  External contracts: SandboxProvider │ DependencyManager │          │
//! │  VolumeManager │ CredManager │ ProxyManager                         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency Model
//!
//! Every store node holds two locks. The *info lock* guards the
//! container view and is never held across I/O, so [`StoreNode::info`]
//! observers never block on the provider. The *op lock* serializes the
//! lifecycle methods that talk to the provider. The supervised
//! activities of a running container live on their own tasks behind an
//! [`supervisor::OrderedGroup`].
//!
//! # No Persistence
//!
//! The store keeps everything in memory. After a restart the sandbox
//! provider is the source of truth: surviving sandbox containers are
//! reaped via [`store::ContainerStore::reap_missing`], not resumed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore::container::{AllocationRequest, RunRequest};
//! use stevedore::store::{ContainerStore, StoreConfig};
//!
//! let store = ContainerStore::new(
//!     StoreConfig::default(),
//!     capacity,
//!     provider,
//!     dependencies,
//!     volumes,
//!     credentials,
//!     proxy,
//!     metrics,
//! );
//!
//! store.reserve("task-1", &AllocationRequest { memory_mb: 64, disk_mb: 128, ..Default::default() })?;
//! store.initialize("task-1", &run_request)?;
//! store.create("task-1").await?;
//! store.run("task-1").await?;
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod capacity;
pub mod constants;
pub mod container;
pub mod error;
pub mod event;
pub mod managers;
pub mod metrics;
pub mod sandbox;
pub mod server;
pub mod steps;
pub mod store;
pub mod supervisor;
pub mod transform;

// =============================================================================
// Facade
// =============================================================================

pub use capacity::ExecutorResources;
pub use container::{AllocationRequest, Container, ContainerState, RunRequest};
pub use error::{Error, Result};
pub use event::{EventHub, LifecycleEvent};
pub use sandbox::SandboxProvider;
pub use store::{ContainerStore, StoreConfig, StoreNode};
