//! Executor capacity accounting.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A bundle of executor resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResources {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u64,
}

impl ExecutorResources {
    /// Resources consumed by one container reservation.
    #[must_use]
    pub const fn for_container(memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            memory_mb,
            disk_mb,
            containers: 1,
        }
    }
}

/// Tracks remaining memory, disk, and container slots.
pub struct CapacityRegistry {
    total: ExecutorResources,
    remaining: Mutex<ExecutorResources>,
}

impl CapacityRegistry {
    /// Creates a registry with everything available.
    #[must_use]
    pub fn new(total: ExecutorResources) -> Self {
        Self {
            total,
            remaining: Mutex::new(total),
        }
    }

    /// Total capacity of the executor.
    #[must_use]
    pub fn total(&self) -> ExecutorResources {
        self.total
    }

    /// Currently unreserved capacity.
    #[must_use]
    pub fn remaining(&self) -> ExecutorResources {
        *self.remaining.lock().unwrap()
    }

    /// Reserves `res`, failing without a partial claim when any
    /// dimension is short.
    pub fn allocate(&self, res: ExecutorResources) -> Result<()> {
        let mut remaining = self.remaining.lock().unwrap();
        if remaining.memory_mb < res.memory_mb {
            return Err(Error::InsufficientResources { resource: "memory" });
        }
        if remaining.disk_mb < res.disk_mb {
            return Err(Error::InsufficientResources { resource: "disk" });
        }
        if remaining.containers < res.containers {
            return Err(Error::InsufficientResources {
                resource: "containers",
            });
        }
        remaining.memory_mb -= res.memory_mb;
        remaining.disk_mb -= res.disk_mb;
        remaining.containers -= res.containers;
        Ok(())
    }

    /// Returns `res` to the pool, saturating at the configured total.
    pub fn free(&self, res: ExecutorResources) {
        let mut remaining = self.remaining.lock().unwrap();
        remaining.memory_mb = (remaining.memory_mb + res.memory_mb).min(self.total.memory_mb);
        remaining.disk_mb = (remaining.disk_mb + res.disk_mb).min(self.total.disk_mb);
        remaining.containers = (remaining.containers + res.containers).min(self.total.containers);
    }
}
