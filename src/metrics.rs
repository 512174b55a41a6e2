//! Prometheus metrics for the lifecycle engine.
//!
//! A single [`EngineMetrics`] value is registered up front and injected
//! wherever durations or capacity snapshots are recorded. Observation
//! never fails; only registration can, at startup.

use std::time::Duration;

use prometheus::{GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::capacity::ExecutorResources;
use crate::error::{Error, Result};

/// Outcome label for duration histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    fn as_label(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Pre-registered engine metrics.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Wall time of sandbox container creation, by outcome.
    creation_duration: HistogramVec,
    /// Wall time of sandbox container destruction, by outcome.
    destruction_duration: HistogramVec,
    /// Remaining executor capacity, by resource.
    remaining_resources: GaugeVec,
}

impl EngineMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metrics`] when a collector cannot be built or a
    /// name collides in the registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let creation_duration = HistogramVec::new(
            HistogramOpts::new(
                "container_creation_duration_seconds",
                "Wall time spent creating sandbox containers",
            ),
            &["outcome"],
        )
        .map_err(|e| Error::Metrics(e.to_string()))?;

        let destruction_duration = HistogramVec::new(
            HistogramOpts::new(
                "container_destruction_duration_seconds",
                "Wall time spent destroying sandbox containers",
            ),
            &["outcome"],
        )
        .map_err(|e| Error::Metrics(e.to_string()))?;

        let remaining_resources = GaugeVec::new(
            Opts::new(
                "executor_remaining_resources",
                "Remaining executor capacity by resource",
            ),
            &["resource"],
        )
        .map_err(|e| Error::Metrics(e.to_string()))?;

        for collector in [
            Box::new(creation_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(destruction_duration.clone()),
            Box::new(remaining_resources.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| Error::Metrics(e.to_string()))?;
        }

        Ok(Self {
            creation_duration,
            destruction_duration,
            remaining_resources,
        })
    }

    /// Metrics backed by a throwaway registry, for tests and defaults.
    #[must_use]
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("fresh registry cannot collide")
    }

    /// Records one sandbox creation.
    pub fn observe_creation(&self, outcome: Outcome, duration: Duration) {
        self.creation_duration
            .with_label_values(&[outcome.as_label()])
            .observe(duration.as_secs_f64());
    }

    /// Records one sandbox destruction.
    pub fn observe_destruction(&self, outcome: Outcome, duration: Duration) {
        self.destruction_duration
            .with_label_values(&[outcome.as_label()])
            .observe(duration.as_secs_f64());
    }

    /// Publishes the current remaining capacity.
    pub fn set_remaining(&self, remaining: ExecutorResources) {
        self.remaining_resources
            .with_label_values(&["memory_mb"])
            .set(remaining.memory_mb as f64);
        self.remaining_resources
            .with_label_values(&["disk_mb"])
            .set(remaining.disk_mb as f64);
        self.remaining_resources
            .with_label_values(&["containers"])
            .set(remaining.containers as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_is_collision_checked() {
        let registry = Registry::new();
        EngineMetrics::new(&registry).unwrap();
        let err = EngineMetrics::new(&registry).unwrap_err();
        assert!(matches!(err, Error::Metrics(_)));
    }

    #[test]
    fn test_observation_does_not_panic() {
        let metrics = EngineMetrics::unregistered();
        metrics.observe_creation(Outcome::Succeeded, Duration::from_millis(5));
        metrics.observe_destruction(Outcome::Failed, Duration::from_secs(1));
        metrics.set_remaining(ExecutorResources {
            memory_mb: 1,
            disk_mb: 2,
            containers: 3,
        });
    }
}
