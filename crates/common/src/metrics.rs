//! Metrics collection for FrameBatch
//!
//! This module provides Prometheus metrics for the batching core.
//! Counters are updated from both the submitting thread and the runtime's
//! completion thread; all prometheus types are safe for that.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for FrameBatch
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
}

/// Batching scheduler metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Tasks accepted by execute_sync/execute_async
    pub tasks_submitted: IntCounter,

    /// Tasks whose every inference unit completed
    pub tasks_completed: IntCounter,

    /// Tasks handed back with at least one failed unit
    pub tasks_failed: IntCounter,

    /// Inference units created by task decomposition
    pub units_queued: IntCounter,

    /// Batches handed to the device
    pub batches_dispatched: IntCounter,

    /// Occupied entries per dispatched batch
    pub batch_occupancy: Histogram,

    /// Slots currently owned by a dispatch
    pub slots_in_flight: IntGauge,

    /// Fill or dispatch calls that failed
    pub dispatch_failures: IntCounter,

    /// Blocking inference duration
    pub inference_duration: Histogram,

    /// Time spent demultiplexing one completed batch
    pub completion_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let tasks_submitted = IntCounter::new(
            "framebatch_tasks_submitted_total",
            "Total number of submitted tasks",
        )
        .expect("valid metric");

        let tasks_completed = IntCounter::new(
            "framebatch_tasks_completed_total",
            "Total number of tasks returned to the caller",
        )
        .expect("valid metric");

        let tasks_failed = IntCounter::new(
            "framebatch_tasks_failed_total",
            "Total number of tasks returned with a failed inference unit",
        )
        .expect("valid metric");

        let units_queued = IntCounter::new(
            "framebatch_inference_units_total",
            "Total number of inference units created",
        )
        .expect("valid metric");

        let batches_dispatched = IntCounter::new(
            "framebatch_batches_dispatched_total",
            "Total number of batches dispatched to the device",
        )
        .expect("valid metric");

        let batch_occupancy = Histogram::with_opts(
            HistogramOpts::new(
                "framebatch_batch_occupancy",
                "Inference units per dispatched batch",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )
        .expect("valid metric");

        let slots_in_flight = IntGauge::new(
            "framebatch_slots_in_flight",
            "Execution slots currently owned by a dispatch",
        )
        .expect("valid metric");

        let dispatch_failures = IntCounter::new(
            "framebatch_dispatch_failures_total",
            "Total number of failed fill or dispatch attempts",
        )
        .expect("valid metric");

        let inference_duration = Histogram::with_opts(
            HistogramOpts::new(
                "framebatch_inference_duration_seconds",
                "Blocking inference duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )
        .expect("valid metric");

        let completion_duration = Histogram::with_opts(
            HistogramOpts::new(
                "framebatch_completion_duration_seconds",
                "Time spent demultiplexing a completed batch",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05]),
        )
        .expect("valid metric");

        // Register all metrics
        registry.register(Box::new(tasks_submitted.clone())).expect("unique metric");
        registry.register(Box::new(tasks_completed.clone())).expect("unique metric");
        registry.register(Box::new(tasks_failed.clone())).expect("unique metric");
        registry.register(Box::new(units_queued.clone())).expect("unique metric");
        registry.register(Box::new(batches_dispatched.clone())).expect("unique metric");
        registry.register(Box::new(batch_occupancy.clone())).expect("unique metric");
        registry.register(Box::new(slots_in_flight.clone())).expect("unique metric");
        registry.register(Box::new(dispatch_failures.clone())).expect("unique metric");
        registry.register(Box::new(inference_duration.clone())).expect("unique metric");
        registry.register(Box::new(completion_duration.clone())).expect("unique metric");

        let scheduler = SchedulerMetrics {
            tasks_submitted,
            tasks_completed,
            tasks_failed,
            units_queued,
            batches_dispatched,
            batch_occupancy,
            slots_in_flight,
            dispatch_failures,
            inference_duration,
            completion_duration,
        };

        MetricsRegistry {
            registry,
            scheduler,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.scheduler.tasks_submitted.inc();
        metrics.scheduler.slots_in_flight.set(2);
        metrics.scheduler.batch_occupancy.observe(3.0);

        let output = metrics.gather();
        assert!(output.contains("framebatch_tasks_submitted_total"));
        assert!(output.contains("framebatch_slots_in_flight 2"));
        assert!(output.contains("framebatch_batch_occupancy"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();
        let value = metrics.scheduler.inference_duration.time(|| 7);
        assert_eq!(value, 7);
        assert_eq!(metrics.scheduler.inference_duration.get_sample_count(), 1);
    }
}
