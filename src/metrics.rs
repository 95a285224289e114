//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub tasks_submitted: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_retried: IntCounter,
    pub tasks_cancelled: IntCounter,
    pub bundles_launched: IntCounter,
    pub breaker_opened: IntCounter,
    pub breaker_rejections: IntCounter,
    pub queue_failovers: IntCounter,

    // Gauges
    pub active_bundles: IntGauge,
    pub active_tasks: IntGauge,

    // Histograms
    pub submit_latency: Histogram,
    pub bundle_duration: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_submitted = IntCounter::with_opts(Opts::new(
            "bundle_tasks_submitted_total",
            "Submission attempts sent to the ledger",
        ))?;
        let tasks_completed = IntCounter::with_opts(Opts::new(
            "bundle_tasks_completed_total",
            "Tasks that reached completed",
        ))?;
        let tasks_failed = IntCounter::with_opts(Opts::new(
            "bundle_tasks_failed_total",
            "Tasks that reached terminal failure",
        ))?;
        let tasks_retried = IntCounter::with_opts(Opts::new(
            "bundle_tasks_retried_total",
            "Failed attempts requeued with backoff",
        ))?;
        let tasks_cancelled = IntCounter::with_opts(Opts::new(
            "bundle_tasks_cancelled_total",
            "Tasks removed or discarded by cancellation",
        ))?;
        let bundles_launched = IntCounter::with_opts(Opts::new(
            "bundles_launched_total",
            "Bundles accepted by launch",
        ))?;
        let breaker_opened = IntCounter::with_opts(Opts::new(
            "ledger_breaker_opened_total",
            "Circuit breaker open transitions",
        ))?;
        let breaker_rejections = IntCounter::with_opts(Opts::new(
            "ledger_breaker_rejections_total",
            "Calls short-circuited by an open breaker",
        ))?;
        let queue_failovers = IntCounter::with_opts(Opts::new(
            "task_queue_failovers_total",
            "Switches from the durable to the in-process queue",
        ))?;

        let active_bundles = IntGauge::with_opts(Opts::new(
            "bundles_active",
            "Bundles currently tracked by the scheduler",
        ))?;
        let active_tasks = IntGauge::with_opts(Opts::new(
            "bundle_tasks_active",
            "Tasks currently held by a worker",
        ))?;

        let submit_latency = Histogram::with_opts(
            HistogramOpts::new("ledger_submit_latency_seconds", "Ledger submit call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        let bundle_duration = Histogram::with_opts(
            HistogramOpts::new("bundle_duration_seconds", "Launch to terminal state")
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(tasks_submitted.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(tasks_failed.clone()))?;
        registry.register(Box::new(tasks_retried.clone()))?;
        registry.register(Box::new(tasks_cancelled.clone()))?;
        registry.register(Box::new(bundles_launched.clone()))?;
        registry.register(Box::new(breaker_opened.clone()))?;
        registry.register(Box::new(breaker_rejections.clone()))?;
        registry.register(Box::new(queue_failovers.clone()))?;
        registry.register(Box::new(active_bundles.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(submit_latency.clone()))?;
        registry.register(Box::new(bundle_duration.clone()))?;

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_completed,
            tasks_failed,
            tasks_retried,
            tasks_cancelled,
            bundles_launched,
            breaker_opened,
            breaker_rejections,
            queue_failovers,
            active_bundles,
            active_tasks,
            submit_latency,
            bundle_duration,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let m = Metrics::new().unwrap();
        m.tasks_completed.inc();
        let text = m.render();
        assert!(text.contains("bundle_tasks_completed_total 1"));
        assert!(text.contains("task_queue_failovers_total"));
    }
}
