//! Prometheus text export of [`MetricsSnapshot`]s.

use super::MetricsSnapshot;
use crate::error::AnvilResult;
use prometheus::{Gauge, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Mirrors snapshots into a Prometheus registry.
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
    throughput: Gauge,
    pending_by_priority: IntGaugeVec,
    pending_by_worker_type: IntGaugeVec,
    pool_workers: IntGaugeVec,
    pool_busy_workers: IntGaugeVec,
    pool_utilization: GaugeVec,
    cpu_percent: Gauge,
    memory_percent: Gauge,
    tasks_total: IntCounterVec,
}

impl PrometheusExporter {
    /// Exporter with its own registry
    pub fn new() -> AnvilResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Exporter registering into an existing registry
    pub fn with_registry(registry: Registry) -> AnvilResult<Self> {
        let throughput = Gauge::with_opts(Opts::new(
            "anvilq_throughput_per_second",
            "Completed tasks per second over the throughput window",
        ))?;
        let pending_by_priority = IntGaugeVec::new(
            Opts::new("anvilq_pending_tasks", "Queued tasks by priority"),
            &["priority"],
        )?;
        let pending_by_worker_type = IntGaugeVec::new(
            Opts::new("anvilq_pending_tasks_by_lane", "Queued tasks by worker type"),
            &["worker_type"],
        )?;
        let pool_workers = IntGaugeVec::new(
            Opts::new("anvilq_pool_workers", "Running worker loops per pool"),
            &["worker_type"],
        )?;
        let pool_busy_workers = IntGaugeVec::new(
            Opts::new("anvilq_pool_busy_workers", "Workers executing an attempt"),
            &["worker_type"],
        )?;
        let pool_utilization = GaugeVec::new(
            Opts::new("anvilq_pool_utilization", "Busy share of each pool (0.0 to 1.0)"),
            &["worker_type"],
        )?;
        let cpu_percent = Gauge::with_opts(Opts::new("anvilq_host_cpu_percent", "Host CPU usage"))?;
        let memory_percent = Gauge::with_opts(Opts::new(
            "anvilq_host_memory_percent",
            "Host memory usage",
        ))?;
        let tasks_total = IntCounterVec::new(
            Opts::new("anvilq_tasks_total", "Task lifecycle events by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(throughput.clone()))?;
        registry.register(Box::new(pending_by_priority.clone()))?;
        registry.register(Box::new(pending_by_worker_type.clone()))?;
        registry.register(Box::new(pool_workers.clone()))?;
        registry.register(Box::new(pool_busy_workers.clone()))?;
        registry.register(Box::new(pool_utilization.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(memory_percent.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;

        Ok(Self {
            registry,
            throughput,
            pending_by_priority,
            pending_by_worker_type,
            pool_workers,
            pool_busy_workers,
            pool_utilization,
            cpu_percent,
            memory_percent,
            tasks_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Copy `snapshot` into the registered metrics.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        self.throughput.set(snapshot.throughput_per_second);

        for (priority, depth) in &snapshot.pending_by_priority {
            self.pending_by_priority
                .with_label_values(&[priority.as_str()])
                .set(*depth as i64);
        }
        for (worker_type, depth) in &snapshot.pending_by_worker_type {
            self.pending_by_worker_type
                .with_label_values(&[worker_type.as_str()])
                .set(*depth as i64);
        }
        for (worker_type, pool) in &snapshot.active_workers_by_type {
            let label = [worker_type.as_str()];
            self.pool_workers
                .with_label_values(&label)
                .set(pool.current_workers as i64);
            self.pool_busy_workers
                .with_label_values(&label)
                .set(pool.busy_workers as i64);
            self.pool_utilization
                .with_label_values(&label)
                .set(pool.utilization());
        }

        self.cpu_percent.set(snapshot.resource_usage.cpu_percent);
        self.memory_percent
            .set(snapshot.resource_usage.memory_percent);

        let totals = snapshot.totals;
        for (outcome, value) in [
            ("submitted", totals.submitted),
            ("rejected", totals.rejected),
            ("completed", totals.completed),
            ("failed_attempt", totals.failed_attempts),
            ("retried", totals.retried),
            ("dead_lettered", totals.dead_lettered),
            ("replayed", totals.replayed),
        ] {
            // Totals only grow; advance the counter by the difference.
            let counter = self.tasks_total.with_label_values(&[outcome]);
            counter.inc_by(value.saturating_sub(counter.get()));
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> AnvilResult<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    #[test]
    fn test_render_snapshot() {
        let metrics = MetricsCollector::default();
        metrics.record_submitted();
        metrics.record_completed();

        let exporter = PrometheusExporter::new().unwrap();
        exporter.update(&metrics.snapshot());
        metrics.record_completed();
        exporter.update(&metrics.snapshot());

        let text = exporter.render().unwrap();
        assert!(text.contains("anvilq_tasks_total{outcome=\"completed\"} 2"));
        assert!(text.contains("anvilq_tasks_total{outcome=\"submitted\"} 1"));
    }
}
