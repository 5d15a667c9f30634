//! Driver metrics. No exporter is installed here; the counters are no-ops
//! until the hosting process registers a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

pub struct DriverMetrics {
    pub dispatched_total: Counter<u64>,
    pub evaluations_total: Counter<u64>,
    pub cache_hits_total: Counter<u64>,
    pub failures_total: Counter<u64>,
    pub job_latency_ms: Histogram<f64>,
}

static DRIVER_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("pso_driver"));

pub static DRIVER_METRICS: Lazy<DriverMetrics> = Lazy::new(|| {
    DriverMetrics {
        dispatched_total: DRIVER_METER.u64_counter("pso_jobs_dispatched_total").with_description("Evaluation jobs submitted to the executor").init(),
        evaluations_total: DRIVER_METER.u64_counter("pso_evaluations_total").with_description("Positions scored by the workload (cache misses)").init(),
        cache_hits_total: DRIVER_METER.u64_counter("pso_cache_hits_total").with_description("Positions served from the result cache").init(),
        failures_total: DRIVER_METER.u64_counter("pso_evaluation_failures_total").with_description("Evaluation jobs that produced no score").init(),
        job_latency_ms: DRIVER_METER.f64_histogram("pso_job_latency_ms")
            .with_description("Wall time of one evaluation job, backoff excluded (ms)")
            .with_unit(Unit::new("ms"))
            .init(),
    }
});
