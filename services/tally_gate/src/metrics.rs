//! Prometheus metrics for the tally gate.
//!
//! Counters: received/accepted/rejected samples, refresh outcomes, skipped
//! buckets. Histogram: refresh latency. Gauge: published snapshot
//! generation.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tally_runtime::{RefreshError, RefreshReport};
use tracing::warn;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Metric definitions are static; failing here is a programming error.
fn register<C: Collector + Clone + 'static>(metric: prometheus::Result<C>) -> C {
    let metric = metric.expect("valid metric definition");
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

static SAMPLES_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "tally_samples_received_total",
        "Telemetry submissions received by the gate",
    ))
});

static SAMPLES_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "tally_samples_accepted_total",
        "Telemetry samples stored",
    ))
});

static SAMPLES_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "tally_samples_rejected_total",
            "Telemetry submissions rejected, by reason",
        ),
        &["reason"],
    ))
});

static REFRESH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("tally_refresh_total", "Insights refreshes by outcome"),
        &["outcome"],
    ))
});

static REFRESH_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register(Histogram::with_opts(
        HistogramOpts::new(
            "tally_refresh_seconds",
            "Time to recompute and publish the insights snapshot",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    ))
});

static BUCKET_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "tally_bucket_errors_total",
        "Buckets skipped during aggregation",
    ))
});

static SNAPSHOT_GENERATION: Lazy<IntGauge> = Lazy::new(|| {
    register(IntGauge::new(
        "tally_snapshot_generation",
        "Generation of the currently published insights snapshot",
    ))
});

pub fn inc_received() {
    SAMPLES_RECEIVED.inc();
}

pub fn inc_accepted() {
    SAMPLES_ACCEPTED.inc();
}

pub fn inc_rejected(reason: &str) {
    SAMPLES_REJECTED.with_label_values(&[reason]).inc();
}

/// Callback for the refresh loop.
pub fn record_refresh(result: &Result<RefreshReport, RefreshError>) {
    match result {
        Ok(report) => {
            REFRESH_TOTAL.with_label_values(&["ok"]).inc();
            REFRESH_SECONDS.observe(report.elapsed.as_secs_f64());
            BUCKET_ERRORS.inc_by(report.bucket_errors);
            SNAPSHOT_GENERATION.set(i64::try_from(report.generation).unwrap_or(i64::MAX));
        }
        Err(RefreshError::StoreUnavailable(_)) => {
            REFRESH_TOTAL.with_label_values(&["store_unavailable"]).inc();
        }
        Err(RefreshError::Task(_)) => {
            REFRESH_TOTAL.with_label_values(&["task_failed"]).inc();
        }
    }
}

pub fn encode_metrics() -> String {
    // Force lazy init so every series appears even at zero
    Lazy::force(&SAMPLES_RECEIVED);
    Lazy::force(&SAMPLES_ACCEPTED);
    Lazy::force(&SAMPLES_REJECTED);
    Lazy::force(&REFRESH_TOTAL);
    Lazy::force(&REFRESH_SECONDS);
    Lazy::force(&BUCKET_ERRORS);
    Lazy::force(&SNAPSHOT_GENERATION);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
