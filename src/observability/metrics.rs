//! # Metrics
//!
//! Prometheus metrics for monitoring the daemon.
//!
//! ## Metrics Exposed
//!
//! - `doco_cd_app_info` - Static application info (version label)
//! - `doco_cd_webhook_requests_total` - Accepted webhook jobs
//! - `doco_cd_webhook_errors_total` - Webhook failures by error kind
//! - `doco_cd_webhook_duration_seconds` - Duration of webhook-triggered jobs
//! - `doco_cd_poll_total` - Completed poll runs
//! - `doco_cd_poll_errors_total` - Failed poll runs
//! - `doco_cd_poll_duration_seconds` - Duration of poll runs
//! - `doco_cd_deployments_total` - Completed stack deployments
//! - `doco_cd_deployment_errors_total` - Failed stack deployments by error kind
//! - `doco_cd_deployment_duration_seconds` - Duration of stack deployments
//! - `doco_cd_deployments_queued` - Deployments waiting per repository
//! - `doco_cd_deployments_active` - Deployments running per repository

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static APP_INFO: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new("doco_cd_app_info", "Static application info"),
        &["version"],
    )
    .expect("Failed to create APP_INFO metric - this should never happen")
});

static WEBHOOK_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "doco_cd_webhook_requests_total",
        "Total number of accepted webhook jobs",
    )
    .expect("Failed to create WEBHOOK_REQUESTS_TOTAL metric - this should never happen")
});

static WEBHOOK_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "doco_cd_webhook_errors_total",
            "Total number of webhook failures by error kind",
        ),
        &["kind"],
    )
    .expect("Failed to create WEBHOOK_ERRORS_TOTAL metric - this should never happen")
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "doco_cd_webhook_duration_seconds",
            "Duration of webhook-triggered jobs in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("Failed to create WEBHOOK_DURATION metric - this should never happen")
});

static POLL_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("doco_cd_poll_total", "Total number of completed poll runs")
        .expect("Failed to create POLL_TOTAL metric - this should never happen")
});

static POLL_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("doco_cd_poll_errors_total", "Total number of failed poll runs")
        .expect("Failed to create POLL_ERRORS_TOTAL metric - this should never happen")
});

static POLL_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "doco_cd_poll_duration_seconds",
            "Duration of poll runs in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("Failed to create POLL_DURATION metric - this should never happen")
});

static DEPLOYMENTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "doco_cd_deployments_total",
        "Total number of completed stack deployments",
    )
    .expect("Failed to create DEPLOYMENTS_TOTAL metric - this should never happen")
});

static DEPLOYMENT_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "doco_cd_deployment_errors_total",
            "Total number of failed stack deployments by error kind",
        ),
        &["kind"],
    )
    .expect("Failed to create DEPLOYMENT_ERRORS_TOTAL metric - this should never happen")
});

static DEPLOYMENT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "doco_cd_deployment_duration_seconds",
            "Duration of stack deployments in seconds",
        )
        .buckets(vec![1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )
    .expect("Failed to create DEPLOYMENT_DURATION metric - this should never happen")
});

static DEPLOYMENTS_QUEUED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "doco_cd_deployments_queued",
            "Deployments waiting for admission per repository",
        ),
        &["repository"],
    )
    .expect("Failed to create DEPLOYMENTS_QUEUED metric - this should never happen")
});

static DEPLOYMENTS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "doco_cd_deployments_active",
            "Deployments currently running per repository",
        ),
        &["repository"],
    )
    .expect("Failed to create DEPLOYMENTS_ACTIVE metric - this should never happen")
});

/// Register all metrics with the process-wide registry. Call once at
/// startup, before the metrics endpoint starts serving.
pub fn register_metrics(app_version: &str) -> Result<()> {
    REGISTRY.register(Box::new(APP_INFO.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_DURATION.clone()))?;
    REGISTRY.register(Box::new(POLL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_DURATION.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENT_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENT_DURATION.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENTS_QUEUED.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENTS_ACTIVE.clone()))?;

    APP_INFO.with_label_values(&[app_version]).set(1);
    Ok(())
}

/// Gather all metric families for the text exposition endpoint.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn increment_webhook_requests() {
    WEBHOOK_REQUESTS_TOTAL.inc();
}

pub fn increment_webhook_errors(kind: &str) {
    WEBHOOK_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_webhook_duration(seconds: f64) {
    WEBHOOK_DURATION.observe(seconds);
}

pub fn increment_poll_total() {
    POLL_TOTAL.inc();
}

pub fn increment_poll_errors() {
    POLL_ERRORS_TOTAL.inc();
}

pub fn observe_poll_duration(seconds: f64) {
    POLL_DURATION.observe(seconds);
}

pub fn increment_deployments_total() {
    DEPLOYMENTS_TOTAL.inc();
}

pub fn increment_deployment_errors(kind: &str) {
    DEPLOYMENT_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_deployment_duration(seconds: f64) {
    DEPLOYMENT_DURATION.observe(seconds);
}

pub fn inc_deployments_queued(repository: &str) {
    DEPLOYMENTS_QUEUED.with_label_values(&[repository]).inc();
}

pub fn dec_deployments_queued(repository: &str) {
    DEPLOYMENTS_QUEUED.with_label_values(&[repository]).dec();
}

pub fn inc_deployments_active(repository: &str) {
    DEPLOYMENTS_ACTIVE.with_label_values(&[repository]).inc();
}

pub fn dec_deployments_active(repository: &str) {
    DEPLOYMENTS_ACTIVE.with_label_values(&[repository]).dec();
}

/// Drop the per-repository gauge series when a limiter entry is reaped, so
/// stale repositories stop being exported.
pub fn reset_repo_gauges(repository: &str) {
    let _ = DEPLOYMENTS_QUEUED.remove_label_values(&[repository]);
    let _ = DEPLOYMENTS_ACTIVE.remove_label_values(&[repository]);
}
