//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Inbound federation
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_activities_received_total", "Inbound activities by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_signature_verifications_total", "Signature verifications by scheme and result"),
        &["scheme", "result"]
    ).expect("metric can be created");
    pub static ref REMOTE_KEY_FETCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_remote_key_fetches_total", "Remote actor key fetches"),
        &["result"]
    ).expect("metric can be created");
    pub static ref COLLECTION_SYNC_CHECKS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_collection_sync_checks_total", "Collection-Synchronization header checks"),
        &["result"]
    ).expect("metric can be created");

    // Outbound federation
    pub static ref DELIVERIES_PLANNED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_deliveries_planned_total", "Delivery tasks enqueued by distribution"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_delivery_attempts_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedcore_delivery_duration_seconds",
            "Outbound inbox POST duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref UNREACHABLE_INBOXES: IntGauge = IntGauge::new(
        "fedcore_unreachable_inboxes",
        "Inboxes currently marked unreachable"
    ).expect("metric can be created");

    // Jobs
    pub static ref JOBS_RUN: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_jobs_run_total", "Background jobs executed by kind and result"),
        &["kind", "result"]
    ).expect("metric can be created");
    pub static ref POLL_NOTIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_poll_notifications_total", "Poll expiry notifications created"),
        &["recipient"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("HTTP_REQUESTS_TOTAL", Box::new(HTTP_REQUESTS_TOTAL.clone())),
        ("ACTIVITIES_RECEIVED", Box::new(ACTIVITIES_RECEIVED.clone())),
        (
            "SIGNATURE_VERIFICATIONS",
            Box::new(SIGNATURE_VERIFICATIONS.clone()),
        ),
        ("REMOTE_KEY_FETCHES", Box::new(REMOTE_KEY_FETCHES.clone())),
        (
            "COLLECTION_SYNC_CHECKS",
            Box::new(COLLECTION_SYNC_CHECKS.clone()),
        ),
        ("DELIVERIES_PLANNED", Box::new(DELIVERIES_PLANNED.clone())),
        ("DELIVERY_ATTEMPTS", Box::new(DELIVERY_ATTEMPTS.clone())),
        (
            "DELIVERY_DURATION_SECONDS",
            Box::new(DELIVERY_DURATION_SECONDS.clone()),
        ),
        ("UNREACHABLE_INBOXES", Box::new(UNREACHABLE_INBOXES.clone())),
        ("JOBS_RUN", Box::new(JOBS_RUN.clone())),
        ("POLL_NOTIFICATIONS", Box::new(POLL_NOTIFICATIONS.clone())),
        ("ERRORS_TOTAL", Box::new(ERRORS_TOTAL.clone())),
    ];

    for (name, collector) in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::warn!(metric = name, %error, "Metric registration skipped");
        }
    }

    tracing::info!("Metrics registry initialized");
}
