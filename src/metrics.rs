//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "splitter_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_activities_received_total", "Total number of activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_activities_sent_total", "Total number of activities delivered"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "splitter_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_deliveries_total", "Outbox delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref CIRCUIT_OPENED_TOTAL: IntCounter = IntCounter::new(
        "splitter_circuit_opened_total",
        "Number of times a domain circuit was opened"
    ).expect("metric can be created");
    pub static ref INBOX_DUPLICATES_TOTAL: IntCounter = IntCounter::new(
        "splitter_inbox_duplicates_total",
        "Inbound activities short-circuited by deduplication"
    ).expect("metric can be created");
    pub static ref MESSAGING_THROTTLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_messaging_throttled_total", "Messaging guard rejections"),
        &["scope"]
    ).expect("metric can be created");
    pub static ref WORKER_SWEEPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_worker_sweeps_total", "Background sweep executions"),
        &["task", "result"]
    ).expect("metric can be created");

    // Queue state, refreshed on scrape
    pub static ref OUTBOX_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("splitter_outbox_entries", "Outbox entries by delivery status"),
        &["status"]
    ).expect("metric can be created");
    pub static ref OPEN_CIRCUITS: IntGauge = IntGauge::new(
        "splitter_open_circuits",
        "Remote domains whose circuit is currently open"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("splitter_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn init_metrics() {
    INIT.call_once(register_all);
}

fn register_all() {
    REGISTRY
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_SENT.clone()))
        .expect("ACTIVITIES_SENT can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CIRCUIT_OPENED_TOTAL.clone()))
        .expect("CIRCUIT_OPENED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INBOX_DUPLICATES_TOTAL.clone()))
        .expect("INBOX_DUPLICATES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(MESSAGING_THROTTLED_TOTAL.clone()))
        .expect("MESSAGING_THROTTLED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(WORKER_SWEEPS_TOTAL.clone()))
        .expect("WORKER_SWEEPS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(OUTBOX_ENTRIES.clone()))
        .expect("OUTBOX_ENTRIES can be registered");
    REGISTRY
        .register(Box::new(OPEN_CIRCUITS.clone()))
        .expect("OPEN_CIRCUITS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
