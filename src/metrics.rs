// Prometheus metrics for gateway monitoring
//
// Exposed on the internal /metrics listener:
// - request outcomes and rejection reasons (counters)
// - active executions and live rate buckets (gauges)
// - pipeline and execution latencies (histograms)

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("gateway_requests_total", "Total execute requests by outcome"),
        &["outcome"]
    ).expect("Failed to create requests total metric");

    pub static ref REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("gateway_rejections_total", "Rejected requests by pipeline stage reason"),
        &["reason"]
    ).expect("Failed to create rejections total metric");

    // Execution metrics
    pub static ref ACTIVE_EXECUTIONS: IntGauge = IntGauge::new(
        "gateway_active_executions",
        "Number of child processes currently running"
    ).expect("Failed to create active executions metric");

    pub static ref EXECUTION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("gateway_execution_duration_seconds", "Child process wall-clock duration in seconds"),
    ).expect("Failed to create execution duration metric");

    pub static ref EXECUTIONS_TIMED_OUT_TOTAL: IntCounter = IntCounter::new(
        "gateway_executions_timed_out_total",
        "Executions killed by the wall-clock deadline"
    ).expect("Failed to create timed out metric");

    // Pipeline metrics
    pub static ref PIPELINE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("gateway_pipeline_duration_seconds", "Full request pipeline duration in seconds"),
    ).expect("Failed to create pipeline duration metric");

    // Rate limiter metrics
    pub static ref RATE_BUCKETS_LIVE: IntGauge = IntGauge::new(
        "gateway_rate_buckets_live",
        "Number of live per-identity rate buckets"
    ).expect("Failed to create rate buckets metric");

    // Audit metrics
    pub static ref AUDIT_ENTRIES_TOTAL: IntCounter = IntCounter::new(
        "gateway_audit_entries_total",
        "Audit entries accepted for writing"
    ).expect("Failed to create audit entries metric");

    pub static ref AUDIT_ENTRIES_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "gateway_audit_entries_dropped_total",
        "Audit entries dropped because the writer queue was full"
    ).expect("Failed to create audit dropped metric");

    // Posture metrics
    pub static ref POSTURE_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("gateway_posture_transitions_total", "Posture transitions by dimension and outcome"),
        &["dimension", "outcome"]
    ).expect("Failed to create posture transitions metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_EXECUTIONS.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS_TIMED_OUT_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PIPELINE_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(RATE_BUCKETS_LIVE.clone()))?;
    REGISTRY.register(Box::new(AUDIT_ENTRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUDIT_ENTRIES_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POSTURE_TRANSITIONS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
