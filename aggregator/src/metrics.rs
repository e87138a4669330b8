// Metrics and observability module
// This file handles the service's own Prometheus counters and histograms:
// ingestion outcomes, data-quality warnings, query and upstream latency
//
// Numan Thabit 2025 Nov

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

pub static EVENTS_INGESTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "latency_aggr_events_ingested_total",
        "pipeline events appended to the event store"
    )
    .unwrap()
});

pub static INGEST_REJECTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "latency_aggr_events_rejected_total",
        "pipeline events refused at ingestion",
        &["reason"]
    )
    .unwrap()
});

pub static AGGREGATION_FAILURES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "latency_aggr_aggregation_failures_total",
        "aggregation attempts that failed and left the event pending"
    )
    .unwrap()
});

pub static EVENTS_UNAGGREGATED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "latency_aggr_events_unaggregated_total",
        "events that exhausted their aggregation retries"
    )
    .unwrap()
});

pub static DATA_QUALITY_WARNINGS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "latency_aggr_data_quality_warnings_total",
        "stored events that violate an expected invariant",
        &["kind"]
    )
    .unwrap()
});

pub static QUERY_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "latency_aggr_query_latency_seconds",
        "latency for read queries",
        &["query"]
    )
    .unwrap()
});

pub static REQ_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "latency_aggr_upstream_latency_seconds",
        "latency for upstream calls",
        &["service", "method"]
    )
    .unwrap()
});

pub static REQ_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "latency_aggr_upstream_errors_total",
        "errors by upstream",
        &["service", "method"]
    )
    .unwrap()
});

/// Render the default registry in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
