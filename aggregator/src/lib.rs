// Library root module for latency-aggr
// This file defines the public API and module structure for the latency-aggr library
// It exports the ingestion, aggregation and query services used by the binary
//
// Numan Thabit 2025 Nov

pub mod aggregate;
pub mod api;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod query;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_utils;
