// Transport layer
// HTTP clients for services outside this process
//
// Numan Thabit 2025 Nov

pub mod pipeline;

pub use pipeline::{PipelineClient, PipelineRequest};
