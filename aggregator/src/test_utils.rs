// Shared builders for unit tests
//
// Numan Thabit 2025 Nov

use crate::model::{MetricField, PipelineEvent, Service, ServiceUsage, Stage, StageLatencies};
use chrono::Utc;

pub fn event(request_id: &str, customer: &str, app: &str) -> PipelineEvent {
    PipelineEvent {
        request_id: request_id.to_string(),
        customer_name: customer.to_string(),
        customer_app: app.to_string(),
        timestamp: Utc::now(),
        latency: StageLatencies::default(),
        usage: ServiceUsage::default(),
    }
}

pub fn with_latency(mut event: PipelineEvent, stage: Stage, ms: f64) -> PipelineEvent {
    *event.latency.get_mut(stage) = MetricField::Measured(ms);
    event
}

pub fn with_usage(mut event: PipelineEvent, service: Service, amount: u64) -> PipelineEvent {
    *event.usage.get_mut(service) = MetricField::Count(amount);
    event
}
