// Pipeline event model
// This file defines the strict internal representation of a completed
// pipeline run: identity, per-stage latencies and per-stage usage
//
// Numan Thabit 2025 Nov

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Pipeline stage whose latency may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    LangDetection,
    Nmt,
    Llm,
    BackNmt,
    Tts,
    Overall,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::LangDetection,
        Stage::Nmt,
        Stage::Llm,
        Stage::BackNmt,
        Stage::Tts,
        Stage::Overall,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::LangDetection => "langDetection",
            Stage::Nmt => "nmt",
            Stage::Llm => "llm",
            Stage::BackNmt => "backNmt",
            Stage::Tts => "tts",
            Stage::Overall => "overall",
        }
    }

    /// Match a loosely spelled stage key such as `NMT`, `backNMT`,
    /// `langdetectionLatency` or `overall_pipeline`.
    pub fn from_key(key: &str) -> Option<Stage> {
        let folded: String = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let folded = folded.strip_suffix("ms").unwrap_or(&folded);
        let folded = folded.strip_suffix("latency").unwrap_or(folded);
        match folded {
            "langdetection" | "languagedetection" | "lid" => Some(Stage::LangDetection),
            "nmt" => Some(Stage::Nmt),
            "llm" => Some(Stage::Llm),
            "backnmt" => Some(Stage::BackNmt),
            "tts" => Some(Stage::Tts),
            "overall" | "overallpipeline" | "total" | "pipeline" => Some(Stage::Overall),
            _ => None,
        }
    }

    /// Service partition used by request counters; `None` for stages that
    /// are not billed as a service of their own.
    pub fn service(self) -> Option<Service> {
        match self {
            Stage::Nmt => Some(Service::Nmt),
            Stage::Llm => Some(Service::Llm),
            Stage::BackNmt => Some(Service::BackNmt),
            Stage::Tts => Some(Service::Tts),
            Stage::LangDetection | Stage::Overall => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Service partition for request counters and usage totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Nmt,
    Llm,
    BackNmt,
    Tts,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Nmt, Service::Llm, Service::BackNmt, Service::Tts];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_key(key: &str) -> Option<Service> {
        Stage::from_key(key.trim_end_matches("Usage").trim_end_matches("usage"))
            .and_then(Stage::service)
    }
}

/// One metric field after normalization.
///
/// Latencies are `Measured`, usage counts are `Count` so they stay exact
/// past 2^53. `Malformed` keeps the original wire text so the event can be
/// stored and retried even though it cannot be aggregated.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MetricField {
    #[default]
    Absent,
    Measured(f64),
    Count(u64),
    Malformed(String),
}

impl MetricField {
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricField::Measured(v) => Some(*v),
            MetricField::Count(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            MetricField::Count(n) => Some(*n),
            _ => None,
        }
    }
}

impl Serialize for MetricField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricField::Absent => serializer.serialize_none(),
            MetricField::Measured(v) => serializer.serialize_f64(*v),
            MetricField::Count(n) => serializer.serialize_u64(*n),
            MetricField::Malformed(raw) => serializer.serialize_str(raw),
        }
    }
}

impl<'de> Deserialize<'de> for MetricField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Stored {
            Count(u64),
            Number(f64),
            Text(String),
        }
        Ok(match Option::<Stored>::deserialize(deserializer)? {
            None => MetricField::Absent,
            Some(Stored::Count(n)) => MetricField::Count(n),
            Some(Stored::Number(v)) => MetricField::Measured(v),
            Some(Stored::Text(raw)) => MetricField::Malformed(raw),
        })
    }
}

/// Per-stage latency fields in milliseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLatencies {
    #[serde(default)]
    pub lang_detection_latency_ms: MetricField,
    #[serde(default)]
    pub nmt_latency_ms: MetricField,
    #[serde(default)]
    pub llm_latency_ms: MetricField,
    #[serde(default)]
    pub back_nmt_latency_ms: MetricField,
    #[serde(default)]
    pub tts_latency_ms: MetricField,
    #[serde(default)]
    pub overall_latency_ms: MetricField,
}

impl StageLatencies {
    pub fn get(&self, stage: Stage) -> &MetricField {
        match stage {
            Stage::LangDetection => &self.lang_detection_latency_ms,
            Stage::Nmt => &self.nmt_latency_ms,
            Stage::Llm => &self.llm_latency_ms,
            Stage::BackNmt => &self.back_nmt_latency_ms,
            Stage::Tts => &self.tts_latency_ms,
            Stage::Overall => &self.overall_latency_ms,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut MetricField {
        match stage {
            Stage::LangDetection => &mut self.lang_detection_latency_ms,
            Stage::Nmt => &mut self.nmt_latency_ms,
            Stage::Llm => &mut self.llm_latency_ms,
            Stage::BackNmt => &mut self.back_nmt_latency_ms,
            Stage::Tts => &mut self.tts_latency_ms,
            Stage::Overall => &mut self.overall_latency_ms,
        }
    }
}

/// Per-service usage: characters for NMT/backNMT/TTS, tokens for LLM.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUsage {
    #[serde(default)]
    pub nmt_usage: MetricField,
    #[serde(default)]
    pub llm_usage: MetricField,
    #[serde(default)]
    pub back_nmt_usage: MetricField,
    #[serde(default)]
    pub tts_usage: MetricField,
}

impl ServiceUsage {
    pub fn get(&self, service: Service) -> &MetricField {
        match service {
            Service::Nmt => &self.nmt_usage,
            Service::Llm => &self.llm_usage,
            Service::BackNmt => &self.back_nmt_usage,
            Service::Tts => &self.tts_usage,
        }
    }

    pub fn get_mut(&mut self, service: Service) -> &mut MetricField {
        match service {
            Service::Nmt => &mut self.nmt_usage,
            Service::Llm => &mut self.llm_usage,
            Service::BackNmt => &mut self.back_nmt_usage,
            Service::Tts => &mut self.tts_usage,
        }
    }
}

/// Immutable record of one completed pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub request_id: String,
    pub customer_name: String,
    pub customer_app: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub latency: StageLatencies,
    #[serde(flatten)]
    pub usage: ServiceUsage,
}

impl PipelineEvent {
    pub fn key(&self) -> AppKey {
        AppKey::new(&self.customer_name, &self.customer_app)
    }
}

/// Aggregation key: one customer application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppKey {
    pub customer: String,
    pub app: String,
}

impl AppKey {
    pub fn new(customer: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            app: app.into(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.customer, self.app)
    }
}

/// Event as held by the store: its position in the log plus ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub offset: u64,
    pub ingested_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PipelineEvent,
}
