// Ingest normalizer
// Converts every accepted wire shape of a pipeline-completion record into
// the strict internal PipelineEvent
//
// Numan Thabit 2025 Nov

use crate::errors::MetricsError;
use crate::model::{MetricField, PipelineEvent, Service, ServiceUsage, Stage, StageLatencies};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Accepted spellings per field, preferred first. When a body carries more
/// than one spelling of a field, only the preferred one is read.
const SPELLINGS: &[&[&str]] = &[
    &["requestId", "requestid", "request_id"],
    &["customerName", "customername", "customer_name"],
    &["customerApp", "customerapp", "customerAppName", "customer_app"],
    &[
        "langDetectionLatencyMs",
        "langDetectionLatency",
        "langdetectionLatency",
        "langdetectionlatency",
    ],
    &["nmtLatencyMs", "nmtLatency", "nmtlatency"],
    &["llmLatencyMs", "llmLatency", "llmlatency"],
    &["backNmtLatencyMs", "backNmtLatency", "backnmtlatency"],
    &["ttsLatencyMs", "ttsLatency", "ttslatency"],
    &[
        "overallLatencyMs",
        "overallLatency",
        "overallPipelineLatency",
        "overallpipelinelatency",
    ],
    &["nmtUsage", "nmtusage"],
    &["llmUsage", "llmusage"],
    &["backNmtUsage", "backnmtusage"],
    &["ttsUsage", "ttsusage"],
];

/// Wire record as producers send it. Metric fields are kept as raw JSON so
/// that string-or-number values and sentinels can be normalized here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(alias = "requestid", alias = "request_id")]
    pub request_id: Option<Value>,
    #[serde(alias = "customername", alias = "customer_name")]
    pub customer_name: Option<String>,
    #[serde(alias = "customerapp", alias = "customerAppName", alias = "customer_app")]
    pub customer_app: Option<String>,
    pub timestamp: Option<Value>,

    #[serde(
        alias = "langDetectionLatency",
        alias = "langdetectionLatency",
        alias = "langdetectionlatency"
    )]
    pub lang_detection_latency_ms: Option<Value>,
    #[serde(alias = "nmtLatency", alias = "nmtlatency")]
    pub nmt_latency_ms: Option<Value>,
    #[serde(alias = "llmLatency", alias = "llmlatency")]
    pub llm_latency_ms: Option<Value>,
    #[serde(alias = "backNmtLatency", alias = "backnmtlatency")]
    pub back_nmt_latency_ms: Option<Value>,
    #[serde(alias = "ttsLatency", alias = "ttslatency")]
    pub tts_latency_ms: Option<Value>,
    #[serde(
        alias = "overallLatency",
        alias = "overallPipelineLatency",
        alias = "overallpipelinelatency"
    )]
    pub overall_latency_ms: Option<Value>,

    #[serde(alias = "nmtusage")]
    pub nmt_usage: Option<Value>,
    #[serde(alias = "llmusage")]
    pub llm_usage: Option<Value>,
    #[serde(alias = "backnmtusage")]
    pub back_nmt_usage: Option<Value>,
    #[serde(alias = "ttsusage")]
    pub tts_usage: Option<Value>,
}

impl RawEvent {
    /// Parse an arbitrary JSON body; a body that is not an object, or whose
    /// identity fields have the wrong JSON type, is a validation failure.
    pub fn from_json(mut body: Value) -> Result<Self, MetricsError> {
        if let Value::Object(fields) = &mut body {
            keep_preferred_spellings(fields);
        }
        serde_json::from_value(body)
            .map_err(|e| MetricsError::Validation(format!("malformed event body: {e}")))
    }

    fn latency(&self, stage: Stage) -> Option<&Value> {
        match stage {
            Stage::LangDetection => self.lang_detection_latency_ms.as_ref(),
            Stage::Nmt => self.nmt_latency_ms.as_ref(),
            Stage::Llm => self.llm_latency_ms.as_ref(),
            Stage::BackNmt => self.back_nmt_latency_ms.as_ref(),
            Stage::Tts => self.tts_latency_ms.as_ref(),
            Stage::Overall => self.overall_latency_ms.as_ref(),
        }
    }

    pub fn set_latency(&mut self, stage: Stage, value: Value) {
        let slot = match stage {
            Stage::LangDetection => &mut self.lang_detection_latency_ms,
            Stage::Nmt => &mut self.nmt_latency_ms,
            Stage::Llm => &mut self.llm_latency_ms,
            Stage::BackNmt => &mut self.back_nmt_latency_ms,
            Stage::Tts => &mut self.tts_latency_ms,
            Stage::Overall => &mut self.overall_latency_ms,
        };
        *slot = Some(value);
    }

    fn usage(&self, service: Service) -> Option<&Value> {
        match service {
            Service::Nmt => self.nmt_usage.as_ref(),
            Service::Llm => self.llm_usage.as_ref(),
            Service::BackNmt => self.back_nmt_usage.as_ref(),
            Service::Tts => self.tts_usage.as_ref(),
        }
    }

    pub fn set_usage(&mut self, service: Service, value: Value) {
        let slot = match service {
            Service::Nmt => &mut self.nmt_usage,
            Service::Llm => &mut self.llm_usage,
            Service::BackNmt => &mut self.back_nmt_usage,
            Service::Tts => &mut self.tts_usage,
        };
        *slot = Some(value);
    }
}

fn keep_preferred_spellings(fields: &mut Map<String, Value>) {
    for spellings in SPELLINGS {
        let mut present = spellings.iter().filter(|name| fields.contains_key(**name));
        let Some(kept) = present.next() else {
            continue;
        };
        let dropped: Vec<&str> = present.copied().collect();
        for name in dropped {
            debug!(kept = *kept, dropped = name, "ignoring duplicate field spelling");
            fields.remove(name);
        }
    }
}

/// Normalize a wire record. Only identity problems are rejected; metric
/// values that cannot be parsed are kept as `Malformed` for the aggregator.
pub fn normalize(raw: RawEvent) -> Result<PipelineEvent, MetricsError> {
    let request_id = match &raw.request_id {
        Some(Value::String(s)) => required("requestId", Some(s.as_str()))?,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) | None => return Err(missing("requestId")),
        Some(other) => {
            return Err(MetricsError::Validation(format!(
                "requestId must be a string, got {other}"
            )))
        }
    };
    let customer_name = required("customerName", raw.customer_name.as_deref())?;
    let customer_app = required("customerApp", raw.customer_app.as_deref())?;
    let timestamp = match &raw.timestamp {
        Some(value) if !value.is_null() => parse_timestamp(value)?,
        _ => return Err(missing("timestamp")),
    };

    let mut latency = StageLatencies::default();
    for stage in Stage::ALL {
        *latency.get_mut(stage) = normalize_latency(raw.latency(stage));
    }
    let mut usage = ServiceUsage::default();
    for service in Service::ALL {
        *usage.get_mut(service) = normalize_usage(raw.usage(service));
    }

    Ok(PipelineEvent {
        request_id,
        customer_name,
        customer_app,
        timestamp,
        latency,
        usage,
    })
}

fn missing(field: &str) -> MetricsError {
    MetricsError::Validation(format!("missing required field {field}"))
}

fn required(field: &str, value: Option<&str>) -> Result<String, MetricsError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(missing(field)),
    }
}

fn is_sentinel(text: &str) -> bool {
    matches!(text, "" | "none" | "None" | "NONE" | "null" | "-")
}

/// Latency: a JSON number is always a sample (0 included); strings may carry
/// an `ms` suffix, and a string that reads as zero means the stage was skipped.
pub fn normalize_latency(value: Option<&Value>) -> MetricField {
    match value {
        None | Some(Value::Null) => MetricField::Absent,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() && v >= 0.0 => MetricField::Measured(v),
            _ => MetricField::Malformed(n.to_string()),
        },
        Some(Value::String(s)) => {
            let text = s.trim();
            if is_sentinel(text) {
                return MetricField::Absent;
            }
            let digits = text
                .strip_suffix("ms")
                .or_else(|| text.strip_suffix("MS"))
                .unwrap_or(text)
                .trim_end();
            match digits.parse::<f64>() {
                Ok(v) if v == 0.0 => MetricField::Absent,
                Ok(v) if v.is_finite() && v > 0.0 => MetricField::Measured(v),
                _ => MetricField::Malformed(s.clone()),
            }
        }
        Some(other) => MetricField::Malformed(other.to_string()),
    }
}

/// Usage: non-negative integral counts, as number or string. Counts are
/// kept as `u64` end to end.
pub fn normalize_usage(value: Option<&Value>) -> MetricField {
    match value {
        None | Some(Value::Null) => MetricField::Absent,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => MetricField::Count(v),
            // integral floats such as `120.0`
            None => match n.as_f64() {
                Some(v) if v >= 0.0 && v.fract() == 0.0 && v < u64::MAX as f64 => {
                    MetricField::Count(v as u64)
                }
                _ => MetricField::Malformed(n.to_string()),
            },
        },
        Some(Value::String(s)) => {
            let text = s.trim();
            if is_sentinel(text) {
                return MetricField::Absent;
            }
            match text.parse::<u64>() {
                Ok(v) => MetricField::Count(v),
                Err(_) => MetricField::Malformed(s.clone()),
            }
        }
        Some(other) => MetricField::Malformed(other.to_string()),
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, MetricsError> {
    let invalid = || MetricsError::Validation(format!("unrecognized timestamp {value}"));
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().ok_or_else(invalid)?;
            Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid)
        }
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return Err(missing("timestamp"));
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                return Ok(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}
