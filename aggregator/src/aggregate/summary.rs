// Read-side snapshots of derived state
// These are the shapes handed to the query service and the dashboard
//
// Numan Thabit 2025 Nov

use crate::model::{Service, Stage};
use serde::Serialize;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: u64,
}

/// Request counts partitioned by exercised service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceBreakdown {
    #[serde(rename = "NMT")]
    pub nmt: u64,
    #[serde(rename = "LLM")]
    pub llm: u64,
    #[serde(rename = "TTS")]
    pub tts: u64,
    #[serde(rename = "backNMT")]
    pub back_nmt: u64,
}

impl ServiceBreakdown {
    pub fn bump(&mut self, service: Service) {
        match service {
            Service::Nmt => self.nmt += 1,
            Service::Llm => self.llm += 1,
            Service::Tts => self.tts += 1,
            Service::BackNmt => self.back_nmt += 1,
        }
    }
}

impl AddAssign for ServiceBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.nmt = self.nmt.saturating_add(rhs.nmt);
        self.llm = self.llm.saturating_add(rhs.llm);
        self.tts = self.tts.saturating_add(rhs.tts);
        self.back_nmt = self.back_nmt.saturating_add(rhs.back_nmt);
    }
}

/// Cumulative usage: characters for NMT/TTS/backNMT, tokens for LLM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    #[serde(rename = "NMT_chars")]
    pub nmt_chars: u64,
    #[serde(rename = "LLM_tokens")]
    pub llm_tokens: u64,
    #[serde(rename = "TTS_chars")]
    pub tts_chars: u64,
    #[serde(rename = "backNMT_chars")]
    pub back_nmt_chars: u64,
}

impl UsageTotals {
    pub fn set(&mut self, service: Service, amount: u64) {
        match service {
            Service::Nmt => self.nmt_chars = amount,
            Service::Llm => self.llm_tokens = amount,
            Service::Tts => self.tts_chars = amount,
            Service::BackNmt => self.back_nmt_chars = amount,
        }
    }
}

impl AddAssign for UsageTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.nmt_chars = self.nmt_chars.saturating_add(rhs.nmt_chars);
        self.llm_tokens = self.llm_tokens.saturating_add(rhs.llm_tokens);
        self.tts_chars = self.tts_chars.saturating_add(rhs.tts_chars);
        self.back_nmt_chars = self.back_nmt_chars.saturating_add(rhs.back_nmt_chars);
    }
}

/// One row of the per-customer aggregate table.
///
/// Stages and usage dimensions without samples are `None` (serialized as
/// `null`), so "not used" is never confused with "used and fast".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAggregate {
    pub customer_name: String,
    pub customer_app: String,
    pub requests: u64,
    pub lang_detection_latency: Option<LatencySummary>,
    pub nmt_latency: Option<LatencySummary>,
    pub llm_latency: Option<LatencySummary>,
    pub back_nmt_latency: Option<LatencySummary>,
    pub tts_latency: Option<LatencySummary>,
    pub overall_latency: Option<LatencySummary>,
    pub nmt_usage: Option<f64>,
    pub llm_usage: Option<f64>,
    pub back_nmt_usage: Option<f64>,
    pub tts_usage: Option<f64>,
    pub usage_totals: UsageTotals,
    pub requests_by_service: ServiceBreakdown,
}

impl CustomerAggregate {
    pub fn latency(&self, stage: Stage) -> Option<&LatencySummary> {
        match stage {
            Stage::LangDetection => self.lang_detection_latency.as_ref(),
            Stage::Nmt => self.nmt_latency.as_ref(),
            Stage::Llm => self.llm_latency.as_ref(),
            Stage::BackNmt => self.back_nmt_latency.as_ref(),
            Stage::Tts => self.tts_latency.as_ref(),
            Stage::Overall => self.overall_latency.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let mut totals = UsageTotals::default();
        totals.set(Service::Llm, u64::MAX);
        let mut other = UsageTotals::default();
        other.set(Service::Llm, u64::MAX);
        other.set(Service::Nmt, 7);
        totals += other;
        assert_eq!(totals.llm_tokens, u64::MAX);
        assert_eq!(totals.nmt_chars, 7);

        let mut counts = ServiceBreakdown {
            nmt: u64::MAX,
            ..Default::default()
        };
        counts += ServiceBreakdown {
            nmt: 1,
            tts: 2,
            ..Default::default()
        };
        assert_eq!(counts.nmt, u64::MAX);
        assert_eq!(counts.tts, 2);
    }
}
