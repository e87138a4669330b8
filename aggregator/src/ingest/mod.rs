// Ingestion API
// Boundary between pipeline executors and the event store: normalize,
// append (the durability boundary), then fold into derived state. Events
// whose aggregation fails stay stored and are retried by a background sweep.
//
// Numan Thabit 2025 Nov

pub mod normalize;

pub use normalize::{normalize, RawEvent};

use crate::aggregate::{Aggregator, RecomputeReport};
use crate::errors::MetricsError;
use crate::metrics::{
    AGGREGATION_FAILURES, DATA_QUALITY_WARNINGS, EVENTS_INGESTED, EVENTS_UNAGGREGATED,
    INGEST_REJECTED,
};
use crate::model::{PipelineEvent, Stage};
use crate::store::EventStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Returned once the event is durably appended, whatever the aggregation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub request_id: String,
    pub offset: u64,
    /// False when the event is stored but waiting for the retry sweep.
    pub aggregated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub stored: u64,
    pub aggregated: u64,
    pub pending: usize,
    pub unaggregated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent {
    pub offset: u64,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub retried: usize,
    pub recovered: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    attempts: u32,
    last_error: String,
}

pub struct IngestionService {
    store: Arc<EventStore>,
    aggregator: Arc<Aggregator>,
    pending: Mutex<BTreeMap<u64, PendingEntry>>,
    unaggregated: Mutex<BTreeMap<u64, PendingEntry>>,
    /// Submissions and sweeps share it; a rebuild takes it exclusively.
    gate: RwLock<()>,
    max_attempts: u32,
}

impl IngestionService {
    pub fn new(store: Arc<EventStore>, aggregator: Arc<Aggregator>, max_attempts: u32) -> Self {
        Self {
            store,
            aggregator,
            pending: Mutex::new(BTreeMap::new()),
            unaggregated: Mutex::new(BTreeMap::new()),
            gate: RwLock::new(()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Normalize a wire body and submit it.
    pub async fn submit_raw(&self, body: serde_json::Value) -> Result<Ack, MetricsError> {
        let event = RawEvent::from_json(body)
            .and_then(normalize)
            .inspect_err(|err| {
                INGEST_REJECTED.with_label_values(&["validation"]).inc();
                debug!(error = %err, "event rejected at normalization");
            })?;
        self.submit(event).await
    }

    #[tracing::instrument(skip_all, fields(request_id = %event.request_id, customer = %event.customer_name, app = %event.customer_app))]
    pub async fn submit(&self, event: PipelineEvent) -> Result<Ack, MetricsError> {
        check_data_quality(&event);

        let _gate = self.gate.read().await;
        let stored = self.store.append_record(event).await.inspect_err(|err| {
            let reason = match err {
                MetricsError::Validation(_) => "validation",
                _ => "unavailable",
            };
            INGEST_REJECTED.with_label_values(&[reason]).inc();
        })?;
        EVENTS_INGESTED.inc();

        let aggregated = match self.aggregator.on_event(&stored).await {
            Ok(()) => true,
            Err(err) => {
                AGGREGATION_FAILURES.inc();
                warn!(offset = stored.offset, error = %err, "aggregation failed; event flagged for retry");
                self.pending.lock().await.insert(
                    stored.offset,
                    PendingEntry {
                        attempts: 1,
                        last_error: err.to_string(),
                    },
                );
                false
            }
        };

        Ok(Ack {
            request_id: stored.event.request_id.clone(),
            offset: stored.offset,
            aggregated,
        })
    }

    /// Retry every pending event once. Events that reach the attempt bound
    /// move to the unaggregated set.
    pub async fn sweep_pending(&self) -> SweepReport {
        let _gate = self.gate.read().await;
        let offsets: Vec<u64> = self.pending.lock().await.keys().copied().collect();
        let mut report = SweepReport::default();

        for offset in offsets {
            let Some(stored) = self.store.get(offset).await else {
                warn!(offset, "pending offset missing from event store");
                self.pending.lock().await.remove(&offset);
                continue;
            };
            report.retried += 1;

            match self.aggregator.on_event(&stored).await {
                Ok(()) => {
                    self.pending.lock().await.remove(&offset);
                    report.recovered += 1;
                    info!(offset, "pending event aggregated on retry");
                }
                Err(err) => {
                    AGGREGATION_FAILURES.inc();
                    let exhausted = {
                        let mut pending = self.pending.lock().await;
                        let Some(entry) = pending.get_mut(&offset) else {
                            continue;
                        };
                        entry.attempts += 1;
                        entry.last_error = err.to_string();
                        if entry.attempts >= self.max_attempts {
                            pending.remove(&offset)
                        } else {
                            None
                        }
                    };
                    if let Some(entry) = exhausted {
                        error!(
                            offset,
                            request_id = %stored.event.request_id,
                            attempts = entry.attempts,
                            error = %entry.last_error,
                            "event permanently unaggregated"
                        );
                        EVENTS_UNAGGREGATED.inc();
                        self.unaggregated.lock().await.insert(offset, entry);
                        report.exhausted += 1;
                    }
                }
            }
        }

        if report.retried > 0 {
            debug!(
                retried = report.retried,
                recovered = report.recovered,
                exhausted = report.exhausted,
                "retry sweep finished"
            );
        }
        report
    }

    /// Rebuild derived state from the store. Offsets that still fail go back
    /// to pending unless they were already given up on.
    pub async fn recompute(&self) -> RecomputeReport {
        let _gate = self.gate.write().await;
        let report = self.aggregator.recompute_all(&self.store).await;

        let mut pending = self.pending.lock().await;
        let unaggregated = self.unaggregated.lock().await;
        let previous = std::mem::take(&mut *pending);
        for offset in &report.failed {
            if unaggregated.contains_key(offset) {
                continue;
            }
            let entry = previous.get(offset).cloned().unwrap_or(PendingEntry {
                attempts: 1,
                last_error: "failed during replay".to_string(),
            });
            pending.insert(*offset, entry);
        }
        report
    }

    pub async fn status(&self) -> IngestionStatus {
        IngestionStatus {
            stored: self.store.len().await,
            aggregated: self.aggregator.aggregated(),
            pending: self.pending.lock().await.len(),
            unaggregated: self.unaggregated.lock().await.len(),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending(&self) -> Vec<PendingEvent> {
        to_rows(&*self.pending.lock().await)
    }

    pub async fn unaggregated(&self) -> Vec<PendingEvent> {
        to_rows(&*self.unaggregated.lock().await)
    }
}

fn to_rows(entries: &BTreeMap<u64, PendingEntry>) -> Vec<PendingEvent> {
    entries
        .iter()
        .map(|(offset, entry)| PendingEvent {
            offset: *offset,
            attempts: entry.attempts,
            last_error: entry.last_error.clone(),
        })
        .collect()
}

/// Warn when the overall latency is below one of the stage latencies.
/// Never rejects the event.
pub fn check_data_quality(event: &PipelineEvent) -> bool {
    let Some(overall) = event.latency.overall_latency_ms.value() else {
        return true;
    };
    let slowest = Stage::ALL
        .into_iter()
        .filter(|s| *s != Stage::Overall)
        .filter_map(|s| event.latency.get(s).value().map(|v| (s, v)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match slowest {
        Some((stage, ms)) if ms > overall => {
            DATA_QUALITY_WARNINGS
                .with_label_values(&["overall_below_stage"])
                .inc();
            warn!(
                request_id = %event.request_id,
                customer = %event.customer_name,
                stage = %stage,
                stage_ms = ms,
                overall_ms = overall,
                "overall latency below stage latency"
            );
            false
        }
        _ => true,
    }
}

/// Start the retry sweep task.
/// Spawns a background task that retries pending aggregations every `interval`.
pub fn start_retry_sweep(
    service: Arc<IngestionService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if service.pending_count().await == 0 {
                continue;
            }
            let report = service.sweep_pending().await;
            if report.exhausted > 0 {
                warn!(exhausted = report.exhausted, "retry sweep gave up on events");
            }
        }
    })
}
