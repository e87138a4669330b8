// Aggregator - incremental latency/usage aggregation
// Keeps one lock-guarded aggregate per customer application so that
// different applications are folded in parallel, and rebuilds everything
// from the event store on demand
//
// Numan Thabit 2025 Nov

pub mod reservoir;
pub mod state;
pub mod summary;

pub use state::{AggregateState, AggregatorSettings, AppAggregate};
pub use summary::{CustomerAggregate, LatencySummary, ServiceBreakdown, UsageTotals};

use crate::errors::MetricsError;
use crate::model::{AppKey, StoredEvent};
use crate::store::{EventStore, ScanFilter};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Outcome of a full replay.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RecomputeReport {
    pub replayed: u64,
    pub aggregated: u64,
    /// Offsets whose events still fail aggregation.
    pub failed: Vec<u64>,
    pub elapsed_ms: f64,
}

pub struct Aggregator {
    settings: AggregatorSettings,
    apps: RwLock<HashMap<AppKey, Arc<Mutex<AppAggregate>>>>,
    aggregated: AtomicU64,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            apps: RwLock::new(HashMap::new()),
            aggregated: AtomicU64::new(0),
        }
    }

    /// Number of events folded into derived state since the last rebuild.
    pub fn aggregated(&self) -> u64 {
        self.aggregated.load(Ordering::Relaxed)
    }

    /// Fold one stored event into its application's aggregate.
    #[tracing::instrument(skip_all, fields(offset = stored.offset, customer = %stored.event.customer_name, app = %stored.event.customer_app))]
    pub async fn on_event(&self, stored: &StoredEvent) -> Result<(), MetricsError> {
        let slot = self.slot(stored.event.key()).await;
        let mut aggregate = slot.lock().await;
        aggregate.apply(stored)?;
        self.aggregated.fetch_add(1, Ordering::Relaxed);
        debug!(requests = aggregate.requests(), "event aggregated");
        Ok(())
    }

    async fn slot(&self, key: AppKey) -> Arc<Mutex<AppAggregate>> {
        if let Some(slot) = self.apps.read().await.get(&key) {
            return Arc::clone(slot);
        }
        let mut apps = self.apps.write().await;
        let settings = self.settings;
        Arc::clone(
            apps.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(settings.new_app(key)))),
        )
    }

    /// Drop all derived state and replay the store in ingestion order.
    ///
    /// Callers must keep new events from being folded while this runs; the
    /// ingestion service does that with its gate.
    pub async fn recompute_all(&self, store: &EventStore) -> RecomputeReport {
        let started = Instant::now();
        let mut state = AggregateState::new(self.settings);
        let mut report = RecomputeReport::default();

        let mut events = Box::pin(store.scan(ScanFilter::default()));
        while let Some(stored) = events.next().await {
            report.replayed += 1;
            match state.apply(&stored) {
                Ok(()) => report.aggregated += 1,
                Err(err) => {
                    debug!(offset = stored.offset, error = %err, "replay skipped event");
                    report.failed.push(stored.offset);
                }
            }
        }

        let rebuilt: HashMap<_, _> = state
            .into_apps()
            .map(|(key, app)| (key, Arc::new(Mutex::new(app))))
            .collect();
        *self.apps.write().await = rebuilt;
        self.aggregated.store(report.aggregated, Ordering::Relaxed);

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            replayed = report.replayed,
            aggregated = report.aggregated,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed_ms,
            "derived state rebuilt from event store"
        );
        report
    }

    /// Snapshot of every application of one customer, sorted by app name.
    /// Applications with no aggregated request are left out.
    pub async fn customer_snapshot(&self, customer: &str) -> Vec<CustomerAggregate> {
        let slots: Vec<_> = self
            .apps
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.customer == customer)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        collect_snapshots(slots).await
    }

    /// Snapshot of every application, sorted by (customer, app).
    pub async fn snapshot_all(&self) -> Vec<CustomerAggregate> {
        let slots: Vec<_> = self.apps.read().await.values().cloned().collect();
        collect_snapshots(slots).await
    }
}

async fn collect_snapshots(slots: Vec<Arc<Mutex<AppAggregate>>>) -> Vec<CustomerAggregate> {
    let mut rows = Vec::with_capacity(slots.len());
    for slot in slots {
        let aggregate = slot.lock().await;
        if aggregate.requests() > 0 {
            rows.push(aggregate.snapshot());
        }
    }
    rows.sort_by(|a, b| {
        (&a.customer_name, &a.customer_app).cmp(&(&b.customer_name, &b.customer_app))
    });
    rows
}
