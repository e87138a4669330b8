// Derived aggregate state
// Plain data plus the transition applied for every stored event. Nothing in
// here locks, logs to the network or touches the store, so replaying a slice
// of events through `AggregateState::apply` is all a test needs.
//
// Numan Thabit 2025 Nov

use super::reservoir::Reservoir;
use super::summary::{CustomerAggregate, LatencySummary, ServiceBreakdown, UsageTotals};
use crate::errors::MetricsError;
use crate::model::{AppKey, MetricField, Service, Stage, StoredEvent};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

pub const DEFAULT_RESERVOIR_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    pub reservoir_capacity: usize,
    /// Fixed seed for reservoir sampling; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
            seed: None,
        }
    }
}

impl AggregatorSettings {
    fn rng_for(&self, key: &AppKey) -> StdRng {
        match self.seed {
            Some(seed) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                StdRng::seed_from_u64(seed ^ hasher.finish())
            }
            None => StdRng::from_entropy(),
        }
    }

    pub fn new_app(&self, key: AppKey) -> AppAggregate {
        let rng = self.rng_for(&key);
        AppAggregate::new(key, self.reservoir_capacity, rng)
    }
}

/// Running latency statistics for one (customer, app, stage).
#[derive(Debug, Clone)]
pub struct LatencyStats {
    count: u64,
    mean: f64,
    reservoir: Reservoir,
}

impl LatencyStats {
    fn new(capacity: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            reservoir: Reservoir::new(capacity),
        }
    }

    fn record(&mut self, value: f64, rng: &mut StdRng) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
        self.reservoir.offer(value, rng);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn summary(&self) -> Option<LatencySummary> {
        let p = self.reservoir.percentiles()?;
        Some(LatencySummary {
            avg: self.mean,
            p90: p.p90,
            p95: p.p95,
            p99: p.p99,
            samples: self.count,
        })
    }
}

/// Running usage statistics for one (customer, app, service).
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    count: u64,
    mean: f64,
    total: u64,
}

impl UsageStats {
    fn record(&mut self, amount: u64) {
        self.count += 1;
        self.mean += (amount as f64 - self.mean) / self.count as f64;
        self.total = self.total.saturating_add(amount);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Everything derived for one customer application.
#[derive(Debug, Clone)]
pub struct AppAggregate {
    key: AppKey,
    requests: u64,
    latency: [LatencyStats; 6],
    usage: [UsageStats; 4],
    by_service: ServiceBreakdown,
    rng: StdRng,
}

/// Metric values of one event after validation, ready to be applied.
struct Samples {
    latency: [Option<f64>; 6],
    usage: [Option<u64>; 4],
}

impl AppAggregate {
    pub fn new(key: AppKey, reservoir_capacity: usize, rng: StdRng) -> Self {
        Self {
            key,
            requests: 0,
            latency: std::array::from_fn(|_| LatencyStats::new(reservoir_capacity)),
            usage: Default::default(),
            by_service: ServiceBreakdown::default(),
            rng,
        }
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn latency(&self, stage: Stage) -> &LatencyStats {
        &self.latency[stage.index()]
    }

    pub fn usage(&self, service: Service) -> &UsageStats {
        &self.usage[service.index()]
    }

    /// Fold one event into the aggregate. Either every field is applied or,
    /// on the first malformed field, nothing is.
    pub fn apply(&mut self, stored: &StoredEvent) -> Result<(), MetricsError> {
        let samples = extract(stored)?;

        let mut exercised = [false; 4];
        for stage in Stage::ALL {
            if let Some(value) = samples.latency[stage.index()] {
                self.latency[stage.index()].record(value, &mut self.rng);
                if let Some(service) = stage.service() {
                    exercised[service.index()] = true;
                }
            }
        }
        for service in Service::ALL {
            if let Some(amount) = samples.usage[service.index()] {
                self.usage[service.index()].record(amount);
                exercised[service.index()] = true;
            }
        }
        for service in Service::ALL {
            if exercised[service.index()] {
                self.by_service.bump(service);
            }
        }
        self.requests += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> CustomerAggregate {
        let latency = |stage: Stage| self.latency[stage.index()].summary();
        let usage = |service: Service| self.usage[service.index()].mean();
        let mut totals = UsageTotals::default();
        for service in Service::ALL {
            totals.set(service, self.usage[service.index()].total());
        }

        CustomerAggregate {
            customer_name: self.key.customer.clone(),
            customer_app: self.key.app.clone(),
            requests: self.requests,
            lang_detection_latency: latency(Stage::LangDetection),
            nmt_latency: latency(Stage::Nmt),
            llm_latency: latency(Stage::Llm),
            back_nmt_latency: latency(Stage::BackNmt),
            tts_latency: latency(Stage::Tts),
            overall_latency: latency(Stage::Overall),
            nmt_usage: usage(Service::Nmt),
            llm_usage: usage(Service::Llm),
            back_nmt_usage: usage(Service::BackNmt),
            tts_usage: usage(Service::Tts),
            usage_totals: totals,
            requests_by_service: self.by_service,
        }
    }
}

fn extract(stored: &StoredEvent) -> Result<Samples, MetricsError> {
    let malformed = |what: String, raw: &str| MetricsError::Aggregation {
        offset: stored.offset,
        reason: format!("{what} has unparseable value {raw:?}"),
    };

    let mut latency = [None; 6];
    for stage in Stage::ALL {
        latency[stage.index()] = match stored.event.latency.get(stage) {
            MetricField::Absent => None,
            MetricField::Measured(v) if v.is_finite() && *v >= 0.0 => Some(*v),
            MetricField::Count(n) => Some(*n as f64),
            MetricField::Measured(v) => return Err(malformed(format!("{stage} latency"), &v.to_string())),
            MetricField::Malformed(raw) => return Err(malformed(format!("{stage} latency"), raw)),
        };
    }

    let mut usage = [None; 4];
    for service in Service::ALL {
        let label = || format!("{service:?} usage");
        usage[service.index()] = match stored.event.usage.get(service) {
            MetricField::Absent => None,
            MetricField::Count(n) => Some(*n),
            MetricField::Measured(v) if *v >= 0.0 && v.fract() == 0.0 && *v < u64::MAX as f64 => {
                Some(*v as u64)
            }
            MetricField::Measured(v) => return Err(malformed(label(), &v.to_string())),
            MetricField::Malformed(raw) => return Err(malformed(label(), raw)),
        };
    }

    Ok(Samples { latency, usage })
}

/// The whole derived state: one aggregate per customer application.
#[derive(Debug, Default)]
pub struct AggregateState {
    settings: AggregatorSettings,
    apps: HashMap<AppKey, AppAggregate>,
}

impl AggregateState {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            apps: HashMap::new(),
        }
    }

    pub fn apply(&mut self, stored: &StoredEvent) -> Result<(), MetricsError> {
        let key = stored.event.key();
        let settings = self.settings;
        self.apps
            .entry(key.clone())
            .or_insert_with(|| settings.new_app(key))
            .apply(stored)
    }

    pub fn get(&self, key: &AppKey) -> Option<&AppAggregate> {
        self.apps.get(key)
    }

    pub fn into_apps(self) -> impl Iterator<Item = (AppKey, AppAggregate)> {
        self.apps.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{event, with_latency, with_usage};
    use chrono::Utc;

    fn stored(offset: u64, event: crate::model::PipelineEvent) -> StoredEvent {
        StoredEvent {
            offset,
            ingested_at: Utc::now(),
            event,
        }
    }

    fn seeded() -> AggregateState {
        AggregateState::new(AggregatorSettings {
            reservoir_capacity: 1000,
            seed: Some(9),
        })
    }

    #[test]
    fn nmt_scenario_average_and_percentiles() {
        let mut state = seeded();
        for (i, ms) in [100.0, 200.0, 300.0].into_iter().enumerate() {
            let e = with_latency(event(&format!("r{i}"), "custA", "app1"), Stage::Nmt, ms);
            state.apply(&stored(i as u64, e)).unwrap();
        }
        let snap = state.get(&AppKey::new("custA", "app1")).unwrap().snapshot();
        let nmt = snap.nmt_latency.unwrap();
        assert!((nmt.avg - 200.0).abs() < 1e-9);
        assert_eq!((nmt.p90, nmt.p95, nmt.p99), (300.0, 300.0, 300.0));
        assert_eq!(nmt.samples, 3);
        assert_eq!(snap.requests_by_service.nmt, 3);
    }

    #[test]
    fn welford_mean_matches_direct_mean() {
        let mut state = seeded();
        let samples: Vec<f64> = (0..5000).map(|i| 1e6 + f64::from(i % 97) * 0.37).collect();
        for (i, ms) in samples.iter().enumerate() {
            let e = with_latency(event("r", "custA", "app1"), Stage::Llm, *ms);
            state.apply(&stored(i as u64, e)).unwrap();
        }
        let direct = samples.iter().sum::<f64>() / samples.len() as f64;
        let llm = state.get(&AppKey::new("custA", "app1")).unwrap().latency(Stage::Llm);
        assert!((llm.mean().unwrap() - direct).abs() < 1e-6);
        assert_eq!(llm.count(), 5000);
    }

    #[test]
    fn unused_stage_is_none_not_zero() {
        let mut state = seeded();
        let e = with_usage(
            with_latency(event("r1", "custB", "app1"), Stage::Nmt, 50.0),
            Service::Nmt,
            40,
        );
        state.apply(&stored(0, e)).unwrap();
        let snap = state.get(&AppKey::new("custB", "app1")).unwrap().snapshot();
        assert!(snap.tts_latency.is_none());
        assert!(snap.tts_usage.is_none());
        assert_eq!(snap.usage_totals.tts_chars, 0);
        assert_eq!(snap.usage_totals.nmt_chars, 40);
        assert_eq!(snap.nmt_usage, Some(40.0));
    }

    #[test]
    fn numeric_zero_latency_counts_as_sample() {
        let mut state = seeded();
        let e = with_latency(event("r1", "custA", "app1"), Stage::LangDetection, 0.0);
        state.apply(&stored(0, e)).unwrap();
        let snap = state.get(&AppKey::new("custA", "app1")).unwrap().snapshot();
        assert_eq!(snap.lang_detection_latency.unwrap().avg, 0.0);
    }

    #[test]
    fn malformed_field_leaves_state_untouched() {
        let mut state = seeded();
        let mut e = with_latency(event("r1", "custA", "app1"), Stage::Nmt, 120.0);
        e.latency.tts_latency_ms = MetricField::Malformed("slow".into());
        let err = state.apply(&stored(4, e)).unwrap_err();
        assert!(matches!(err, MetricsError::Aggregation { offset: 4, .. }));

        let app = state.get(&AppKey::new("custA", "app1")).unwrap();
        assert_eq!(app.requests(), 0);
        assert_eq!(app.latency(Stage::Nmt).count(), 0);
    }

    #[test]
    fn percentiles_are_monotone_for_every_stage() {
        let mut state = seeded();
        for i in 0..2500u32 {
            let mut e = event("r", "custA", "app1");
            for (n, stage) in Stage::ALL.into_iter().enumerate() {
                let ms = f64::from((i * 7919 + n as u32 * 31) % 1000);
                e = with_latency(e, stage, ms);
            }
            state.apply(&stored(u64::from(i), e)).unwrap();
        }
        let snap = state.get(&AppKey::new("custA", "app1")).unwrap().snapshot();
        for stage in Stage::ALL {
            let s = snap.latency(stage).unwrap();
            assert!(s.p90 <= s.p95 && s.p95 <= s.p99, "{stage}: {s:?}");
        }
    }

    #[test]
    fn services_counted_once_per_request() {
        let mut state = seeded();
        let e = with_usage(
            with_latency(event("r1", "custA", "app1"), Stage::Llm, 80.0),
            Service::Llm,
            512,
        );
        state.apply(&stored(0, e)).unwrap();
        let e = with_latency(event("r2", "custA", "app1"), Stage::Overall, 900.0);
        state.apply(&stored(1, e)).unwrap();

        let snap = state.get(&AppKey::new("custA", "app1")).unwrap().snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.requests_by_service.llm, 1);
        assert_eq!(snap.requests_by_service.nmt, 0);
        assert_eq!(snap.usage_totals.llm_tokens, 512);
    }
}
