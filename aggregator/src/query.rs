// Query service
// Read-only views over the event store and derived state: global feed,
// per-customer aggregate, request counters, data processed, chart series
//
// Numan Thabit 2025 Nov

use crate::aggregate::{Aggregator, CustomerAggregate, ServiceBreakdown, UsageTotals};
use crate::errors::MetricsError;
use crate::metrics::QUERY_LATENCY;
use crate::model::{Stage, StoredEvent};
use crate::store::{EventStore, ScanFilter};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine as _};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_FEED_LIMIT: usize = 50;
pub const MAX_FEED_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub events: Vec<StoredEvent>,
    /// Pass back as `cursor` to continue with older events.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAggregateResponse {
    pub customer_name: String,
    pub aggregates: Vec<CustomerAggregate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomerRequests {
    pub total: u64,
    pub by_service: ServiceBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestCounters {
    pub total_requests: u64,
    pub requests_by_service: ServiceBreakdown,
    pub requests_by_customer: BTreeMap<String, CustomerRequests>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataProcessed {
    pub totals: UsageTotals,
    #[serde(rename = "byCustomer")]
    pub by_customer: BTreeMap<String, UsageTotals>,
}

/// One request on the latency chart; stage latencies in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub offset: u64,
    pub request_id: String,
    pub customer_name: String,
    pub customer_app: String,
    pub timestamp: DateTime<Utc>,
    pub lang_detection: Option<f64>,
    pub nmt: Option<f64>,
    pub llm: Option<f64>,
    pub back_nmt: Option<f64>,
    pub tts: Option<f64>,
    pub overall: Option<f64>,
}

impl ChartPoint {
    fn from_stored(stored: &StoredEvent) -> Self {
        let seconds = |stage: Stage| stored.event.latency.get(stage).value().map(|ms| ms / 1000.0);
        Self {
            offset: stored.offset,
            request_id: stored.event.request_id.clone(),
            customer_name: stored.event.customer_name.clone(),
            customer_app: stored.event.customer_app.clone(),
            timestamp: stored.event.timestamp,
            lang_detection: seconds(Stage::LangDetection),
            nmt: seconds(Stage::Nmt),
            llm: seconds(Stage::Llm),
            back_nmt: seconds(Stage::BackNmt),
            tts: seconds(Stage::Tts),
            overall: seconds(Stage::Overall),
        }
    }
}

/// One raw request across all of a customer's applications, in the
/// lowercase row shape the customer latency table reads. Latencies are
/// milliseconds as text, `null` where the stage did not run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerLatencyRow {
    pub requestid: String,
    pub customername: String,
    pub customerapp: String,
    pub langdetectionlatency: Option<String>,
    pub nmtlatency: Option<String>,
    pub llmlatency: Option<String>,
    pub backnmtlatency: Option<String>,
    pub ttslatency: Option<String>,
    pub overallpipelinelatency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CustomerLatencyRow {
    fn from_stored(stored: &StoredEvent) -> Self {
        let ms = |stage: Stage| stored.event.latency.get(stage).value().map(|v| v.to_string());
        Self {
            requestid: stored.event.request_id.clone(),
            customername: stored.event.customer_name.clone(),
            customerapp: stored.event.customer_app.clone(),
            langdetectionlatency: ms(Stage::LangDetection),
            nmtlatency: ms(Stage::Nmt),
            llmlatency: ms(Stage::Llm),
            backnmtlatency: ms(Stage::BackNmt),
            ttslatency: ms(Stage::Tts),
            overallpipelinelatency: ms(Stage::Overall),
            timestamp: stored.event.timestamp,
        }
    }
}

pub fn encode_cursor(offset: u64) -> String {
    B64.encode(format!("o:{offset}"))
}

pub fn decode_cursor(cursor: &str) -> Result<u64, MetricsError> {
    let invalid = || MetricsError::Validation(format!("invalid cursor {cursor:?}"));
    let bytes = B64.decode(cursor.trim()).map_err(|_| invalid())?;
    let text = String::from_utf8(bytes).map_err(|_| invalid())?;
    text.strip_prefix("o:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(invalid)
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<EventStore>,
    aggregator: Arc<Aggregator>,
    default_limit: usize,
    max_limit: usize,
}

impl QueryService {
    pub fn new(store: Arc<EventStore>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            store,
            aggregator,
            default_limit: DEFAULT_FEED_LIMIT,
            max_limit: MAX_FEED_LIMIT,
        }
    }

    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.default_limit).clamp(1, self.max_limit)
    }

    /// Newest-first page of the global feed.
    pub async fn get_global_feed(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<FeedPage, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["feed"]).start_timer();
        self.store.ensure_available()?;

        let before = cursor.map(decode_cursor).transpose()?;
        let limit = self.clamp_limit(limit);
        let rows = self
            .store
            .page_desc(before, limit, &ScanFilter::default())
            .await;

        let next_cursor = match rows.last() {
            Some(last) if rows.len() == limit && last.offset > 0 => Some(encode_cursor(last.offset)),
            _ => None,
        };
        Ok(FeedPage {
            events: rows.iter().map(|s| StoredEvent::clone(s)).collect(),
            next_cursor,
        })
    }

    /// One row per application of `customer`.
    pub async fn get_customer_aggregate(
        &self,
        customer: &str,
    ) -> Result<CustomerAggregateResponse, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["customer_aggregate"]).start_timer();
        self.store.ensure_available()?;

        let aggregates = self.aggregator.customer_snapshot(customer).await;
        if aggregates.is_empty() {
            return Err(MetricsError::NotFound(format!(
                "no events for customer {customer}"
            )));
        }
        Ok(CustomerAggregateResponse {
            customer_name: customer.to_string(),
            aggregates,
        })
    }

    pub async fn get_request_counters(&self) -> Result<RequestCounters, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["request_counters"]).start_timer();
        self.store.ensure_available()?;

        let mut counters = RequestCounters::default();
        for row in self.aggregator.snapshot_all().await {
            counters.total_requests += row.requests;
            counters.requests_by_service += row.requests_by_service;
            let customer = counters
                .requests_by_customer
                .entry(row.customer_name)
                .or_default();
            customer.total += row.requests;
            customer.by_service += row.requests_by_service;
        }
        Ok(counters)
    }

    /// Usage totals summed from the per-application aggregates, so this view
    /// and the aggregate table can never disagree.
    pub async fn get_data_processed_totals(&self) -> Result<DataProcessed, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["data_processed"]).start_timer();
        self.store.ensure_available()?;

        let mut processed = DataProcessed::default();
        for row in self.aggregator.snapshot_all().await {
            processed.totals += row.usage_totals;
            *processed.by_customer.entry(row.customer_name).or_default() += row.usage_totals;
        }
        Ok(processed)
    }

    /// Latest `limit` requests in chronological order for the latency chart.
    pub async fn get_latency_chart(
        &self,
        customer: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ChartPoint>, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["latency_chart"]).start_timer();
        self.store.ensure_available()?;

        let filter = ScanFilter {
            customer: customer.map(str::to_string),
            app: None,
        };
        let limit = self.clamp_limit(limit);
        let mut rows = self.store.page_desc(None, limit, &filter).await;
        rows.reverse();
        Ok(rows.iter().map(|s| ChartPoint::from_stored(s)).collect())
    }

    /// Raw rows of one application, oldest first.
    pub async fn get_app_events(
        &self,
        customer: &str,
        app: &str,
    ) -> Result<Vec<StoredEvent>, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["app_events"]).start_timer();
        self.store.ensure_available()?;

        let rows = self.store.get_by_customer(customer, app).await;
        if rows.is_empty() {
            return Err(MetricsError::NotFound(format!(
                "no events for {customer}/{app}"
            )));
        }
        Ok(rows.iter().map(|s| StoredEvent::clone(s)).collect())
    }

    /// Every request of `customer` across its applications, oldest first.
    pub async fn get_customer_events(
        &self,
        customer: &str,
    ) -> Result<Vec<CustomerLatencyRow>, MetricsError> {
        let _timer = QUERY_LATENCY.with_label_values(&["customer_events"]).start_timer();
        self.store.ensure_available()?;

        let rows: Vec<CustomerLatencyRow> = self
            .store
            .scan(ScanFilter::customer(customer))
            .map(|stored| CustomerLatencyRow::from_stored(&stored))
            .collect()
            .await;
        if rows.is_empty() {
            return Err(MetricsError::NotFound(format!(
                "no events for customer {customer}"
            )));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatorSettings;
    use crate::model::{PipelineEvent, Service};
    use crate::test_utils::{event, with_latency, with_usage};

    struct Fixture {
        store: Arc<EventStore>,
        aggregator: Arc<Aggregator>,
        query: QueryService,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(EventStore::in_memory());
            let aggregator = Arc::new(Aggregator::new(AggregatorSettings {
                reservoir_capacity: 1000,
                seed: Some(5),
            }));
            let query = QueryService::new(Arc::clone(&store), Arc::clone(&aggregator));
            Self {
                store,
                aggregator,
                query,
            }
        }

        async fn ingest(&self, event: PipelineEvent) {
            let stored = self.store.append_record(event).await.unwrap();
            self.aggregator.on_event(&stored).await.unwrap();
        }
    }

    #[tokio::test]
    async fn cust_a_nmt_scenario() {
        let fx = Fixture::new();
        for ms in [100.0, 200.0, 300.0] {
            fx.ingest(with_latency(event("r", "custA", "app1"), Stage::Nmt, ms))
                .await;
        }
        let resp = fx.query.get_customer_aggregate("custA").await.unwrap();
        assert_eq!(resp.aggregates.len(), 1);
        let nmt = resp.aggregates[0].nmt_latency.unwrap();
        assert_eq!(nmt.avg, 200.0);
        assert_eq!((nmt.p90, nmt.p95, nmt.p99), (300.0, 300.0, 300.0));
    }

    #[tokio::test]
    async fn cust_b_without_tts_totals_zero_but_aggregate_null() {
        let fx = Fixture::new();
        let e = with_usage(
            with_latency(event("r1", "custB", "app1"), Stage::Nmt, 40.0),
            Service::Nmt,
            120,
        );
        fx.ingest(e).await;

        let totals = fx.query.get_data_processed_totals().await.unwrap();
        assert_eq!(totals.by_customer["custB"].tts_chars, 0);
        assert_eq!(totals.by_customer["custB"].nmt_chars, 120);

        let resp = fx.query.get_customer_aggregate("custB").await.unwrap();
        assert!(resp.aggregates[0].tts_latency.is_none());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["aggregates"][0]["ttsLatency"].is_null());
        assert_eq!(
            serde_json::to_value(&totals).unwrap()["byCustomer"]["custB"]["TTS_chars"],
            0
        );
    }

    #[tokio::test]
    async fn unknown_customer_is_not_found() {
        let fx = Fixture::new();
        let err = fx.query.get_customer_aggregate("nobody").await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound(_)));
        let err = fx.query.get_app_events("nobody", "app").await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound(_)));
        let err = fx.query.get_customer_events("nobody").await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound(_)));
    }

    #[tokio::test]
    async fn customer_events_span_apps_in_lowercase_rows() {
        let fx = Fixture::new();
        fx.ingest(with_latency(
            with_latency(event("r1", "custA", "web"), Stage::Nmt, 230.0),
            Stage::Overall,
            912.5,
        ))
        .await;
        fx.ingest(event("r2", "custB", "web")).await;
        fx.ingest(with_latency(event("r3", "custA", "mobile"), Stage::Tts, 40.0))
            .await;

        let rows = fx.query.get_customer_events("custA").await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.requestid.as_str()).collect::<Vec<_>>(),
            ["r1", "r3"]
        );
        assert_eq!(rows[0].nmtlatency.as_deref(), Some("230"));
        assert_eq!(rows[0].overallpipelinelatency.as_deref(), Some("912.5"));
        assert_eq!(rows[0].ttslatency, None);
        assert_eq!(rows[1].customerapp, "mobile");

        let json = serde_json::to_value(&rows[1]).unwrap();
        assert_eq!(json["customername"], "custA");
        assert_eq!(json["ttslatency"], "40");
        assert!(json["nmtlatency"].is_null());
    }

    #[tokio::test]
    async fn totals_saturate_across_apps() {
        let fx = Fixture::new();
        for app in ["app1", "app2"] {
            fx.ingest(with_usage(event("r", "custA", app), Service::Llm, u64::MAX))
                .await;
        }
        let totals = fx.query.get_data_processed_totals().await.unwrap();
        assert_eq!(totals.totals.llm_tokens, u64::MAX);
        assert_eq!(totals.by_customer["custA"].llm_tokens, u64::MAX);
    }

    #[tokio::test]
    async fn usage_above_f64_precision_is_summed_exactly() {
        let fx = Fixture::new();
        fx.ingest(with_usage(
            event("r1", "custA", "app1"),
            Service::Nmt,
            9_007_199_254_740_993,
        ))
        .await;
        fx.ingest(with_usage(event("r2", "custA", "app1"), Service::Nmt, 2))
            .await;
        let totals = fx.query.get_data_processed_totals().await.unwrap();
        assert_eq!(totals.totals.nmt_chars, 9_007_199_254_740_995);
    }

    #[tokio::test]
    async fn customer_aggregate_is_idempotent() {
        let fx = Fixture::new();
        for i in 0..50 {
            let app = if i % 2 == 0 { "web" } else { "mobile" };
            fx.ingest(with_latency(event("r", "AcmeCorp", app), Stage::Llm, f64::from(i)))
                .await;
        }
        let first = fx.query.get_customer_aggregate("AcmeCorp").await.unwrap();
        let second = fx.query.get_customer_aggregate("AcmeCorp").await.unwrap();
        assert_eq!(first, second);
        let apps: Vec<_> = first.aggregates.iter().map(|a| a.customer_app.as_str()).collect();
        assert_eq!(apps, ["mobile", "web"]);
    }

    #[tokio::test]
    async fn request_counters_partition_by_service() {
        let fx = Fixture::new();
        fx.ingest(with_latency(event("r1", "custA", "app1"), Stage::Nmt, 10.0))
            .await;
        fx.ingest(with_latency(
            with_latency(event("r2", "custA", "app2"), Stage::Llm, 20.0),
            Stage::Tts,
            30.0,
        ))
        .await;
        fx.ingest(with_latency(event("r3", "custB", "app1"), Stage::BackNmt, 5.0))
            .await;

        let counters = fx.query.get_request_counters().await.unwrap();
        assert_eq!(counters.total_requests, 3);
        assert_eq!(
            counters.requests_by_service,
            ServiceBreakdown {
                nmt: 1,
                llm: 1,
                tts: 1,
                back_nmt: 1
            }
        );
        assert_eq!(counters.requests_by_customer["custA"].total, 2);
        assert_eq!(counters.requests_by_customer["custB"].by_service.back_nmt, 1);

        let json = serde_json::to_value(&counters).unwrap();
        assert_eq!(json["requests_by_service"]["backNMT"], 1);
        assert_eq!(json["requests_by_customer"]["custA"]["by_service"]["LLM"], 1);
    }

    #[tokio::test]
    async fn feed_pages_newest_first_without_gaps() {
        let fx = Fixture::new();
        for i in 0..7 {
            fx.ingest(event(&format!("r{i}"), "custA", "app1")).await;
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = fx
                .query
                .get_global_feed(Some(3), cursor.as_deref())
                .await
                .unwrap();
            seen.extend(page.events.iter().map(|e| e.offset));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec![6, 5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn bad_cursor_is_a_validation_error() {
        let fx = Fixture::new();
        let err = fx
            .query
            .get_global_feed(None, Some("not-a-cursor!"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Validation(_)));
        assert_eq!(decode_cursor(&encode_cursor(42)).unwrap(), 42);
    }

    #[tokio::test]
    async fn chart_reports_seconds_and_null_for_skipped_stages() {
        let fx = Fixture::new();
        fx.ingest(with_latency(event("r1", "custA", "app1"), Stage::Nmt, 230.0))
            .await;
        fx.ingest(with_latency(event("r2", "custB", "app1"), Stage::Tts, 1500.0))
            .await;

        let points = fx.query.get_latency_chart(Some("custA"), None).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].nmt, Some(0.23));
        assert_eq!(points[0].tts, None);

        let all = fx.query.get_latency_chart(None, None).await.unwrap();
        assert_eq!(
            all.iter().map(|p| p.request_id.as_str()).collect::<Vec<_>>(),
            ["r1", "r2"]
        );
    }
}
