// HTTP API
// This file provides the HTTP endpoints for ingestion, queries, the
// dashboard-compatible metric routes, admin operations and the pipeline proxy
//
// Numan Thabit 2025 Nov

use crate::aggregate::RecomputeReport;
use crate::errors::MetricsError;
use crate::ingest::normalize::normalize;
use crate::ingest::{Ack, IngestionService, IngestionStatus, PendingEvent};
use crate::metrics;
use crate::query::{
    ChartPoint, CustomerAggregateResponse, CustomerLatencyRow, DataProcessed, FeedPage,
    QueryService, RequestCounters,
};
use crate::transport::pipeline::reported_event;
use crate::transport::{PipelineClient, PipelineRequest};
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router as AxumRouter,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const EVENTS_STORED_HEADER: &str = "x-events-stored";
pub const AGGREGATION_PENDING_HEADER: &str = "x-aggregation-pending";

#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub query: Arc<QueryService>,
    pub pipeline: Option<Arc<PipelineClient>>,
    pub query_timeout: Duration,
    pub cors_allow_any: bool,
}

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChartParams {
    pub customer: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerLookup {
    #[serde(default)]
    pub customer_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionOverview {
    #[serde(flatten)]
    pub status: IngestionStatus,
    pub pending_events: Vec<PendingEvent>,
    pub unaggregated_events: Vec<PendingEvent>,
}

/// Create the HTTP router with API endpoints
pub fn create_api_router(state: AppState) -> AxumRouter {
    let queries = AxumRouter::new()
        .route("/api/v1/feed", get(global_feed))
        .route("/api/v1/customers/:customer/aggregates", get(customer_aggregates))
        .route(
            "/customer_aggregates",
            get(customer_aggregates_by_query).post(customer_aggregates_by_body),
        )
        .route("/customers/:customer", get(customer_events))
        .route("/api/v1/customers/:customer/app/:app/events", get(app_events))
        .route("/metrics/requests", get(request_counters))
        .route("/metrics/data_processed", get(data_processed))
        .route("/api/v1/charts/latency", get(latency_chart))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            freshness_headers,
        ));

    let cors = if state.cors_allow_any {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/v1/events", post(submit_event))
        .route("/api/v1/admin/ingestion", get(ingestion_status))
        .route("/api/v1/admin/recompute", post(recompute))
        .route("/api/v1/pipeline", post(run_pipeline))
        .merge(queries)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run a read under the configured deadline.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, MetricsError>
where
    F: Future<Output = Result<T, MetricsError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MetricsError::QueryTimeout(timeout.as_millis() as u64)),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, MetricsError> {
    serde_json::from_slice(body)
        .map_err(|e| MetricsError::Validation(format!("malformed request body: {e}")))
}

/// Attach how far derived state lags the log.
async fn freshness_headers(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let stored = state.ingestion.store().len().await;
    let pending = state.ingestion.pending_count().await;
    let headers = resp.headers_mut();
    headers.insert(EVENTS_STORED_HEADER, HeaderValue::from(stored));
    headers.insert(AGGREGATION_PENDING_HEADER, HeaderValue::from(pending));
    resp
}

/// Health check endpoint
async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn submit_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Ack>), MetricsError> {
    let body: Value = parse_body(&body)?;
    let ack = state.ingestion.submit_raw(body).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn global_feed(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> Result<Json<FeedPage>, MetricsError> {
    let page = with_timeout(
        state.query_timeout,
        state
            .query
            .get_global_feed(params.limit, params.cursor.as_deref()),
    )
    .await?;
    Ok(Json(page))
}

async fn customer_aggregates(
    State(state): State<AppState>,
    Path(customer): Path<String>,
) -> Result<Json<CustomerAggregateResponse>, MetricsError> {
    let resp = with_timeout(
        state.query_timeout,
        state.query.get_customer_aggregate(&customer),
    )
    .await?;
    Ok(Json(resp))
}

async fn customer_aggregates_by_query(
    State(state): State<AppState>,
    Query(lookup): Query<CustomerLookup>,
) -> Result<Json<CustomerAggregateResponse>, MetricsError> {
    lookup_customer(&state, lookup).await
}

async fn customer_aggregates_by_body(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CustomerAggregateResponse>, MetricsError> {
    lookup_customer(&state, parse_body(&body)?).await
}

async fn lookup_customer(
    state: &AppState,
    lookup: CustomerLookup,
) -> Result<Json<CustomerAggregateResponse>, MetricsError> {
    if lookup.customer_name.trim().is_empty() {
        return Err(MetricsError::Validation(
            "customerName is required".to_string(),
        ));
    }
    let resp = with_timeout(
        state.query_timeout,
        state.query.get_customer_aggregate(&lookup.customer_name),
    )
    .await?;
    Ok(Json(resp))
}

async fn customer_events(
    State(state): State<AppState>,
    Path(customer): Path<String>,
) -> Result<Json<Vec<CustomerLatencyRow>>, MetricsError> {
    let rows = with_timeout(
        state.query_timeout,
        state.query.get_customer_events(&customer),
    )
    .await?;
    Ok(Json(rows))
}

async fn app_events(
    State(state): State<AppState>,
    Path((customer, app)): Path<(String, String)>,
) -> Result<Json<Value>, MetricsError> {
    let events = with_timeout(
        state.query_timeout,
        state.query.get_app_events(&customer, &app),
    )
    .await?;
    Ok(Json(serde_json::json!({
        "customerName": customer,
        "customerApp": app,
        "events": events,
    })))
}

async fn request_counters(
    State(state): State<AppState>,
) -> Result<Json<RequestCounters>, MetricsError> {
    let counters = with_timeout(state.query_timeout, state.query.get_request_counters()).await?;
    Ok(Json(counters))
}

async fn data_processed(
    State(state): State<AppState>,
) -> Result<Json<DataProcessed>, MetricsError> {
    let totals =
        with_timeout(state.query_timeout, state.query.get_data_processed_totals()).await?;
    Ok(Json(totals))
}

async fn latency_chart(
    State(state): State<AppState>,
    Query(params): Query<ChartParams>,
) -> Result<Json<Vec<ChartPoint>>, MetricsError> {
    let points = with_timeout(
        state.query_timeout,
        state
            .query
            .get_latency_chart(params.customer.as_deref(), params.limit),
    )
    .await?;
    Ok(Json(points))
}

async fn ingestion_status(State(state): State<AppState>) -> Json<IngestionOverview> {
    Json(IngestionOverview {
        status: state.ingestion.status().await,
        pending_events: state.ingestion.pending().await,
        unaggregated_events: state.ingestion.unaggregated().await,
    })
}

async fn recompute(State(state): State<AppState>) -> Json<RecomputeReport> {
    info!("recompute requested");
    Json(state.ingestion.recompute().await)
}

/// Forward to the pipeline backend, then ingest the latencies it reports.
/// The backend answer is returned unchanged even if ingesting it fails.
async fn run_pipeline(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, MetricsError> {
    let client = state.pipeline.as_ref().ok_or_else(|| {
        MetricsError::UpstreamUnavailable("pipeline backend is not configured".to_string())
    })?;
    let req = parse_body::<PipelineRequest>(&body)?.validated()?;

    let response = client.run(&req).await?;

    let recorded = match normalize(reported_event(&req, &response)) {
        Ok(event) => state.ingestion.submit(event).await.map(|_| ()),
        Err(err) => Err(err),
    };
    if let Err(err) = recorded {
        warn!(
            customer = %req.customer_name,
            app = %req.customer_app_name,
            error = %err,
            "pipeline latencies were not ingested"
        );
    }
    Ok(Json(response))
}
