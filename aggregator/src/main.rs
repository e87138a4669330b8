use anyhow::{anyhow, Context, Result};
use latency_aggr::aggregate::{Aggregator, AggregatorSettings};
use latency_aggr::api::{create_api_router, AppState};
use latency_aggr::config::AppConfig;
use latency_aggr::ingest::{start_retry_sweep, IngestionService};
use latency_aggr::query::QueryService;
use latency_aggr::store::EventStore;
use latency_aggr::transport::PipelineClient;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal aggregator error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = AppConfig::load().context("load configuration")?;

    let store = match &config.log_path {
        Some(path) => EventStore::open(path, config.fsync)
            .await
            .with_context(|| format!("open event log {}", path.display()))?,
        None => {
            warn!("event log path not provided; events are kept in memory only");
            EventStore::in_memory()
        }
    };
    let store = Arc::new(store);

    let aggregator = Arc::new(Aggregator::new(AggregatorSettings {
        reservoir_capacity: config.reservoir_capacity,
        seed: config.reservoir_seed,
    }));

    let ingestion = Arc::new(IngestionService::new(
        Arc::clone(&store),
        Arc::clone(&aggregator),
        config.max_aggregation_attempts,
    ));

    let query = Arc::new(
        QueryService::new(store, aggregator)
            .with_limits(config.feed_default_limit, config.feed_max_limit),
    );

    let pipeline = if let Some(endpoint) = &config.pipeline_endpoint {
        Some(Arc::new(
            PipelineClient::new(
                endpoint.clone(),
                config.pipeline_api_key.clone(),
                config.pipeline_timeout(),
            )
            .context("initialize pipeline client")?,
        ))
    } else {
        warn!("pipeline endpoint not provided; pipeline proxy disabled");
        None
    };

    let app = App {
        config: Arc::new(config),
        ingestion,
        query,
        pipeline,
    };

    app.run().await
}

struct App {
    config: Arc<AppConfig>,
    ingestion: Arc<IngestionService>,
    query: Arc<QueryService>,
    pipeline: Option<Arc<PipelineClient>>,
}

impl App {
    async fn run(self) -> Result<()> {
        // derived state is never persisted; rebuild it from the log
        let report = self.ingestion.recompute().await;
        info!(
            replayed = report.replayed,
            aggregated = report.aggregated,
            pending = report.failed.len(),
            "derived state restored"
        );

        let sweep_handle =
            start_retry_sweep(Arc::clone(&self.ingestion), self.config.retry_interval());
        info!(
            interval_secs = self.config.retry_interval_secs,
            max_attempts = self.config.max_aggregation_attempts,
            "started aggregation retry sweep"
        );

        let state = AppState {
            ingestion: Arc::clone(&self.ingestion),
            query: Arc::clone(&self.query),
            pipeline: self.pipeline.clone(),
            query_timeout: self.config.query_timeout(),
            cors_allow_any: self.config.cors_allow_any,
        };
        let api_router = create_api_router(state);

        let api_addr = self.config.listen_addr;
        let listener = tokio::net::TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("bind API server address {api_addr}"))?;
        info!(
            address = %api_addr,
            log = ?self.config.log_path,
            pipeline = ?self.pipeline.as_ref().map(|p| p.endpoint().as_str()),
            "metrics aggregation service online"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let api_handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, api_router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "API server error");
            }
        });

        let mut ticker = tokio::time::interval(self.config.heartbeat());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.ingestion.status().await;
                    info!(
                        stored = status.stored,
                        aggregated = status.aggregated,
                        pending = status.pending,
                        unaggregated = status.unaggregated,
                        "heartbeat"
                    );
                    if !self.ingestion.store().is_available() {
                        warn!("event log unavailable; ingestion is failing closed");
                    }
                    for pending in self.ingestion.pending().await {
                        debug!(
                            offset = pending.offset,
                            attempts = pending.attempts,
                            error = %pending.last_error,
                            "aggregation pending"
                        );
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(error = %err, "ctrl_c listener error");
                    }
                    info!("Shutdown signal received, exiting");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(());
        sweep_handle.abort();
        if let Err(err) = api_handle.await {
            warn!(error = %err, "API server task ended abnormally");
        }
        Ok(())
    }
}

fn init_tracing() -> Result<()> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
