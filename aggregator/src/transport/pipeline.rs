// Pipeline backend client
// Forwards a pipeline request to the external pipeline backend over HTTP
// and turns the per-stage latencies it reports into an ingestible record
//
// Numan Thabit 2025 Nov

use crate::errors::MetricsError;
use crate::ingest::normalize::RawEvent;
use crate::metrics::{REQ_ERRORS, REQ_LATENCY};
use crate::model::{Service, Stage};
use anyhow::Context;
use backoff::{future::retry, ExponentialBackoff};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_app_name: String,
    #[serde(default)]
    pub input: PipelineInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineInput {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl PipelineRequest {
    /// Check required fields and fill the default language.
    pub fn validated(mut self) -> Result<Self, MetricsError> {
        if self.customer_name.trim().is_empty()
            || self.customer_app_name.trim().is_empty()
            || self.input.text.trim().is_empty()
        {
            return Err(MetricsError::Validation(
                "customerName, customerAppName, and input.text are required".to_string(),
            ));
        }
        if self.input.language.as_deref().map_or(true, |l| l.trim().is_empty()) {
            self.input.language = Some(DEFAULT_LANGUAGE.to_string());
        }
        Ok(self)
    }
}

fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(30)),
        multiplier: 2.0,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineClient {
    http: Client,
    url: Url,
    api_key: Option<String>,
    backoff: ExponentialBackoff,
}

impl PipelineClient {
    pub fn new(url: Url, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .user_agent("latency-aggr")
            .build()
            .context("build HTTP client for pipeline backend")?;
        Ok(Self {
            http,
            url,
            api_key,
            backoff: default_backoff(),
        })
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.url
    }

    /// Run one pipeline request. Transport failures and 5xx answers are
    /// retried; anything else is returned as is.
    #[tracing::instrument(skip_all, fields(customer = %req.customer_name, app = %req.customer_app_name))]
    pub async fn run(&self, req: &PipelineRequest) -> Result<Value, MetricsError> {
        let _timer = REQ_LATENCY
            .with_label_values(&["pipeline", "run"])
            .start_timer();

        retry(self.backoff.clone(), || async {
            self.send_once(req).await.map_err(|err| match err {
                MetricsError::Transport(_) => {
                    debug!(error = %err, "pipeline call failed; retrying");
                    backoff::Error::transient(err)
                }
                MetricsError::ProviderStatus(status) if status.is_server_error() => {
                    debug!(error = %err, "pipeline backend error; retrying");
                    backoff::Error::transient(err)
                }
                other => backoff::Error::permanent(other),
            })
        })
        .await
        .inspect_err(|err| {
            REQ_ERRORS.with_label_values(&["pipeline", "run"]).inc();
            warn!(error = %err, "pipeline request failed");
        })
    }

    async fn send_once(&self, req: &PipelineRequest) -> Result<Value, MetricsError> {
        let mut builder = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::ACCEPT, "*/*")
            .json(req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| MetricsError::Transport(format!("pipeline send: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MetricsError::ProviderStatus(status));
        }
        resp.json()
            .await
            .map_err(|e| MetricsError::Provider(format!("pipeline response decode: {e}")))
    }
}

/// Build an ingestion record from the backend's answer. Latency keys are
/// matched loosely; keys that name no known stage are ignored.
pub fn reported_event(req: &PipelineRequest, response: &Value) -> RawEvent {
    let mut raw = RawEvent {
        request_id: response.get("requestId").cloned(),
        customer_name: Some(req.customer_name.clone()),
        customer_app: Some(req.customer_app_name.clone()),
        timestamp: Some(
            response
                .get("timestamp")
                .filter(|t| !t.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339())),
        ),
        ..RawEvent::default()
    };

    if let Some(latency) = response.get("latency").and_then(Value::as_object) {
        for (key, value) in latency {
            match Stage::from_key(key) {
                Some(stage) => raw.set_latency(stage, value.clone()),
                None => debug!(key = %key, "ignoring unknown latency key"),
            }
        }
    }
    if let Some(usage) = response.get("usage").and_then(Value::as_object) {
        for (key, value) in usage {
            if let Some(service) = Service::from_key(key) {
                raw.set_usage(service, value.clone());
            }
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::normalize::normalize;
    use crate::model::MetricField;
    use reqwest::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> PipelineRequest {
        PipelineRequest {
            customer_name: "custA".into(),
            customer_app_name: "app1".into(),
            input: PipelineInput {
                text: "hello".into(),
                language: None,
            },
        }
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_elapsed_time: Some(Duration::from_millis(500)),
            randomization_factor: 0.0,
            ..Default::default()
        }
    }

    fn client(server: &MockServer) -> PipelineClient {
        let url = Url::parse(&format!("{}/pipeline", server.uri())).unwrap();
        PipelineClient::new(url, Some("secret".into()), Duration::from_secs(5))
            .unwrap()
            .with_backoff(fast_backoff())
    }

    #[test]
    fn validation_requires_identity_and_text() {
        let mut req = request();
        req.input.text = "  ".into();
        assert!(matches!(req.validated(), Err(MetricsError::Validation(_))));

        let ok = request().validated().unwrap();
        assert_eq!(ok.input.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn forwards_request_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requestId": "req-1",
                "status": "success",
                "pipelineOutput": {"NMT": "bonjour"},
                "latency": {"NMT": "230ms", "overallPipeline": "900"},
                "timestamp": "2025-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = client(&server)
            .run(&request().validated().unwrap())
            .await
            .unwrap();
        assert_eq!(body["requestId"], "req-1");
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"requestId": "r"})))
            .mount(&server)
            .await;

        let body = client(&server).run(&request()).await.unwrap();
        assert_eq!(body["requestId"], "r");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).run(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            MetricsError::ProviderStatus(StatusCode::UNPROCESSABLE_ENTITY)
        ));
    }

    #[tokio::test]
    async fn exhausted_server_errors_keep_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).run(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            MetricsError::ProviderStatus(status) if status.is_server_error()
        ));
        assert!(err.is_retryable());
        assert!(server.received_requests().await.unwrap().len() > 1);
    }

    #[test]
    fn reported_latencies_become_an_event() {
        let response = json!({
            "requestId": "req-9",
            "latency": {
                "langDetection": "12ms",
                "NMT": 230,
                "backNMT": "none",
                "total": "1200",
                "somethingElse": 4
            },
            "usage": {"NMT": 120},
            "timestamp": "2025-01-01T00:00:00Z"
        });
        let event = normalize(reported_event(&request(), &response)).unwrap();
        assert_eq!(event.request_id, "req-9");
        assert_eq!(event.customer_app, "app1");
        assert_eq!(event.latency.get(Stage::LangDetection).value(), Some(12.0));
        assert_eq!(event.latency.get(Stage::Nmt).value(), Some(230.0));
        assert_eq!(*event.latency.get(Stage::BackNmt), MetricField::Absent);
        assert_eq!(event.latency.get(Stage::Overall).value(), Some(1200.0));
        assert_eq!(event.usage.get(Service::Nmt).count(), Some(120));
    }
}
