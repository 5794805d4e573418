//! The HTTP API server.
//!
//! Thin glue only: every endpoint resolves to one call on the supervisor
//! handle, the ingestion gateway or the monitoring consumer, and wraps the
//! result in the `{success, data, error}` envelope.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::monitor::MonitoringConsumer;
use crate::broker::producer::{PublishClass, Sample};
use crate::broker::{BrokerConfig, ConfigLock};
use crate::config::Config;
use crate::error::AppError;
use crate::gateway::IngestionGateway;
use crate::supervisor::{LogStream, PolicyPatch, StartRequest, SupervisorHandle, UpdateConfig};

const DEFAULT_LOG_LINES: usize = 100;
const DEFAULT_PREVIEW_BATCH: usize = 10;
const DEFAULT_PREVIEW_TIMEOUT_SECONDS: u64 = 5;
/// Messages echoed verbatim in the consume response.
const PREVIEW_ECHO_LIMIT: usize = 5;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub lock: Arc<ConfigLock>,
    pub supervisor: SupervisorHandle,
    pub gateway: Arc<IngestionGateway>,
    pub monitor: Arc<MonitoringConsumer>,
}

/// Application HTTP server.
pub struct AppServer {
    config: Arc<Config>,
    state: ApiState,
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    pub fn new(config: Arc<Config>, state: ApiState, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, state, shutdown }
    }

    /// Bind the listener and spawn the serve task.
    pub async fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        let app = routes(self.state);
        let addr = format!("0.0.0.0:{}", self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .context("error binding HTTP listener")?;
        tracing::info!(%addr, "HTTP server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await
                .context("error from HTTP server")
        });
        Ok(handle)
    }
}

pub(crate) fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/online/training/start", post(training_start))
        .route("/online/training/stop", post(training_stop))
        .route("/online/training/status", get(training_status))
        .route("/online/training/logs", get(training_logs))
        .route("/online/training/restart-policy", patch(restart_policy))
        .route("/online/data/add", post(data_add))
        .route("/online/streaming/config", get(streaming_config))
        .route("/online/streaming/status", get(streaming_status))
        .route("/online/streaming/consume", post(streaming_consume))
        .with_state(state)
}

/// An error on its way out of a handler.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let app_err = AppError::from_anyhow(self.0);
        let status = app_err.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?app_err, "internal error serving request");
        }
        let mut body = json!({"success": false, "error": app_err.to_string()});
        if app_err.is_retriable() {
            body["retriable"] = json!(true);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

/// Unpack an optional JSON body.
///
/// An absent body means "use the defaults"; a body which is present but does
/// not deserialize is the caller's error and must never reach a handler as if
/// it were empty.
fn optional_body<T: Default>(body: std::result::Result<Json<T>, JsonRejection>) -> std::result::Result<T, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(rejection) => Err(AppError::InvalidInput(rejection.body_text()).into()),
    }
}

fn envelope(status: StatusCode, data: impl serde::Serialize) -> ApiResult {
    let data = serde_json::to_value(data).context("error serializing response")?;
    Ok((status, Json(json!({"success": true, "data": data}))).into_response())
}

///////////////////////////////////////////////////////////////////////////////
// Training ///////////////////////////////////////////////////////////////////

#[derive(Default, Deserialize)]
struct StartBody {
    #[serde(default)]
    kafka_config: Option<BrokerConfig>,
    #[serde(default)]
    update_config: Option<UpdateConfig>,
    #[serde(flatten)]
    policy: PolicyPatch,
}

async fn training_start(
    State(state): State<ApiState>,
    body: std::result::Result<Json<StartBody>, JsonRejection>,
) -> ApiResult {
    let body = optional_body(body)?;
    // An omitted broker config falls back to the configured defaults.
    let kafka_config = body.kafka_config.unwrap_or_else(|| BrokerConfig {
        servers: state.config.kafka_servers.clone(),
        topic: state.config.kafka_topic.clone(),
        group: state.config.kafka_group.clone(),
        offset_time: None,
    });
    let request = StartRequest {
        kafka_config,
        update_config: body.update_config.unwrap_or_default(),
        policy: (!body.policy.is_empty()).then_some(body.policy),
    };
    let status = state.supervisor.start(request).await?;
    envelope(StatusCode::OK, status)
}

async fn training_stop(State(state): State<ApiState>) -> ApiResult {
    let status = state.supervisor.stop().await?;
    envelope(StatusCode::OK, status)
}

async fn training_status(State(state): State<ApiState>) -> ApiResult {
    envelope(StatusCode::OK, state.supervisor.status())
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
    stream: Option<String>,
}

async fn training_logs(State(state): State<ApiState>, Query(query): Query<LogsQuery>) -> ApiResult {
    let stream = match query.stream.as_deref() {
        Some(raw) => raw.parse::<LogStream>().map_err(AppError::InvalidInput)?,
        None => LogStream::Both,
    };
    let tail = state.supervisor.tail_logs(query.lines.unwrap_or(DEFAULT_LOG_LINES), stream);
    envelope(StatusCode::OK, tail)
}

async fn restart_policy(State(state): State<ApiState>, Json(patch): Json<PolicyPatch>) -> ApiResult {
    if patch.is_empty() {
        return Err(AppError::InvalidInput("provide max_restarts and/or backoff_sec".into()).into());
    }
    let policy = state.supervisor.update_policy(patch).await?;
    envelope(StatusCode::OK, policy)
}

///////////////////////////////////////////////////////////////////////////////
// Ingestion //////////////////////////////////////////////////////////////////

#[derive(Deserialize)]
struct AddBody {
    #[serde(default)]
    samples: Vec<Sample>,
    #[serde(default)]
    kafka_config: Option<BrokerConfig>,
}

async fn data_add(State(state): State<ApiState>, Json(body): Json<AddBody>) -> ApiResult {
    let outcome = state.gateway.add(&body.samples, body.kafka_config.as_ref()).await?;
    match outcome.classify() {
        PublishClass::Complete => envelope(StatusCode::OK, outcome),
        PublishClass::Partial => envelope(StatusCode::MULTI_STATUS, outcome),
        PublishClass::Failed => {
            let data = serde_json::to_value(&outcome).context("error serializing response")?;
            let body = json!({
                "success": false,
                "error": "no sample could be published",
                "retriable": true,
                "data": data,
            });
            Ok((StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response())
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Streaming //////////////////////////////////////////////////////////////////

async fn streaming_config(State(state): State<ApiState>) -> ApiResult {
    match state.lock.describe() {
        Some(desc) => envelope(StatusCode::OK, desc),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "no active broker config"})),
        )
            .into_response()),
    }
}

async fn streaming_status(State(state): State<ApiState>) -> ApiResult {
    let snapshot = state.monitor.status().await?;
    envelope(StatusCode::OK, snapshot)
}

#[derive(Default, Deserialize)]
struct ConsumeBody {
    batch_size: Option<usize>,
    timeout: Option<u64>,
}

async fn streaming_consume(
    State(state): State<ApiState>,
    body: std::result::Result<Json<ConsumeBody>, JsonRejection>,
) -> ApiResult {
    let body = optional_body(body)?;
    let batch_size = body.batch_size.unwrap_or(DEFAULT_PREVIEW_BATCH);
    let timeout = Duration::from_secs(body.timeout.unwrap_or(DEFAULT_PREVIEW_TIMEOUT_SECONDS));
    let messages = state.monitor.preview_consume(batch_size, timeout).await?;
    let echoed = messages.iter().take(PREVIEW_ECHO_LIMIT).collect::<Vec<_>>();
    let data: Value = json!({
        "total": messages.len(),
        "messages": echoed,
    });
    envelope(StatusCode::OK, data)
}
