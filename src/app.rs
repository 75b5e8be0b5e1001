use crate::config::{UpstreamConfig, env_non_empty};
use crate::error::{AppError, AppResult};
use crate::usage::{TiktokenEstimator, TokenEstimator};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub upstream: Arc<UpstreamConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub estimator: Arc<dyn TokenEstimator>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("RELAY_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("RELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    let upstream = UpstreamConfig::from_env().map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "upstream_config_invalid",
            err,
        )
    })?;
    tokio::task::spawn_blocking(TiktokenEstimator::preload)
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "tokenizer_preload_failed",
                err.to_string(),
            )
        })?;
    load_state_with(
        RuntimeConfig::from_env(),
        upstream,
        Arc::new(TiktokenEstimator),
    )
}

pub fn load_state_with(
    runtime: RuntimeConfig,
    upstream: UpstreamConfig,
    estimator: Arc<dyn TokenEstimator>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("responses-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        upstream: Arc::new(upstream),
        http,
        metrics,
        estimator,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/v1/responses", post(crate::handlers::create_response))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
