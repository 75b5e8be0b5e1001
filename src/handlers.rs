use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::relay::{self, ClientFrame, RelayMode, RequestUsageContext};
use crate::upstream;
use crate::usage::Usage;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use tokio::sync::mpsc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let request_id = extract_request_id(&headers);
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "missing_model", "model is required")
                .with_param("model")
        })?
        .to_string();
    let mode = RelayMode::from_request(&body);

    let mut ctx = RequestUsageContext::new(model);
    if let Some(tools) = body.get("tools") {
        ctx.declare_tools(tools);
    }

    let upstream_resp =
        upstream::send_responses_request(&state.http, &state.upstream, &body).await?;

    match mode {
        RelayMode::NonStream => {
            let mut frames: Vec<ClientFrame> = Vec::new();
            let result = relay::relay_response(
                mode,
                upstream_resp,
                &mut ctx,
                &mut frames,
                state.estimator.as_ref(),
            )
            .await;
            log_relay_outcome(request_id.as_deref(), &ctx, &result);
            result?;
            let Some(ClientFrame::Body { status, body }) = frames.pop() else {
                return Err(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "missing_response_body",
                    "relay produced no response body",
                ));
            };
            Response::builder()
                .status(status)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .map_err(|err| {
                    AppError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "response_build_failed",
                        err.to_string(),
                    )
                })
        }
        RelayMode::Stream => {
            let upstream_resp = relay::ensure_success(upstream_resp).await.inspect_err(|err| {
                log_relay_outcome(request_id.as_deref(), &ctx, &Err(err.clone()));
            })?;
            let (tx, rx) = mpsc::channel::<ClientFrame>(64);
            let estimator = state.estimator.clone();
            // Non-2xx replies were classified above, so the stream relay only ends in usage.
            tokio::spawn(async move {
                let mut sink = tx;
                let result = relay::relay_response(
                    mode,
                    upstream_resp,
                    &mut ctx,
                    &mut sink,
                    estimator.as_ref(),
                )
                .await;
                log_relay_outcome(request_id.as_deref(), &ctx, &result);
            });
            let events = tokio_stream::wrappers::ReceiverStream::new(rx)
                .filter_map(|frame| async move { frame_to_event(frame) })
                .map(Ok::<_, Infallible>);
            Ok(Sse::new(events).into_response())
        }
    }
}

fn frame_to_event(frame: ClientFrame) -> Option<Event> {
    match frame {
        ClientFrame::Event { name, data } => {
            let event = Event::default().data(data);
            if name.is_empty() || name.contains(['\n', '\r']) {
                Some(event)
            } else {
                Some(event.event(name))
            }
        }
        ClientFrame::Body { .. } => None,
    }
}

fn log_relay_outcome(request_id: Option<&str>, ctx: &RequestUsageContext, result: &AppResult<Usage>) {
    let request_id = request_id.unwrap_or("-");
    match result {
        Ok(usage) => {
            tracing::info!(
                request_id,
                model = %ctx.model(),
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                usage_source = usage.source.as_str(),
                tools = ?ctx.tool_stat(),
                client_disconnected = ctx.client_disconnected(),
                upstream_interrupted = ctx.upstream_interrupted(),
                upstream_failed = ctx.upstream_failure().is_some(),
                "relay finished"
            );
        }
        Err(err) => {
            metrics::counter!("relay_upstream_errors_total", "code" => err.code.clone())
                .increment(1);
            tracing::warn!(
                request_id,
                model = %ctx.model(),
                status = err.status.as_u16(),
                code = %err.code,
                error_type = %err.error_type,
                local = err.is_local(),
                "relay failed: {}",
                err.message
            );
        }
    }
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
