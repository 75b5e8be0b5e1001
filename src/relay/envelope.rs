use crate::error::{AppError, AppResult, UNMARSHAL_RESPONSE_BODY_FAILED, UpstreamErrorBody};
use crate::relay::context::RequestUsageContext;
use crate::relay::null_as_default;
use crate::relay::sink::{ClientFrame, ClientSink};
use crate::relay::stream::WireUsage;
use crate::usage::Usage;
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;

/// The parts of a non-streaming upstream response the relay reads. Everything
/// else stays in the raw body, which is what the client receives.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub error: Option<UpstreamErrorBody>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tools: Vec<ToolEntry>,
}

impl ResponseEnvelope {
    pub fn take_usage(&mut self) -> Usage {
        self.usage.take().map(Usage::from).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolEntry {
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub tool_type: String,
}

pub fn decode_envelope(body: &[u8]) -> AppResult<ResponseEnvelope> {
    serde_json::from_slice(body).map_err(|err| AppError::local(UNMARSHAL_RESPONSE_BODY_FAILED, err))
}

/// Relays a complete upstream body.
///
/// On success the raw bytes are forwarded exactly once and the reported usage is
/// returned. A decode failure or an embedded provider error forwards nothing.
pub async fn relay_envelope<K>(
    status: StatusCode,
    body: Bytes,
    ctx: &mut RequestUsageContext,
    sink: &mut K,
) -> AppResult<Usage>
where
    K: ClientSink + ?Sized,
{
    let mut envelope = decode_envelope(&body)?;
    if let Some(error) = envelope.error.take() {
        return Err(AppError::upstream(status, error));
    }

    if let Err(err) = sink.forward(ClientFrame::Body { status, body }).await {
        tracing::info!(model = %ctx.model(), "client gone before body was forwarded: {err}");
        ctx.mark_client_disconnected();
    }

    let usage = envelope.take_usage();
    ctx.set_reported_usage(usage);
    for tool in &envelope.tools {
        ctx.record_tool_type(&tool.tool_type);
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{UNMARSHAL_RESPONSE_BODY_FAILED, UPSTREAM_ERROR_TYPE};
    use crate::tools::BuiltInTool;
    use serde_json::json;

    fn success_body() -> Bytes {
        Bytes::from(
            json!({
                "id": "resp_1",
                "object": "response",
                "status": "completed",
                "error": null,
                "output": [
                    { "type": "web_search_call", "id": "ws_1", "status": "completed" },
                    { "type": "message", "role": "assistant", "content": [{ "type": "output_text", "text": "héllo" }] }
                ],
                "tools": [
                    { "type": "web_search_preview" },
                    { "type": "function", "name": "lookup" },
                    { "type": "web_search_preview" }
                ],
                "usage": { "input_tokens": 12, "output_tokens": 7, "total_tokens": 19 }
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn success_forwards_body_verbatim_and_copies_usage() {
        let body = success_body();
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();

        let usage = relay_envelope(StatusCode::OK, body.clone(), &mut ctx, &mut frames)
            .await
            .unwrap();

        assert_eq!(usage, Usage::reported(12, 7, 19));
        assert_eq!(frames.len(), 1);
        let ClientFrame::Body {
            status,
            body: forwarded,
        } = &frames[0]
        else {
            panic!("expected a body frame");
        };
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(forwarded.len(), body.len());
        assert_eq!(forwarded, &body);
        assert_eq!(ctx.tool_stat().get(BuiltInTool::WebSearchPreview), 2);
        assert_eq!(ctx.tool_stat().iter().count(), 1);
    }

    #[tokio::test]
    async fn embedded_error_forwards_nothing() {
        let body = Bytes::from(
            json!({
                "error": { "message": "Invalid prompt", "code": "invalid_prompt" },
                "usage": { "input_tokens": 3, "output_tokens": 0, "total_tokens": 3 },
                "tools": [{ "type": "web_search_preview" }]
            })
            .to_string(),
        );
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();

        let err = relay_envelope(StatusCode::BAD_REQUEST, body, &mut ctx, &mut frames)
            .await
            .unwrap_err();

        assert!(frames.is_empty());
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid prompt");
        assert_eq!(err.code, "invalid_prompt");
        assert_eq!(err.error_type, UPSTREAM_ERROR_TYPE);
        assert!(ctx.tool_stat().is_empty());
    }

    #[tokio::test]
    async fn undecodable_body_is_a_local_500() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();

        let err = relay_envelope(
            StatusCode::OK,
            Bytes::from_static(b"<html>oops</html>"),
            &mut ctx,
            &mut frames,
        )
        .await
        .unwrap_err();

        assert!(frames.is_empty());
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_type, UNMARSHAL_RESPONSE_BODY_FAILED);
    }

    #[tokio::test]
    async fn null_scalars_decode_like_missing_fields() {
        let body = Bytes::from(
            json!({
                "id": "resp_3",
                "error": null,
                "tools": [{ "type": null }, { "type": "web_search_preview" }],
                "usage": { "input_tokens": 12, "output_tokens": 7, "total_tokens": null }
            })
            .to_string(),
        );
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();

        let usage = relay_envelope(StatusCode::OK, body, &mut ctx, &mut frames)
            .await
            .unwrap();

        assert_eq!(usage, Usage::reported(12, 7, 0));
        assert_eq!(frames.len(), 1);
        assert_eq!(ctx.tool_stat().get(BuiltInTool::WebSearchPreview), 1);
    }

    #[tokio::test]
    async fn null_tools_array_counts_nothing() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();
        relay_envelope(
            StatusCode::OK,
            Bytes::from_static(br#"{"id":"resp_4","tools":null,"usage":null}"#),
            &mut ctx,
            &mut frames,
        )
        .await
        .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(ctx.tool_stat().is_empty());
    }

    #[tokio::test]
    async fn missing_usage_is_zero() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let mut frames: Vec<ClientFrame> = Vec::new();
        let usage = relay_envelope(
            StatusCode::OK,
            Bytes::from_static(br#"{"id":"resp_2","output":[]}"#),
            &mut ctx,
            &mut frames,
        )
        .await
        .unwrap();
        assert_eq!(usage, Usage::default());
        assert_eq!(frames.len(), 1);
    }
}
