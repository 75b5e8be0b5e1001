use crate::error::UpstreamErrorBody;
use crate::relay::context::RequestUsageContext;
use crate::relay::null_as_default;
use crate::relay::sink::{ClientFrame, ClientSink};
use crate::tools::BuiltInTool;
use crate::usage::Usage;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
pub const OUTPUT_ITEM_DONE: &str = "response.output_item.done";
pub const RESPONSE_COMPLETED: &str = "response.completed";
pub const RESPONSE_INCOMPLETE: &str = "response.incomplete";
pub const RESPONSE_FAILED: &str = "response.failed";
pub const ERROR_EVENT: &str = "error";

/// A decoded upstream stream record. Anything not listed is `Other`: forwarded, never interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta { delta: String },
    ItemDone { item: DoneItem },
    /// `response.completed` or `response.incomplete`. `usage` is authoritative when present.
    Completed { usage: Option<Usage> },
    Failed { error: UpstreamErrorBody },
    Other { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneItem {
    BuiltInToolCall(BuiltInTool),
    Unrecognized(String),
    Missing,
}

/// A record that is not an event. Keep-alives, `[DONE]` markers and other
/// framing noise land here and are dropped without ending the stream.
#[derive(Debug, thiserror::Error)]
#[error("skipped stream record: {reason}")]
pub struct RecordSkip {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    event_type: String,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    item: Option<WireItem>,
    #[serde(default)]
    response: Option<WireResponse>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    #[serde(default, rename = "type")]
    item_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<UpstreamErrorBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default, alias = "prompt_tokens", deserialize_with = "null_as_default")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens", deserialize_with = "null_as_default")]
    output_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage::reported(usage.input_tokens, usage.output_tokens, usage.total_tokens)
    }
}

/// A successfully decoded record, ready to forward.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Event name to forward under: the payload `type`, else the SSE `event:` name.
    pub name: String,
    pub event: StreamEvent,
}

/// Decodes one record's `data` payload. `sse_event` is the record's `event:` line.
pub fn decode_record(sse_event: &str, data: &str) -> Result<DecodedRecord, RecordSkip> {
    let wire: WireEvent = serde_json::from_str(data).map_err(|err| RecordSkip {
        reason: err.to_string(),
    })?;
    let name = if wire.event_type.is_empty() {
        sse_event.to_string()
    } else {
        wire.event_type.clone()
    };
    let event = match name.as_str() {
        OUTPUT_TEXT_DELTA => match wire.delta {
            Some(Value::String(delta)) => StreamEvent::TextDelta { delta },
            _ => StreamEvent::Other { event_type: name.clone() },
        },
        OUTPUT_ITEM_DONE => {
            let item = match wire.item.and_then(|item| item.item_type) {
                Some(item_type) => match BuiltInTool::from_item_type(&item_type) {
                    Some(tool) => DoneItem::BuiltInToolCall(tool),
                    None => DoneItem::Unrecognized(item_type),
                },
                None => DoneItem::Missing,
            };
            StreamEvent::ItemDone { item }
        }
        RESPONSE_COMPLETED | RESPONSE_INCOMPLETE => StreamEvent::Completed {
            usage: wire
                .response
                .and_then(|response| response.usage)
                .map(Usage::from),
        },
        RESPONSE_FAILED => StreamEvent::Failed {
            error: wire
                .response
                .and_then(|response| response.error)
                .unwrap_or_default(),
        },
        ERROR_EVENT => StreamEvent::Failed {
            error: UpstreamErrorBody {
                message: wire.message.unwrap_or_default(),
                code: wire.code,
                error_type: None,
            },
        },
        _ => StreamEvent::Other { event_type: name.clone() },
    };
    Ok(DecodedRecord { name, event })
}

/// Walks an upstream SSE byte stream: decode, forward, then interpret each record in order.
///
/// Returns when the upstream ends, its transport fails, or the client goes away. A
/// disconnect is noticed while waiting on upstream, not only at the next write.
/// Success or failure of the request is left to the caller; the context holds
/// whatever was accumulated.
pub async fn dispatch_stream<S, B, E, K>(upstream: S, ctx: &mut RequestUsageContext, sink: &mut K)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    K: ClientSink + ?Sized,
{
    let mut records = std::pin::pin!(upstream.eventsource());
    loop {
        let next = tokio::select! {
            biased;
            () = sink.closed() => {
                tracing::info!(model = %ctx.model(), "client went away while waiting on upstream");
                ctx.mark_client_disconnected();
                break;
            }
            next = records.next() => next,
        };
        let Some(record) = next else {
            break;
        };
        let record = match record {
            Ok(record) => record,
            Err(EventStreamError::Transport(err)) => {
                tracing::warn!(model = %ctx.model(), "upstream stream broke: {err}");
                ctx.mark_upstream_interrupted();
                break;
            }
            Err(err) => {
                skip_record(&err.to_string());
                continue;
            }
        };
        let decoded = match decode_record(&record.event, &record.data) {
            Ok(decoded) => decoded,
            Err(skip) => {
                skip_record(&skip.reason);
                continue;
            }
        };
        let frame = ClientFrame::Event {
            name: decoded.name,
            data: record.data,
        };
        if let Err(err) = sink.forward(frame).await {
            tracing::info!(model = %ctx.model(), "stopping stream relay: {err}");
            ctx.mark_client_disconnected();
            break;
        }
        ctx.apply(&decoded.event);
    }
}

fn skip_record(reason: &str) {
    metrics::counter!("relay_stream_records_skipped_total").increment(1);
    tracing::debug!(reason, "skipping undecodable stream record");
}
