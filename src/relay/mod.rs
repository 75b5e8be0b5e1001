//! Turns one upstream response into forwarded client frames plus a settled usage value.
//!
//! Non-streaming bodies go through [`envelope`], event streams through [`stream`].
//! Both paths thread a caller-owned [`RequestUsageContext`] and report through
//! `AppResult<Usage>`, so a request ends with either usage or an error, never both.

pub mod context;
pub mod envelope;
pub mod sink;
pub mod stream;

pub use context::RequestUsageContext;
pub use sink::{ClientFrame, ClientSink, ForwardError};
pub use stream::{DoneItem, StreamEvent};

use crate::error::{AppError, AppResult, READ_RESPONSE_BODY_FAILED};
use crate::usage::{TokenEstimator, Usage};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Reads an explicit JSON `null` as the field's default, the way a missing field is read.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    NonStream,
    Stream,
}

impl RelayMode {
    /// Reads the client request's `stream` flag.
    pub fn from_request(body: &Value) -> Self {
        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            Self::Stream
        } else {
            Self::NonStream
        }
    }
}

/// Passes 2xx responses through; anything else is read and classified.
pub async fn ensure_success(upstream: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = upstream.status();
    if status.is_success() {
        return Ok(upstream);
    }
    let body = upstream
        .bytes()
        .await
        .map_err(|err| AppError::local(READ_RESPONSE_BODY_FAILED, err))?;
    Err(AppError::from_upstream_status(status, &body))
}

/// Relays one upstream response to `sink` and settles usage into `ctx`.
pub async fn relay_response<K>(
    mode: RelayMode,
    upstream: reqwest::Response,
    ctx: &mut RequestUsageContext,
    sink: &mut K,
    estimator: &dyn TokenEstimator,
) -> AppResult<Usage>
where
    K: ClientSink + ?Sized,
{
    let upstream = ensure_success(upstream).await?;
    let status = upstream.status();
    match mode {
        RelayMode::NonStream => {
            let body = upstream
                .bytes()
                .await
                .map_err(|err| AppError::local(READ_RESPONSE_BODY_FAILED, err))?;
            envelope::relay_envelope(status, body, ctx, sink).await
        }
        RelayMode::Stream => {
            stream::dispatch_stream(upstream.bytes_stream(), ctx, sink).await;
            Ok(ctx.reconcile(estimator))
        }
    }
}
