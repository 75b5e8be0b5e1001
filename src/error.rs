use crate::relay::null_as_default;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const READ_RESPONSE_BODY_FAILED: &str = "read_response_body_failed";
pub const UNMARSHAL_RESPONSE_BODY_FAILED: &str = "unmarshal_response_body_failed";
pub const BAD_RESPONSE_STATUS_CODE: &str = "bad_response_status_code";
pub const UPSTREAM_ERROR_TYPE: &str = "upstream_error";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// A failure on our side of the relay. Always a 500, tagged so it can be
    /// told apart from anything the provider said.
    pub fn local(tag: &str, err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, tag, err.to_string()).with_type(tag)
    }

    /// An error the provider reported in a well-formed payload. Status, message
    /// and code are echoed as received.
    pub fn upstream(status: StatusCode, body: UpstreamErrorBody) -> Self {
        Self::new(status, code_to_string(body.code.as_ref()), body.message)
            .with_type(UPSTREAM_ERROR_TYPE)
    }

    /// Classifies a non-2xx upstream reply from its raw body.
    pub fn from_upstream_status(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<UpstreamErrorEnvelope>(body) {
            Ok(UpstreamErrorEnvelope { error: Some(error) }) => Self::upstream(status, error),
            _ => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let message = if text.is_empty() {
                    format!("upstream status {}", status)
                } else {
                    text
                };
                Self::new(status, BAD_RESPONSE_STATUS_CODE, message).with_type(UPSTREAM_ERROR_TYPE)
            }
        }
    }

    pub fn is_local(&self) -> bool {
        self.error_type == READ_RESPONSE_BODY_FAILED
            || self.error_type == UNMARSHAL_RESPONSE_BODY_FAILED
    }
}

/// The `error` object providers embed in a response payload or stream event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorEnvelope {
    #[serde(default)]
    error: Option<UpstreamErrorBody>,
}

fn code_to_string(code: Option<&Value>) -> String {
    match code {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
