use crate::config::{UpstreamAuthConfig, UpstreamAuthType, UpstreamConfig};
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;

pub const RESPONSES_PATH: &str = "/v1/responses";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamCallError {
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream base_url is empty")]
    MissingBaseUrl,
}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        match err {
            UpstreamCallError::Network(err) => {
                let status = if err.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                AppError::new(status, "upstream_request_failed", err.to_string())
                    .with_type("upstream_error")
            }
            UpstreamCallError::MissingBaseUrl => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_not_configured",
                "upstream base_url is empty",
            ),
        }
    }
}

/// Sends `body` to the upstream's responses endpoint.
///
/// The response is returned whatever its status; classifying non-2xx replies is
/// the relay's job.
pub async fn send_responses_request(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    send_raw(client, upstream, RESPONSES_PATH, body).await
}

pub async fn send_raw(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    path: &str,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    if upstream.base_url.trim().is_empty() {
        return Err(UpstreamCallError::MissingBaseUrl);
    }
    let url = join_url(&upstream.base_url, path);
    let req = client
        .post(url)
        .timeout(std::time::Duration::from_millis(upstream.timeout_ms))
        .json(body);
    let req = apply_auth(req, &upstream.auth);
    tracing::debug!(path, "forwarding request upstream");
    Ok(req.send().await?)
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &UpstreamAuthConfig) -> reqwest::RequestBuilder {
    if auth.value.is_empty() {
        return req;
    }
    match auth.auth_type {
        UpstreamAuthType::Bearer => req.bearer_auth(&auth.value),
        UpstreamAuthType::Header => {
            let header_name = auth.header_name.as_deref().unwrap_or("x-api-key");
            req.header(header_name, &auth.value)
        }
        UpstreamAuthType::Query => {
            let query_name = auth.query_name.as_deref().unwrap_or("api_key");
            req.query(&[(query_name, auth.value.as_str())])
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::join_url;

    #[test]
    fn join_url_does_not_double_version_prefix() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1/responses"),
            "https://api.example.com/v1/responses"
        );
        assert_eq!(
            join_url("http://127.0.0.1:9000", "/v1/responses"),
            "http://127.0.0.1:9000/v1/responses"
        );
    }
}
