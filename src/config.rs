use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub auth: UpstreamAuthConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: UpstreamAuthType,
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamAuthType {
    Bearer,
    Header,
    Query,
}

impl UpstreamConfig {
    /// Reads `RELAY_UPSTREAM_*` variables.
    pub fn from_env() -> Result<Self, String> {
        let base_url = env_non_empty("RELAY_UPSTREAM_BASE_URL")
            .ok_or_else(|| "RELAY_UPSTREAM_BASE_URL is required".to_string())?;
        let value = env_non_empty("RELAY_UPSTREAM_API_KEY").unwrap_or_default();
        let auth_type = match env_non_empty("RELAY_UPSTREAM_AUTH") {
            Some(raw) => parse_auth_type(&raw)?,
            None => UpstreamAuthType::Bearer,
        };
        let timeout_ms = match env_non_empty("RELAY_UPSTREAM_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|err| format!("RELAY_UPSTREAM_TIMEOUT_MS: {err}"))?,
            None => default_timeout_ms(),
        };
        Ok(Self {
            base_url,
            auth: UpstreamAuthConfig {
                auth_type,
                value,
                header_name: env_non_empty("RELAY_UPSTREAM_AUTH_HEADER"),
                query_name: env_non_empty("RELAY_UPSTREAM_AUTH_QUERY"),
            },
            timeout_ms,
        })
    }
}

fn parse_auth_type(raw: &str) -> Result<UpstreamAuthType, String> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .map_err(|_| format!("RELAY_UPSTREAM_AUTH: unsupported auth type `{raw}`"))
}

pub(crate) fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn default_timeout_ms() -> u64 {
    300_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_parses_case_insensitively() {
        assert_eq!(parse_auth_type("Bearer").unwrap(), UpstreamAuthType::Bearer);
        assert_eq!(parse_auth_type(" header ").unwrap(), UpstreamAuthType::Header);
        assert_eq!(parse_auth_type("query").unwrap(), UpstreamAuthType::Query);
        assert!(parse_auth_type("basic").is_err());
    }

    #[test]
    fn upstream_config_deserializes_with_default_timeout() {
        let cfg: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "base_url": "https://api.example.com/v1",
            "auth": { "type": "header", "value": "sk-test", "header_name": "x-api-key" }
        }))
        .unwrap();
        assert_eq!(cfg.timeout_ms, 300_000);
        assert_eq!(cfg.auth.auth_type, UpstreamAuthType::Header);
        assert_eq!(cfg.auth.header_name.as_deref(), Some("x-api-key"));
    }
}
