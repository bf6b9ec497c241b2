use serde::{Deserialize, Serialize};

/// Per-environment request overrides supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentConfig {
    /// Prefix for relative URLs; replaces the origin of absolute ones.
    pub base_url: Option<String>,
    pub auth_token_enabled: bool,
    pub auth_token_key: Option<String>,
    pub auth_token_value: Option<String>,
    pub session_enabled: bool,
    /// Raw `Cookie` header value, e.g. `sid=abc; theme=dark`.
    pub session_cookies: Option<String>,
}

impl EnvironmentConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Header name and value to inject, if auth injection is enabled and
    /// both parts are present.
    pub fn auth_header(&self) -> Option<(&str, &str)> {
        if !self.auth_token_enabled {
            return None;
        }
        let key = self.auth_token_key.as_deref().filter(|s| !s.is_empty())?;
        let value = self.auth_token_value.as_deref().filter(|s| !s.is_empty())?;
        Some((key, value))
    }

    pub fn session_cookies(&self) -> Option<&str> {
        if !self.session_enabled {
            return None;
        }
        self.session_cookies
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Run-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
    /// Time waits longer than this sleep in chunks and report progress.
    pub time_wait_chunk_threshold_ms: u64,
    pub time_wait_chunk_ms: u64,
    pub default_condition_timeout_ms: u64,
    pub default_condition_interval_ms: u64,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            time_wait_chunk_threshold_ms: 10_000,
            time_wait_chunk_ms: 5_000,
            default_condition_timeout_ms: 30_000,
            default_condition_interval_ms: 2_000,
            user_agent: concat!("apiflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_header_requires_flag_and_both_parts() {
        let mut env: EnvironmentConfig = serde_json::from_value(json!({
            "authTokenEnabled": true,
            "authTokenKey": "Authorization",
            "authTokenValue": "Bearer t0k3n"
        }))
        .unwrap();
        assert_eq!(env.auth_header(), Some(("Authorization", "Bearer t0k3n")));

        env.auth_token_value = Some(String::new());
        assert_eq!(env.auth_header(), None);

        env.auth_token_value = Some("x".into());
        env.auth_token_enabled = false;
        assert_eq!(env.auth_header(), None);
    }

    #[test]
    fn blank_base_url_is_ignored() {
        let env = EnvironmentConfig {
            base_url: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(env.base_url(), None);
    }

    #[test]
    fn session_cookies_need_session_mode() {
        let env = EnvironmentConfig {
            session_cookies: Some("sid=1".into()),
            ..Default::default()
        };
        assert_eq!(env.session_cookies(), None);
        let env = EnvironmentConfig {
            session_enabled: true,
            ..env
        };
        assert_eq!(env.session_cookies(), Some("sid=1"));
    }

    #[test]
    fn engine_config_fills_missing_fields() {
        let config: EngineConfig = serde_json::from_value(json!({"requestTimeoutMs": 500})).unwrap();
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.time_wait_chunk_ms, 5_000);
        assert_eq!(config.default_condition_interval_ms, 2_000);
    }
}
