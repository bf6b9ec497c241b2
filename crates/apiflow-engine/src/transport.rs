//! HTTP seam between the executor and the network.
//!
//! The executor only talks to [`HttpTransport`]; [`ReqwestTransport`] is the
//! production implementation and tests substitute a scripted one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use apiflow_core::EngineConfig;
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// A fully resolved outbound request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    /// URL without query string; query pairs travel in `query`.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Map<String, Value>,
    /// Parsed JSON when the payload is JSON, the raw text otherwise.
    pub body: Value,
}

impl HttpResponse {
    /// `{status, headers, body}` as recorded in step results.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("API request timed out")]
    Timeout,

    #[error("API connection failed: unable to reach server")]
    Connect,

    #[error("HTTP error: {0}")]
    Status(u16),

    #[error("API request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Drop every cookie the transport has accumulated.
    fn clear_cookies(&self);

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;

    /// A transport with its own connection pool and cookie jar, built for the
    /// next test case. `None` means this one is reused as is.
    fn fresh(&self) -> Result<Option<Self>, TransportError>
    where
        Self: Sized,
    {
        Ok(None)
    }
}

/// Cookie store that can be emptied between requests.
///
/// Cookies set during one exchange (e.g. across redirects) are kept until the
/// next [`HttpTransport::clear_cookies`] call.
#[derive(Debug, Default)]
pub struct ClearableJar {
    cookies: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl ClearableJar {
    pub fn clear(&self) {
        match self.cookies.lock() {
            Ok(mut cookies) => cookies.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.lock().map(|c| c.is_empty()).unwrap_or(true)
    }
}

impl reqwest::cookie::CookieStore for ClearableJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        let Ok(mut cookies) = self.cookies.lock() else {
            return;
        };
        let host_cookies = cookies.entry(host.to_string()).or_default();
        for header in cookie_headers {
            let Ok(text) = header.to_str() else {
                continue;
            };
            let pair = text.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                host_cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn cookies(&self, url: &url::Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let cookies = self.cookies.lock().ok()?;
        let host_cookies = cookies.get(host).filter(|c| !c.is_empty())?;
        let header = host_cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

/// `reqwest`-backed transport shared by every node of a test-case run.
pub struct ReqwestTransport {
    http: reqwest::Client,
    jar: std::sync::Arc<ClearableJar>,
    timeout: Duration,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, TransportError> {
        Self::build(
            Duration::from_millis(config.request_timeout_ms),
            config.user_agent.clone(),
        )
    }

    fn build(timeout: Duration, user_agent: String) -> Result<Self, TransportError> {
        let jar = std::sync::Arc::new(ClearableJar::default());
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.clone())
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self {
            http,
            jar,
            timeout,
            user_agent,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    fn clear_cookies(&self) {
        self.jar.clear();
    }

    fn fresh(&self) -> Result<Option<Self>, TransportError> {
        Self::build(self.timeout, self.user_agent.clone()).map(Some)
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| TransportError::Other(format!("invalid method {}", request.method)))?;

        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "Sending request");
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                warn!(header = %name, "Skipping non-text response header");
                continue;
            };
            let entry = headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| Value::String(String::new()));
            if let Value::String(joined) = entry {
                if !joined.is_empty() {
                    joined.push_str(", ");
                }
                joined.push_str(value);
            }
        }

        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
