//! Client configuration.

use std::time::Duration;

use crate::error::{ClientError, ClientResult};
use crate::headers::HeaderSet;
use crate::operation::RequestPolicy;
use crate::transport::WsConfig;

/// Environment variable naming the GraphQL endpoint.
pub const ENV_ENDPOINT: &str = "SESSIONQL_ENDPOINT";
/// Environment variable holding the default request policy.
pub const ENV_REQUEST_POLICY: &str = "SESSIONQL_REQUEST_POLICY";
/// Environment variable holding extra headers as `name=value,name=value`.
pub const ENV_HEADERS: &str = "SESSIONQL_HEADERS";

/// What the host environment can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether persistent (WebSocket) connections may be opened. Without
    /// it subscriptions are rejected.
    pub persistent_connections: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            persistent_connections: true,
        }
    }
}

impl Capabilities {
    /// An environment that can only issue one-shot requests.
    pub fn restricted() -> Self {
        Self {
            persistent_connections: false,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// GraphQL endpoint. Falls back to the auth provider's URL when unset.
    pub endpoint_url: Option<String>,
    /// Headers sent with every request and connection.
    pub headers: HeaderSet,
    /// Policy for operations that do not set their own.
    pub request_policy: RequestPolicy,
    pub capabilities: Capabilities,
    /// Timeout of the default HTTP engine.
    pub http_timeout: Duration,
    /// Settings of the default WebSocket engine.
    pub ws: WsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            headers: HeaderSet::new(),
            request_policy: RequestPolicy::default(),
            capabilities: Capabilities::default(),
            http_timeout: Duration::from_secs(30),
            ws: WsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a config targeting `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            endpoint_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Reads `SESSIONQL_ENDPOINT`, `SESSIONQL_REQUEST_POLICY` and
    /// `SESSIONQL_HEADERS`.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`ClientConfig::from_env`] but over an explicit variable list.
    pub fn from_vars<I, K, V>(vars: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_ENDPOINT => config.endpoint_url = Some(value.to_owned()),
                ENV_REQUEST_POLICY => config.request_policy = value.parse()?,
                ENV_HEADERS => config.headers.merge(&parse_header_list(value)?),
                _ => {}
            }
        }
        Ok(config)
    }

    /// Sets the endpoint.
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds every header of `headers`.
    pub fn headers(mut self, headers: &HeaderSet) -> Self {
        self.headers.merge(headers);
        self
    }

    /// Sets the default request policy.
    pub fn request_policy(mut self, policy: RequestPolicy) -> Self {
        self.request_policy = policy;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the HTTP request timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Sets the WebSocket engine settings.
    pub fn ws(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }

    /// Checks values that would only fail later at connect time.
    pub fn validate(&self) -> ClientResult<()> {
        if self.http_timeout.is_zero() {
            return Err(ClientError::config("http timeout must be > 0"));
        }
        self.ws.validate()
    }
}

/// Parses `name=value,name=value`.
pub fn parse_header_list(input: &str) -> ClientResult<HeaderSet> {
    let mut headers = HeaderSet::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ClientError::config(format!("expected name=value, got `{pair}`")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::config(format!("empty header name in `{pair}`")));
        }
        headers.insert(name, value.trim());
    }
    Ok(headers)
}
