//! Stateless request/response transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::headers::{HeaderSet, HeaderSource};
use crate::operation::{Operation, Response};

/// Sends one GraphQL request and decodes the reply.
#[async_trait]
pub trait HttpEngine: Send + Sync {
    async fn send(
        &self,
        url: &str,
        operation: &Operation,
        headers: &HeaderSet,
    ) -> ClientResult<Response>;
}

/// Binds an [`HttpEngine`] to an endpoint and a header source.
#[derive(Clone)]
pub struct StatelessTransport {
    url: Arc<str>,
    engine: Arc<dyn HttpEngine>,
    headers: HeaderSource,
}

impl StatelessTransport {
    pub fn new(url: impl Into<String>, engine: Arc<dyn HttpEngine>, headers: HeaderSource) -> Self {
        Self {
            url: Arc::from(url.into()),
            engine,
            headers,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends `operation` with headers composed for this call.
    pub async fn send(&self, operation: &Operation) -> ClientResult<Response> {
        let headers = self.headers.compose_with(&operation.context.headers);
        debug!(
            kind = %operation.kind,
            name = operation.operation_name.as_deref().unwrap_or(""),
            url = %self.url,
            "sending request"
        );
        let result = self.engine.send(&self.url, operation, &headers).await;
        if let Err(error) = &result {
            debug!(code = %error.code, "request failed");
        }
        result
    }
}

impl fmt::Debug for StatelessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// [`HttpEngine`] backed by `reqwest`. Posts
/// `{query, variables, operationName}` as JSON.
#[derive(Debug, Clone)]
pub struct ReqwestEngine {
    client: reqwest::Client,
}

impl ReqwestEngine {
    pub fn new(timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Uses an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpEngine for ReqwestEngine {
    async fn send(
        &self,
        url: &str,
        operation: &Operation,
        headers: &HeaderSet,
    ) -> ClientResult<Response> {
        let mut request = self.client.post(url).json(operation);
        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        trace!(status = status.as_u16(), bytes = body.len(), "response received");

        if !status.is_success() {
            return Err(ClientError::from_status(status.as_u16(), &body));
        }
        serde_json::from_slice(&body)
            .map_err(|e| ClientError::deserialize(format!("invalid GraphQL response: {e}")))
    }
}
