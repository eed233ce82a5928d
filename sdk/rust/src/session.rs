//! Session assembly and the public client handle.
//!
//! [`ClientBuilder::build`] validates the collaborators, derives both
//! endpoints, assembles the stage pipeline and registers the single
//! credential listener. That listener is what keeps the streaming side
//! honest: every token change force-closes the live connection so the
//! engine reconnects with fresh headers. HTTP requests need no such help
//! because their headers are composed per send.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use crate::config::{Capabilities, ClientConfig};
use crate::credential::{AuthProvider, CredentialAccessor, ListenerHandle};
use crate::error::{ClientError, ClientResult, ErrorCode};
use crate::headers::HeaderSource;
use crate::operation::{Operation, OperationKind, RequestPolicy, Response, TypedOperation};
use crate::pipeline::{
    CacheStage, DedupStage, FetchStage, FocusSignal, Pipeline, RefocusStage, ResultStream, Stage,
    SubscriptionStage,
};
use crate::sync::lock;
use crate::transport::{
    derive_streaming_url, HttpEngine, ReqwestEngine, SocketEngine, StatelessTransport,
    StreamingController, WsEngine,
};

/// Builds a [`Client`].
///
/// ```ignore
/// use std::sync::Arc;
/// use sessionql_sdk::{Client, TokenStore};
///
/// let auth = TokenStore::with_token(token);
/// let client = Client::builder()
///     .auth_provider(Arc::new(auth.clone()))
///     .endpoint_url("https://example.nhost.run/v1/graphql")
///     .header("x-hasura-role", "user")
///     .build()?;
///
/// let response = client.query("{ todos { id title } }").await?;
/// ```
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    auth: Option<Arc<dyn AuthProvider>>,
    http_engine: Option<Arc<dyn HttpEngine>>,
    socket_engine: Option<Arc<dyn SocketEngine>>,
    stages: Vec<Arc<dyn Stage>>,
    focus: Option<FocusSignal>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the required auth provider.
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.config = self.config.endpoint_url(url);
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.config = self.config.header(name, value);
        self
    }

    pub fn request_policy(mut self, policy: RequestPolicy) -> Self {
        self.config = self.config.request_policy(policy);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.config = self.config.capabilities(capabilities);
        self
    }

    /// Appends a stage. Added stages run after the cache and before dispatch,
    /// in the order they were added.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Replaces the default `reqwest` engine.
    pub fn http_engine(mut self, engine: Arc<dyn HttpEngine>) -> Self {
        self.http_engine = Some(engine);
        self
    }

    /// Replaces the default WebSocket engine.
    pub fn socket_engine(mut self, engine: Arc<dyn SocketEngine>) -> Self {
        self.socket_engine = Some(engine);
        self
    }

    /// Enables refocus re-execution driven by `signal`.
    pub fn focus_signal(mut self, signal: FocusSignal) -> Self {
        self.focus = Some(signal);
        self
    }

    /// Assembles the client. Must run inside a Tokio runtime.
    pub fn build(self) -> ClientResult<Client> {
        let auth = self.auth.ok_or_else(|| {
            ClientError::new(
                ErrorCode::MissingAuthProvider,
                "an auth provider is required to build a client",
            )
        })?;
        self.config.validate()?;

        let credentials = CredentialAccessor::new(auth);
        let url = self
            .config
            .endpoint_url
            .clone()
            .or_else(|| credentials.graphql_url())
            .ok_or_else(|| {
                ClientError::new(ErrorCode::InvalidUrl, "no GraphQL endpoint configured")
            })?;
        validate_endpoint(&url)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClientError::config(
                "a Tokio runtime is required to build a client",
            ));
        }

        let headers = HeaderSource::new(self.config.headers.clone(), credentials.clone());
        let http_engine: Arc<dyn HttpEngine> = match self.http_engine {
            Some(engine) => engine,
            None => Arc::new(ReqwestEngine::new(self.config.http_timeout)?),
        };
        let stateless = StatelessTransport::new(url.clone(), http_engine, headers.clone());

        let controller = if self.config.capabilities.persistent_connections {
            let engine: Arc<dyn SocketEngine> = match self.socket_engine {
                Some(engine) => engine,
                None => Arc::new(WsEngine::new(self.config.ws.clone())),
            };
            let streaming_url = derive_streaming_url(&url);
            Some(Arc::new(StreamingController::connect(
                engine.as_ref(),
                streaming_url,
                headers.provider(),
            )))
        } else {
            None
        };

        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(DedupStage::new()),
            Arc::new(RefocusStage::new(self.focus)),
            Arc::new(CacheStage::new(self.config.request_policy)),
        ];
        stages.extend(self.stages);
        stages.push(Arc::new(FetchStage::new(stateless)));
        if let Some(controller) = &controller {
            stages.push(Arc::new(SubscriptionStage::new(Arc::clone(controller))));
        }
        let pipeline = Pipeline::new(stages);

        let weak = controller.as_ref().map(Arc::downgrade);
        let listener = credentials.on_change(Arc::new(move || {
            let closed = weak
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|controller| controller.force_close());
            debug!(closed, "credential changed");
        }));

        info!(
            url = %url,
            streaming = controller.is_some(),
            stages = ?pipeline.stage_names(),
            "client ready"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                url,
                pipeline,
                controller,
                listener: Mutex::new(Some(listener)),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("auth", &self.auth.is_some())
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

fn validate_endpoint(url: &str) -> ClientResult<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            ClientError::new(
                ErrorCode::InvalidUrl,
                format!("endpoint must be an http(s) URL: {url}"),
            )
        })?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ClientError::new(
            ErrorCode::InvalidUrl,
            format!("endpoint has no host: {url}"),
        ));
    }
    Ok(())
}

struct ClientInner {
    url: String,
    pipeline: Pipeline,
    controller: Option<Arc<StreamingController>>,
    listener: Mutex<Option<ListenerHandle>>,
    disposed: AtomicBool,
}

/// A GraphQL session bound to an auth provider. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The HTTP endpoint.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The WebSocket endpoint, when subscriptions are available.
    pub fn streaming_url(&self) -> Option<&str> {
        self.inner.controller.as_deref().map(StreamingController::url)
    }

    pub fn supports_subscriptions(&self) -> bool {
        self.inner.controller.is_some()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<String> {
        self.inner.pipeline.stage_names()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Runs `operation` through the pipeline and returns its result stream.
    pub async fn execute(&self, operation: Operation) -> ClientResult<ResultStream> {
        if self.is_disposed() {
            return Err(ClientError::disposed());
        }
        self.inner.pipeline.execute(Arc::new(operation)).await
    }

    /// Runs a query or mutation and waits for its first fresh result.
    ///
    /// GraphQL errors come back inside the [`Response`]; only transport
    /// failures are `Err`.
    pub async fn request(&self, operation: Operation) -> ClientResult<Response> {
        let mut results = self.execute(operation).await?;
        let mut stale = None;
        while let Some(result) = results.next().await {
            let response = result?;
            if !response.stale {
                return Ok(response);
            }
            stale = Some(response);
        }
        stale.ok_or_else(|| ClientError::new(ErrorCode::NoData, "operation produced no result"))
    }

    /// Shorthand for a query without variables.
    pub async fn query(&self, document: impl Into<String>) -> ClientResult<Response> {
        self.request(Operation::query(document)).await
    }

    /// Shorthand for a mutation without variables.
    pub async fn mutate(&self, document: impl Into<String>) -> ClientResult<Response> {
        self.request(Operation::mutation(document)).await
    }

    /// Starts a subscription.
    pub async fn subscribe(&self, operation: Operation) -> ClientResult<ResultStream> {
        if operation.kind != OperationKind::Subscription {
            return Err(ClientError::config(format!(
                "subscribe expects a subscription, got a {}",
                operation.kind
            )));
        }
        self.execute(operation).await
    }

    /// Runs a typed query or mutation and decodes its data.
    pub async fn execute_typed<Op: TypedOperation>(
        &self,
        variables: &Op::Variables,
    ) -> ClientResult<Op::Response> {
        let operation = Operation::typed::<Op>(variables)?;
        self.request(operation).await?.data_as()
    }

    /// Starts a typed subscription and decodes every event.
    pub async fn subscribe_typed<Op>(
        &self,
        variables: &Op::Variables,
    ) -> ClientResult<BoxStream<'static, ClientResult<Op::Response>>>
    where
        Op: TypedOperation,
        Op::Response: Send + 'static,
    {
        let operation = Operation::typed::<Op>(variables)?;
        let events = self.subscribe(operation).await?;
        Ok(events
            .map(|event| event.and_then(Response::data_as::<Op::Response>))
            .boxed())
    }

    /// Stops the credential listener, closes the streaming connection and
    /// rejects further operations. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.run();
        }
        if let Some(controller) = &self.inner.controller {
            controller.shutdown();
        }
        debug!(url = %self.inner.url, "client disposed");
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("pipeline", &self.inner.pipeline)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
