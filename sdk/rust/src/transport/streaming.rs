//! Streaming transport controller.
//!
//! The controller owns the engine client and remembers the socket the
//! engine reported last. Forcing that socket closed is how a credential
//! change reaches the streaming side: the engine notices the close,
//! reconnects, and asks the header provider for fresh headers.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::error::ClientResult;
use crate::headers::HeaderProvider;
use crate::operation::{Operation, Response};
use crate::pipeline::ResultStream;
use crate::sync::{lock, Teardown};

/// Where an engine delivers the results of one subscription. Dropping the
/// sender completes the subscription stream.
pub type SubscriptionSink = mpsc::UnboundedSender<ClientResult<Response>>;

/// Called by the engine every time a connection is acknowledged.
pub type ConnectedHandler = Arc<dyn Fn(Arc<dyn Socket>) + Send + Sync>;

/// What an engine is started with.
#[derive(Clone)]
pub struct ConnectParams {
    pub url: String,
    /// Must be called at every connect and reconnect attempt.
    pub headers: HeaderProvider,
    pub on_connected: ConnectedHandler,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// A persistent-connection engine.
///
/// Implementations must reconnect on their own after a socket closes while
/// subscriptions remain, calling [`ConnectParams::headers`] again for the
/// new attempt.
pub trait SocketEngine: Send + Sync {
    fn start(&self, params: ConnectParams) -> Arc<dyn SocketClient>;
}

/// A started engine.
pub trait SocketClient: Send + Sync {
    /// Registers a subscription. The returned teardown unsubscribes it
    /// without closing the shared connection.
    fn subscribe(&self, operation: &Operation, sink: SubscriptionSink) -> Teardown;

    /// Stops the engine for good.
    fn dispose(&self) {}
}

/// A connection reported through [`ConnectParams::on_connected`].
pub trait Socket: Send + Sync {
    /// Asks the engine to close this connection. Returns `false` when the
    /// connection had already ended.
    fn close(&self) -> bool;
}

/// Derives the streaming endpoint from an HTTP one by replacing the
/// leading `http` with `ws`.
///
/// ```
/// use sessionql_sdk::transport::derive_streaming_url;
///
/// assert_eq!(derive_streaming_url("https://api.example.com/v1/graphql"), "wss://api.example.com/v1/graphql");
/// assert_eq!(derive_streaming_url("http://localhost:8080/graphql"), "ws://localhost:8080/graphql");
/// ```
pub fn derive_streaming_url(http_url: &str) -> String {
    match http_url.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => http_url.to_owned(),
    }
}

type ActiveSocket = Arc<Mutex<Option<Arc<dyn Socket>>>>;

/// Owns the engine client and the currently recorded socket.
pub struct StreamingController {
    url: String,
    client: Arc<dyn SocketClient>,
    active: ActiveSocket,
}

impl StreamingController {
    /// Starts `engine` against `url`.
    pub fn connect(engine: &dyn SocketEngine, url: impl Into<String>, headers: HeaderProvider) -> Self {
        let url = url.into();
        let active: ActiveSocket = Arc::default();
        let recorder = Arc::clone(&active);
        let on_connected: ConnectedHandler = Arc::new(move |socket| {
            trace!("streaming connection established");
            *lock(&recorder) = Some(socket);
        });
        let client = engine.start(ConnectParams {
            url: url.clone(),
            headers,
            on_connected,
        });
        Self {
            url,
            client,
            active,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Records `socket` as the live connection, replacing any previous one.
    pub fn on_connected(&self, socket: Arc<dyn Socket>) {
        *lock(&self.active) = Some(socket);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Closes the recorded socket and forgets it. Returns `false` when
    /// nothing was recorded or the recorded connection had already ended.
    pub fn force_close(&self) -> bool {
        let Some(socket) = lock(&self.active).take() else {
            trace!("no streaming connection to close");
            return false;
        };
        if socket.close() {
            debug!(url = %self.url, "closed streaming connection");
            true
        } else {
            trace!("recorded streaming connection had already ended");
            false
        }
    }

    /// Starts a subscription. Dropping the stream unsubscribes it.
    pub fn subscribe(&self, operation: &Operation) -> ResultStream {
        let (sink, receiver) = mpsc::unbounded_channel();
        let teardown = self.client.subscribe(operation, sink);
        SubscriptionStream {
            inner: UnboundedReceiverStream::new(receiver),
            _teardown: teardown,
        }
        .boxed()
    }

    /// Stops the engine, then closes the connection so nothing reconnects.
    pub fn shutdown(&self) {
        self.client.dispose();
        self.force_close();
    }
}

impl fmt::Debug for StreamingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingController")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct SubscriptionStream {
    inner: UnboundedReceiverStream<ClientResult<Response>>,
    _teardown: Teardown,
}

impl Stream for SubscriptionStream {
    type Item = ClientResult<Response>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
