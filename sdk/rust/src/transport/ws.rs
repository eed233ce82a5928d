//! `graphql-transport-ws` engine over `tokio-tungstenite`.
//!
//! A background task owns the socket. It connects lazily on the first
//! subscription, replays every live subscription after each acknowledged
//! connection, and reconnects with exponential backoff whenever the socket
//! goes away while subscriptions remain. When the last subscription ends
//! the connection is closed and the task idles until the next one.
//!
//! A credential that changes while a connection is still being opened has
//! no socket to close yet, so the engine compares the `authorization` it
//! connected with against the current one once the connection is reported,
//! and reconnects when they differ.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::streaming::{ConnectParams, Socket, SocketClient, SocketEngine, SubscriptionSink};
use crate::error::{ClientError, ClientResult, ErrorCode, ResultExt};
use crate::headers::{HeaderSet, AUTHORIZATION, PROTOCOL_HEADER};
use crate::operation::{GraphQLError, Operation, Response};
use crate::sync::Teardown;

/// Sub-protocol negotiated on the handshake.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection and reconnection settings for [`WsEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    /// How long to wait for the handshake plus `connection_ack`.
    pub ack_timeout: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Consecutive failed attempts before every subscriber is failed.
    pub max_attempts: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl WsConfig {
    pub fn validate(&self) -> ClientResult<()> {
        if self.initial_delay.is_zero() {
            return Err(ClientError::config("initial reconnect delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ClientError::config(
                "max reconnect delay must be >= initial reconnect delay",
            ));
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err(ClientError::config("backoff factor must be >= 1.0"));
        }
        if self.ack_timeout.is_zero() {
            return Err(ClientError::config("ack timeout must be > 0"));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let exponent = self.factor.powf(f64::from(attempt));
        let delay = (initial * exponent).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay)
    }
}

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    ConnectionInit {
        payload: InitPayload<'a>,
    },
    Subscribe {
        id: String,
        payload: &'a Operation,
    },
    Complete {
        id: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

#[derive(Debug, Serialize)]
struct InitPayload<'a> {
    headers: &'a HeaderSet,
}

impl ClientMessage<'_> {
    fn to_frame(&self) -> ClientResult<Message> {
        serde_json::to_string(self)
            .map(Message::Text)
            .map_err(|e| ClientError::new(ErrorCode::SerializeError, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Next {
        id: String,
        payload: Response,
    },
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    fn decode(frame: &Message) -> ClientResult<Option<Self>> {
        let parsed = match frame {
            Message::Text(text) => serde_json::from_str(text),
            Message::Binary(bytes) => serde_json::from_slice(bytes),
            _ => return Ok(None),
        };
        parsed
            .map(Some)
            .map_err(|e| ClientError::protocol(format!("invalid server message: {e}")))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Default [`SocketEngine`]. Needs a Tokio runtime when started.
#[derive(Debug, Clone, Default)]
pub struct WsEngine {
    config: WsConfig,
}

impl WsEngine {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

impl SocketEngine for WsEngine {
    fn start(&self, params: ConnectParams) -> Arc<dyn SocketClient> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (close_sender, close_requests) = mpsc::unbounded_channel();
        let actor = Actor {
            config: self.config.clone(),
            params,
            commands: receiver,
            close_sender,
            close_requests,
            subscriptions: BTreeMap::new(),
            generation: 0,
            live: Arc::new(AtomicU64::new(0)),
        };
        tokio::spawn(actor.run());
        Arc::new(WsClient {
            commands,
            next_id: AtomicU64::new(1),
        })
    }
}

enum Command {
    Subscribe {
        id: u64,
        operation: Operation,
        sink: SubscriptionSink,
    },
    Unsubscribe {
        id: u64,
    },
    Dispose,
}

struct WsClient {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl SocketClient for WsClient {
    fn subscribe(&self, operation: &Operation, sink: SubscriptionSink) -> Teardown {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::Subscribe {
            id,
            operation: operation.clone(),
            sink,
        };
        if let Err(mpsc::error::SendError(Command::Subscribe { sink, .. })) =
            self.commands.send(command)
        {
            let _ = sink.send(Err(ClientError::disposed()));
            return Teardown::noop();
        }
        let commands = self.commands.clone();
        Teardown::new(move || {
            let _ = commands.send(Command::Unsubscribe { id });
        })
    }

    fn dispose(&self) {
        let _ = self.commands.send(Command::Dispose);
    }
}

/// Handle to one acknowledged connection. Closing a handle whose
/// connection has already ended or been replaced does nothing.
struct WsSocket {
    generation: u64,
    live: Arc<AtomicU64>,
    close: mpsc::UnboundedSender<u64>,
}

impl Socket for WsSocket {
    fn close(&self) -> bool {
        if self.live.load(Ordering::SeqCst) != self.generation {
            return false;
        }
        self.close.send(self.generation).is_ok()
    }
}

struct Registered {
    operation: Operation,
    sink: SubscriptionSink,
}

enum Opened {
    Connected(Box<WsStream>, Option<String>),
    Idle,
    Disposed,
}

enum Served {
    Closed,
    Idle,
    Disposed,
}

struct Actor {
    config: WsConfig,
    params: ConnectParams,
    commands: mpsc::UnboundedReceiver<Command>,
    close_sender: mpsc::UnboundedSender<u64>,
    close_requests: mpsc::UnboundedReceiver<u64>,
    subscriptions: BTreeMap<u64, Registered>,
    generation: u64,
    /// Generation of the open connection, 0 while disconnected.
    live: Arc<AtomicU64>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            while self.subscriptions.is_empty() {
                match self.commands.recv().await {
                    None | Some(Command::Dispose) => return,
                    Some(command) => self.apply_offline(command),
                }
            }

            let (stream, authorization) = match self.open_with_retry().await {
                Opened::Connected(stream, authorization) => (stream, authorization),
                Opened::Idle => continue,
                Opened::Disposed => return,
            };

            let served = self.serve(*stream, authorization).await;
            self.live.store(0, Ordering::SeqCst);
            match served {
                Served::Closed => debug!(url = %self.params.url, "streaming connection closed"),
                Served::Idle => trace!("no subscriptions left; connection closed"),
                Served::Disposed => return,
            }
        }
    }

    fn apply_offline(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                id,
                operation,
                sink,
            } => {
                self.subscriptions.insert(id, Registered { operation, sink });
            }
            Command::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
            }
            Command::Dispose => {}
        }
    }

    async fn open_with_retry(&mut self) -> Opened {
        let mut failures = 0;
        loop {
            let error = match self.open().await {
                Ok((stream, authorization)) => {
                    return Opened::Connected(Box::new(stream), authorization)
                }
                Err(error) => error,
            };
            failures += 1;
            if !error.is_retryable() {
                warn!(code = %error.code, %error, "streaming connection rejected");
                self.fail_all(&error);
                return Opened::Idle;
            }
            if failures >= self.config.max_attempts {
                warn!(attempts = failures, code = %error.code, "giving up on streaming connection");
                self.fail_all(&error);
                return Opened::Idle;
            }

            let delay = self.config.backoff(failures - 1);
            debug!(attempt = failures, ?delay, code = %error.code, "streaming connect failed; retrying");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        None | Some(Command::Dispose) => return Opened::Disposed,
                        Some(command) => self.apply_offline(command),
                    },
                }
            }
            if self.subscriptions.is_empty() {
                return Opened::Idle;
            }
        }
    }

    /// One connection attempt: handshake, `connection_init`, and the ack.
    /// Also returns the `authorization` value the attempt was made with.
    async fn open(&self) -> ClientResult<(WsStream, Option<String>)> {
        let headers = (self.params.headers)();
        let mut request = self.params.url.as_str().into_client_request()?;
        let request_headers = request.headers_mut();
        for (name, value) in headers.iter() {
            if name == PROTOCOL_HEADER {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_client_err(ErrorCode::InvalidConfig)?;
            let value = HeaderValue::from_str(value).map_client_err(ErrorCode::InvalidConfig)?;
            request_headers.insert(name, value);
        }
        request_headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let timeout = self.config.ack_timeout;
        let handshake = async {
            let (mut stream, _) = tokio_tungstenite::connect_async(request).await?;
            let init = ClientMessage::ConnectionInit {
                payload: InitPayload { headers: &headers },
            };
            stream.send(init.to_frame()?).await?;
            wait_for_ack(&mut stream).await?;
            Ok::<_, ClientError>(stream)
        };
        let stream = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ClientError::timeout())??;
        trace!(url = %self.params.url, "connection acknowledged");
        let authorization = headers.get(AUTHORIZATION).map(str::to_owned);
        Ok((stream, authorization))
    }

    async fn serve(&mut self, mut stream: WsStream, authorization: Option<String>) -> Served {
        self.generation += 1;
        self.live.store(self.generation, Ordering::SeqCst);
        let socket = Arc::new(WsSocket {
            generation: self.generation,
            live: Arc::clone(&self.live),
            close: self.close_sender.clone(),
        });
        (self.params.on_connected)(socket);

        // Changes from here on close the socket just reported. Earlier ones
        // found nothing to close.
        let current = (self.params.headers)();
        if current.get(AUTHORIZATION) != authorization.as_deref() {
            debug!("credential changed while connecting; reconnecting");
            let _ = stream.close(None).await;
            return Served::Closed;
        }

        let ids: Vec<u64> = self.subscriptions.keys().copied().collect();
        for id in ids {
            if self.send_subscribe(&mut stream, id).await.is_err() {
                return Served::Closed;
            }
        }

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Dispose) => {
                        let _ = stream.close(None).await;
                        return Served::Disposed;
                    }
                    Some(Command::Subscribe { id, operation, sink }) => {
                        self.subscriptions.insert(id, Registered { operation, sink });
                        if self.send_subscribe(&mut stream, id).await.is_err() {
                            return Served::Closed;
                        }
                    }
                    Some(Command::Unsubscribe { id }) => {
                        if self.subscriptions.remove(&id).is_some() {
                            let complete = ClientMessage::Complete { id: id.to_string() };
                            if send(&mut stream, &complete).await.is_err() {
                                return Served::Closed;
                            }
                        }
                        if self.subscriptions.is_empty() {
                            let _ = stream.close(None).await;
                            return Served::Idle;
                        }
                    }
                },
                Some(generation) = self.close_requests.recv() => {
                    if generation == self.generation {
                        debug!("closing streaming connection on request");
                        let _ = stream.close(None).await;
                        return Served::Closed;
                    }
                }
                frame = stream.next() => match frame {
                    None | Some(Ok(Message::Close(_))) => return Served::Closed,
                    Some(Err(error)) => {
                        debug!(%error, "streaming connection failed");
                        return Served::Closed;
                    }
                    Some(Ok(frame)) => match ServerMessage::decode(&frame) {
                        Ok(Some(message)) => {
                            if self.handle(&mut stream, message).await.is_err() {
                                return Served::Closed;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            debug!(%error, "closing connection after protocol violation");
                            let _ = stream.close(None).await;
                            return Served::Closed;
                        }
                    },
                },
            }
        }
    }

    async fn handle(&mut self, stream: &mut WsStream, message: ServerMessage) -> ClientResult<()> {
        match message {
            ServerMessage::Next { id, payload } => {
                let Some(key) = self.registered(&id) else {
                    return Ok(());
                };
                let delivered = self
                    .subscriptions
                    .get(&key)
                    .is_some_and(|sub| sub.sink.send(Ok(payload)).is_ok());
                if !delivered {
                    self.subscriptions.remove(&key);
                    send(stream, &ClientMessage::Complete { id }).await?;
                }
            }
            ServerMessage::Error { id, payload } => {
                if let Some(sub) = self.registered(&id).and_then(|key| self.subscriptions.remove(&key)) {
                    let _ = sub.sink.send(Ok(Response::from_errors(payload)));
                }
            }
            ServerMessage::Complete { id } => {
                if let Some(key) = self.registered(&id) {
                    self.subscriptions.remove(&key);
                }
            }
            ServerMessage::Ping { payload } => {
                send(stream, &ClientMessage::Pong { payload }).await?;
            }
            ServerMessage::ConnectionAck { .. } | ServerMessage::Pong { .. } => {}
        }
        Ok(())
    }

    fn registered(&self, id: &str) -> Option<u64> {
        id.parse()
            .ok()
            .filter(|key| self.subscriptions.contains_key(key))
    }

    async fn send_subscribe(&self, stream: &mut WsStream, id: u64) -> ClientResult<()> {
        let Some(sub) = self.subscriptions.get(&id) else {
            return Ok(());
        };
        let message = ClientMessage::Subscribe {
            id: id.to_string(),
            payload: &sub.operation,
        };
        send(stream, &message).await
    }

    fn fail_all(&mut self, error: &ClientError) {
        for (_, sub) in std::mem::take(&mut self.subscriptions) {
            let _ = sub.sink.send(Err(error.clone()));
        }
    }
}

async fn send(stream: &mut WsStream, message: &ClientMessage<'_>) -> ClientResult<()> {
    stream.send(message.to_frame()?).await?;
    Ok(())
}

async fn wait_for_ack(stream: &mut WsStream) -> ClientResult<()> {
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        if let Message::Close(_) = frame {
            break;
        }
        match ServerMessage::decode(&frame)? {
            Some(ServerMessage::ConnectionAck { .. }) => return Ok(()),
            Some(ServerMessage::Ping { payload }) => {
                send(stream, &ClientMessage::Pong { payload }).await?;
            }
            Some(other) => {
                return Err(ClientError::protocol(format!(
                    "expected connection_ack, got {other:?}"
                )));
            }
            None => {}
        }
    }
    Err(ClientError::protocol("connection closed before ack"))
}
