//! In-memory engines for driving a client without a network.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use sessionql_sdk::transport::{ConnectParams, Socket, SocketClient, SocketEngine, SubscriptionSink};
use sessionql_sdk::{ClientResult, HeaderSet, HttpEngine, Operation, Response, Teardown};
use tokio::sync::Semaphore;

/// Lets spawned listener tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub operation: Operation,
    pub headers: HeaderSet,
}

/// Records every request and answers from a queue, falling back to
/// `{"ok": true}`.
#[derive(Default)]
pub struct MockHttpEngine {
    sent: Mutex<Vec<SentRequest>>,
    queued: Mutex<VecDeque<ClientResult<Response>>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockHttpEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests wait for a permit on `gate` before answering.
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn respond(&self, result: ClientResult<Response>) {
        self.queued.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn authorization(&self, index: usize) -> Option<String> {
        self.sent.lock().unwrap()[index]
            .headers
            .get("authorization")
            .map(str::to_owned)
    }
}

#[async_trait]
impl HttpEngine for MockHttpEngine {
    async fn send(
        &self,
        _url: &str,
        operation: &Operation,
        headers: &HeaderSet,
    ) -> ClientResult<Response> {
        self.sent.lock().unwrap().push(SentRequest {
            operation: operation.clone(),
            headers: headers.clone(),
        });
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        let queued = self.queued.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(Response::from_data(serde_json::json!({"ok": true}))))
    }
}

// =============================================================================
// Streaming
// =============================================================================

/// Shared state of the mock streaming engine.
///
/// Connects on the first subscription. Closing the live socket while
/// subscriptions remain reconnects right away, asking the header provider
/// again, the way a real engine does after its backoff.
#[derive(Default)]
pub struct SocketState {
    params: Mutex<Option<ConnectParams>>,
    sinks: Mutex<BTreeMap<u64, SubscriptionSink>>,
    handshakes: Mutex<Vec<HeaderSet>>,
    sockets: Mutex<Vec<Arc<MockSocket>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl SocketState {
    /// Headers seen by every connect attempt, in order.
    pub fn handshakes(&self) -> Vec<HeaderSet> {
        self.handshakes.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.sockets.lock().unwrap()[index])
    }

    pub fn total_closes(&self) -> usize {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .map(|socket| socket.closes())
            .sum()
    }

    pub fn subscriptions(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> Option<String> {
        self.params.lock().unwrap().as_ref().map(|p| p.url.clone())
    }

    /// Delivers `data` to every live subscription.
    pub fn emit(&self, data: serde_json::Value) {
        for sink in self.sinks.lock().unwrap().values() {
            let _ = sink.send(Ok(Response::from_data(data.clone())));
        }
    }

    fn live(&self) -> bool {
        self.sockets
            .lock()
            .unwrap()
            .last()
            .is_some_and(|socket| !socket.is_closed())
    }

    fn connect(self: &Arc<Self>) {
        let Some(params) = self.params.lock().unwrap().clone() else {
            return;
        };
        self.handshakes.lock().unwrap().push((params.headers)());
        let socket = Arc::new(MockSocket {
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            state: Arc::downgrade(self),
        });
        self.sockets.lock().unwrap().push(Arc::clone(&socket));
        (params.on_connected)(socket);
    }
}

pub struct MockSocket {
    closes: AtomicUsize,
    closed: AtomicBool,
    state: Weak<SocketState>,
}

impl MockSocket {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn close(&self) -> bool {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(state) = self.state.upgrade() {
            if state.subscriptions() > 0 && !state.is_disposed() {
                state.connect();
            }
        }
        true
    }
}

struct MockSocketClient {
    state: Arc<SocketState>,
}

impl SocketClient for MockSocketClient {
    fn subscribe(&self, _operation: &Operation, sink: SubscriptionSink) -> Teardown {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.sinks.lock().unwrap().insert(id, sink);
        if !self.state.live() {
            self.state.connect();
        }
        let state = Arc::clone(&self.state);
        Teardown::new(move || {
            state.sinks.lock().unwrap().remove(&id);
        })
    }

    fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
        self.state.sinks.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct MockSocketEngine {
    pub state: Arc<SocketState>,
}

impl MockSocketEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SocketEngine for MockSocketEngine {
    fn start(&self, params: ConnectParams) -> Arc<dyn SocketClient> {
        *self.state.params.lock().unwrap() = Some(params);
        Arc::new(MockSocketClient {
            state: Arc::clone(&self.state),
        })
    }
}
