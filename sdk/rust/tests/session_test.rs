//! Integration tests for sessionql_sdk

mod support;

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sessionql_sdk::{
    stage_fn, Capabilities, Client, ClientError, ErrorCode, FocusSignal, GraphQLError,
    NoVariables, Operation, OperationKind, RequestPolicy, Response, TokenStore, TypedOperation,
};
use support::{settle, MockHttpEngine, MockSocketEngine};
use tokio::sync::Semaphore;

const URL: &str = "https://example.nhost.run/v1/graphql";

struct Harness {
    client: Client,
    auth: TokenStore,
    http: Arc<MockHttpEngine>,
    sockets: Arc<MockSocketEngine>,
}

fn harness(token: Option<&str>) -> Harness {
    harness_with(token, |builder| builder)
}

fn harness_with(
    token: Option<&str>,
    configure: impl FnOnce(sessionql_sdk::ClientBuilder) -> sessionql_sdk::ClientBuilder,
) -> Harness {
    let auth = match token {
        Some(token) => TokenStore::with_token(token),
        None => TokenStore::new(),
    };
    let http = MockHttpEngine::new();
    let sockets = MockSocketEngine::new();
    let builder = Client::builder()
        .auth_provider(Arc::new(auth.clone()))
        .endpoint_url(URL)
        .http_engine(http.clone())
        .socket_engine(sockets.clone());
    let client = configure(builder).build().expect("client should build");
    Harness {
        client,
        auth,
        http,
        sockets,
    }
}

// =============================================================================
// Construction
// =============================================================================

#[tokio::test]
async fn test_missing_auth_provider_is_rejected() {
    let err = Client::builder().endpoint_url(URL).build().unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingAuthProvider);
}

#[tokio::test]
async fn test_missing_endpoint_is_rejected() {
    let err = Client::builder()
        .auth_provider(Arc::new(TokenStore::new()))
        .http_engine(MockHttpEngine::new())
        .socket_engine(MockSocketEngine::new())
        .build()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidUrl);
}

#[tokio::test]
async fn test_endpoint_falls_back_to_provider_url() {
    let sockets = MockSocketEngine::new();
    let client = Client::builder()
        .auth_provider(Arc::new(TokenStore::new().with_graphql_url(URL)))
        .http_engine(MockHttpEngine::new())
        .socket_engine(sockets.clone())
        .build()
        .unwrap();

    assert_eq!(client.url(), URL);
    assert_eq!(
        client.streaming_url(),
        Some("wss://example.nhost.run/v1/graphql")
    );
    assert_eq!(
        sockets.state.url().as_deref(),
        Some("wss://example.nhost.run/v1/graphql")
    );
}

#[tokio::test]
async fn test_default_stage_order() {
    let h = harness(None);
    assert_eq!(
        h.client.stage_names(),
        vec!["dedup", "refocus", "cache", "fetch", "subscription"]
    );
    assert!(h.client.supports_subscriptions());
}

#[tokio::test]
async fn test_custom_stages_run_between_cache_and_dispatch() {
    let h = harness_with(None, |builder| {
        builder
            .stage(stage_fn("first", |op, next| next.run(op)))
            .stage(stage_fn("second", |op, next| next.run(op)))
    });
    assert_eq!(
        h.client.stage_names(),
        vec!["dedup", "refocus", "cache", "first", "second", "fetch", "subscription"]
    );
}

#[tokio::test]
async fn test_custom_stage_can_answer_without_transport() {
    let h = harness_with(None, |builder| {
        builder.stage(stage_fn("mock", |_op, _next| {
            Box::pin(async {
                Ok(sessionql_sdk::pipeline::single(Ok(Response::from_data(
                    json!({"mocked": true}),
                ))))
            })
        }))
    });

    let response = h.client.query("{ anything }").await.unwrap();
    assert_eq!(response.data, Some(json!({"mocked": true})));
    assert_eq!(h.http.calls(), 0);
}

// =============================================================================
// Credential rotation
// =============================================================================

#[tokio::test]
async fn test_http_rotation_without_subscriptions() {
    let h = harness(Some("T1"));

    h.client.query("{ a }").await.unwrap();
    h.auth.set(Some("T2".into()));
    settle().await;
    h.client.query("{ b }").await.unwrap();

    assert_eq!(h.http.authorization(0).as_deref(), Some("Bearer T1"));
    assert_eq!(h.http.authorization(1).as_deref(), Some("Bearer T2"));
    assert_eq!(h.sockets.state.connections(), 0);
    assert_eq!(h.sockets.state.total_closes(), 0);
}

#[tokio::test]
async fn test_requests_carry_protocol_marker_and_single_authorization() {
    let h = harness_with(Some("T1"), |builder| {
        builder.header("Authorization", "Basic stale").header("x-hasura-role", "user")
    });
    h.client.query("{ a }").await.unwrap();

    let sent = h.http.sent();
    let headers = &sent[0].headers;
    let auth: Vec<_> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .collect();
    assert_eq!(auth, vec![("authorization", "Bearer T1")]);
    assert_eq!(headers.get("sec-websocket-protocol"), Some("graphql-ws"));
    assert_eq!(headers.get("x-hasura-role"), Some("user"));
}

#[tokio::test]
async fn test_signed_out_requests_have_no_authorization() {
    let h = harness(None);
    h.client.query("{ a }").await.unwrap();
    assert_eq!(h.http.authorization(0), None);
}

#[tokio::test]
async fn test_rotation_reconnects_active_subscription() {
    let h = harness(Some("T1"));
    let mut events = h
        .client
        .subscribe(Operation::subscription("subscription { todos { id } }"))
        .await
        .unwrap();

    let state = &h.sockets.state;
    assert_eq!(state.connections(), 1);
    assert_eq!(
        state.handshakes()[0].get("authorization"),
        Some("Bearer T1")
    );

    state.emit(json!({"todos": [1]}));
    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.data, Some(json!({"todos": [1]})));

    h.auth.set(Some("T2".into()));
    settle().await;

    assert_eq!(state.socket(0).closes(), 1);
    assert_eq!(state.total_closes(), 1);
    assert_eq!(state.connections(), 2);
    assert_eq!(
        state.handshakes()[1].get("authorization"),
        Some("Bearer T2")
    );

    // The caller's stream survives the reconnect.
    state.emit(json!({"todos": [1, 2]}));
    let second = events.next().await.unwrap().unwrap();
    assert_eq!(second.data, Some(json!({"todos": [1, 2]})));

    // HTTP picks up the new token too.
    h.client.query("{ a }").await.unwrap();
    assert_eq!(h.http.authorization(0).as_deref(), Some("Bearer T2"));
}

#[tokio::test]
async fn test_sign_out_reconnects_without_authorization() {
    let h = harness(Some("T1"));
    let _events = h
        .client
        .subscribe(Operation::subscription("subscription { a }"))
        .await
        .unwrap();

    h.auth.clear();
    settle().await;

    let handshakes = h.sockets.state.handshakes();
    assert_eq!(handshakes.len(), 2);
    assert_eq!(handshakes[1].get("authorization"), None);
    assert_eq!(
        handshakes[1].get("sec-websocket-protocol"),
        Some("graphql-ws")
    );
}

#[tokio::test]
async fn test_rotation_before_any_connection_is_harmless() {
    let h = harness(Some("T1"));
    h.auth.set(Some("T2".into()));
    settle().await;
    h.auth.clear();
    settle().await;

    assert_eq!(h.sockets.state.connections(), 0);
    assert_eq!(h.sockets.state.total_closes(), 0);
}

#[tokio::test]
async fn test_unsubscribing_keeps_shared_connection() {
    let h = harness(Some("T1"));
    let first = h
        .client
        .subscribe(Operation::subscription("subscription { a }"))
        .await
        .unwrap();
    let mut second = h
        .client
        .subscribe(Operation::subscription("subscription { b }"))
        .await
        .unwrap();
    assert_eq!(h.sockets.state.subscriptions(), 2);

    drop(first);
    assert_eq!(h.sockets.state.subscriptions(), 1);
    assert_eq!(h.sockets.state.total_closes(), 0);

    h.sockets.state.emit(json!({"b": 1}));
    assert!(second.next().await.unwrap().is_ok());
}

// =============================================================================
// Capabilities
// =============================================================================

#[tokio::test]
async fn test_restricted_environment_rejects_subscriptions() {
    let h = harness_with(Some("T1"), |builder| {
        builder.capabilities(Capabilities::restricted())
    });

    assert!(!h.client.supports_subscriptions());
    assert_eq!(h.client.streaming_url(), None);
    assert!(!h.client.stage_names().iter().any(|s| s == "subscription"));

    let err = match h
        .client
        .subscribe(Operation::subscription("subscription { a }"))
        .await
    {
        Ok(_) => panic!("subscription should be rejected"),
        Err(err) => err,
    };
    assert_eq!(err.code, ErrorCode::UnsupportedCapability);

    // Queries still work, and rotation is a no-op for streaming.
    h.client.query("{ a }").await.unwrap();
    h.auth.set(Some("T2".into()));
    settle().await;
    assert_eq!(h.sockets.state.connections(), 0);
}

// =============================================================================
// Pipeline behaviour
// =============================================================================

#[tokio::test]
async fn test_concurrent_identical_queries_are_deduplicated() {
    let gate = Arc::new(Semaphore::new(0));
    let http = MockHttpEngine::gated(gate.clone());
    let client = Client::builder()
        .auth_provider(Arc::new(TokenStore::with_token("T1")))
        .endpoint_url(URL)
        .http_engine(http.clone())
        .capabilities(Capabilities::restricted())
        .build()
        .unwrap();

    let op = Operation::query("query Todos { todos { id } }");
    let mut first = client.execute(op.clone()).await.unwrap();
    let mut second = client.execute(op).await.unwrap();
    gate.add_permits(1);

    let a = first.next().await.unwrap().unwrap();
    let b = second.next().await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(http.calls(), 1);
}

#[tokio::test]
async fn test_deduplicated_failure_reaches_both_callers() {
    let gate = Arc::new(Semaphore::new(0));
    let http = MockHttpEngine::gated(gate.clone());
    http.respond(Err(ClientError::from_status(401, b"expired")));
    let client = Client::builder()
        .auth_provider(Arc::new(TokenStore::with_token("T1")))
        .endpoint_url(URL)
        .http_engine(http.clone())
        .capabilities(Capabilities::restricted())
        .build()
        .unwrap();

    let op = Operation::query("{ me { id } }");
    let mut first = client.execute(op.clone()).await.unwrap();
    let mut second = client.execute(op).await.unwrap();
    gate.add_permits(1);

    let a = first.next().await.unwrap().unwrap_err();
    let b = second.next().await.unwrap().unwrap_err();
    assert_eq!(a.code, ErrorCode::Unauthorized);
    assert_eq!(a, b);
    assert_eq!(http.calls(), 1);
}

#[tokio::test]
async fn test_cache_first_serves_repeated_query() {
    let h = harness_with(Some("T1"), |builder| {
        builder.request_policy(RequestPolicy::CacheFirst)
    });
    h.http
        .respond(Ok(Response::from_data(json!({"todos": [{"__typename": "Todo", "id": 1}]}))));

    let first = h.client.query("{ todos { id } }").await.unwrap();
    let second = h.client.query("{ todos { id } }").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.http.calls(), 1);
}

#[tokio::test]
async fn test_cache_and_network_revalidates() {
    let h = harness(Some("T1"));
    h.http.respond(Ok(Response::from_data(json!({"n": 1}))));
    h.http.respond(Ok(Response::from_data(json!({"n": 2}))));

    h.client.query("{ n }").await.unwrap();
    let results: Vec<_> = h
        .client
        .execute(Operation::query("{ n }"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    let stale = results[0].as_ref().unwrap();
    let fresh = results[1].as_ref().unwrap();
    assert!(stale.stale);
    assert_eq!(stale.data, Some(json!({"n": 1})));
    assert!(!fresh.stale);
    assert_eq!(fresh.data, Some(json!({"n": 2})));
}

#[tokio::test]
async fn test_mutation_invalidates_related_queries() {
    let h = harness_with(Some("T1"), |builder| {
        builder.request_policy(RequestPolicy::CacheFirst)
    });
    h.http
        .respond(Ok(Response::from_data(json!({"todos": [{"__typename": "Todo", "id": 1}]}))));
    h.http.respond(Ok(Response::from_data(
        json!({"insert_todo": {"__typename": "Todo", "id": 2}}),
    )));

    h.client.query("{ todos { id } }").await.unwrap();
    h.client.mutate("mutation { insert_todo { id } }").await.unwrap();
    h.client.query("{ todos { id } }").await.unwrap();

    let kinds: Vec<_> = h.http.sent().iter().map(|r| r.operation.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Query
        ]
    );
}

#[tokio::test]
async fn test_graphql_errors_are_data() {
    let h = harness(Some("T1"));
    h.http.respond(Ok(Response::from_errors(vec![GraphQLError {
        message: "field not found".into(),
        locations: Vec::new(),
        path: None,
        extensions: None,
    }])));

    let response = h.client.query("{ missing }").await.unwrap();
    assert!(response.has_errors());
    assert_eq!(
        response.into_result().unwrap_err().code,
        ErrorCode::ExecutionError
    );
}

#[tokio::test]
async fn test_focus_reexecutes_live_query() {
    let signal = FocusSignal::new();
    let h = harness_with(Some("T1"), |builder| builder.focus_signal(signal.clone()));
    h.http.respond(Ok(Response::from_data(json!({"n": 1}))));
    h.http.respond(Ok(Response::from_data(json!({"n": 2}))));

    let mut results = h.client.execute(Operation::query("{ n }")).await.unwrap();
    let first = results.next().await.unwrap().unwrap();
    assert_eq!(first.data, Some(json!({"n": 1})));

    assert_eq!(signal.notify(), 1);
    // cache-and-network: the cached copy first, then the refetch.
    let stale = results.next().await.unwrap().unwrap();
    assert!(stale.stale);
    let fresh = results.next().await.unwrap().unwrap();
    assert_eq!(fresh.data, Some(json!({"n": 2})));
    assert_eq!(h.http.calls(), 2);
}

#[tokio::test]
async fn test_live_query_does_not_absorb_later_identical_requests() {
    let signal = FocusSignal::new();
    let h = harness_with(Some("T1"), |builder| builder.focus_signal(signal.clone()));
    h.http.respond(Ok(Response::from_data(json!({"n": 1}))));
    h.http.respond(Ok(Response::from_data(json!({"n": 2}))));

    let mut live = h.client.execute(Operation::query("{ n }")).await.unwrap();
    let first = live.next().await.unwrap().unwrap();
    assert_eq!(first.data, Some(json!({"n": 1})));

    let later = h
        .client
        .request(Operation::query("{ n }").request_policy(RequestPolicy::NetworkOnly))
        .await
        .unwrap();
    assert_eq!(later.data, Some(json!({"n": 2})));
    assert!(!later.stale);
    assert_eq!(h.http.calls(), 2);
    drop(live);
}

// =============================================================================
// Typed operations
// =============================================================================

#[derive(Debug, Deserialize, PartialEq)]
struct TodoCount {
    count: u32,
}

struct CountTodos;

impl TypedOperation for CountTodos {
    type Variables = NoVariables;
    type Response = TodoCount;
    const OPERATION: &'static str = "query CountTodos { count }";
    const OPERATION_NAME: &'static str = "CountTodos";
    const KIND: OperationKind = OperationKind::Query;
}

#[derive(Serialize)]
struct RoomVars {
    room: String,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    body: String,
}

struct OnMessage;

impl TypedOperation for OnMessage {
    type Variables = RoomVars;
    type Response = MessageAdded;
    const OPERATION: &'static str = "subscription OnMessage($room: ID!) { body }";
    const OPERATION_NAME: &'static str = "OnMessage";
    const KIND: OperationKind = OperationKind::Subscription;
}

#[tokio::test]
async fn test_typed_query() {
    let h = harness(Some("T1"));
    h.http.respond(Ok(Response::from_data(json!({"count": 3}))));

    let data = h.client.execute_typed::<CountTodos>(&NoVariables).await.unwrap();
    assert_eq!(data, TodoCount { count: 3 });

    let sent = h.http.sent();
    assert_eq!(sent[0].operation.operation_name.as_deref(), Some("CountTodos"));
}

#[tokio::test]
async fn test_typed_subscription() {
    let h = harness(Some("T1"));
    let mut events = h
        .client
        .subscribe_typed::<OnMessage>(&RoomVars {
            room: "general".into(),
        })
        .await
        .unwrap();

    h.sockets.state.emit(json!({"body": "hello"}));
    let event = events.next().await.unwrap().unwrap();
    assert_eq!(event.body, "hello");
}

// =============================================================================
// Disposal
// =============================================================================

#[tokio::test]
async fn test_dispose_stops_everything() {
    let h = harness(Some("T1"));
    let _events = h
        .client
        .subscribe(Operation::subscription("subscription { a }"))
        .await
        .unwrap();
    assert_eq!(h.auth.listener_count(), 1);

    h.client.dispose();
    h.client.dispose();
    settle().await;

    assert!(h.client.is_disposed());
    assert!(h.sockets.state.is_disposed());
    assert_eq!(h.sockets.state.total_closes(), 1);
    assert_eq!(h.auth.listener_count(), 0);

    h.auth.set(Some("T2".into()));
    settle().await;
    assert_eq!(h.sockets.state.connections(), 1);

    let err = h.client.query("{ a }").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Disposed);
}
