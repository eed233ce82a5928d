//! sessionql SDK
//!
//! A GraphQL client session bound to an authentication provider. Queries
//! and mutations travel over HTTP, subscriptions over one shared WebSocket
//! connection, and both always carry the provider's current access token.
//!
//! When the token changes, HTTP needs nothing special because headers are
//! composed for every request. The WebSocket connection is force-closed
//! and the engine reconnects with the new token.
//!
//! # Client
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use sessionql_sdk::{Client, Operation, TokenStore};
//!
//! let auth = TokenStore::with_token(access_token);
//! let client = Client::builder()
//!     .auth_provider(Arc::new(auth.clone()))
//!     .endpoint_url("https://local.nhost.run/v1/graphql")
//!     .build()?;
//!
//! let todos = client.query("{ todos { id title __typename } }").await?;
//!
//! let mut events = client
//!     .subscribe(Operation::subscription("subscription { todos { id } }"))
//!     .await?;
//!
//! // Rotating the token reconnects the subscription transparently.
//! auth.set(Some(refreshed_token));
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event?.data);
//! }
//! ```
//!
//! # Pipeline
//!
//! Every operation passes through dedup, refocus and cache stages, then
//! any stages added with [`ClientBuilder::stage`], then the transport
//! dispatch stages. See [`pipeline`].

pub mod config;
pub mod credential;
pub mod error;
pub mod headers;
pub mod operation;
pub mod pipeline;
pub mod session;
mod sync;
pub mod transport;

pub use config::{Capabilities, ClientConfig};
pub use credential::{
    AuthProvider, Credential, CredentialAccessor, ListenerHandle, TokenChangedHandler, TokenStore,
};
pub use error::{ClientError, ClientResult, ErrorCode, ResultExt};
pub use headers::{compose, HeaderProvider, HeaderSet, HeaderSource};
pub use operation::{
    GraphQLError, Location, NoVariables, Operation, OperationContext, OperationKey, OperationKind,
    RequestPolicy, Response, TypedOperation,
};
pub use pipeline::{stage_fn, FocusSignal, Next, Pipeline, ResultStream, Stage, StageFuture};
pub use session::{Client, ClientBuilder};
pub use sync::Teardown;
pub use transport::{
    derive_streaming_url, HttpEngine, ReqwestEngine, Socket, SocketClient, SocketEngine,
    StreamingController, SubscriptionSink, WsConfig, WsEngine,
};
