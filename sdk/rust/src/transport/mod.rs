//! Transports: one-shot HTTP requests and the shared streaming connection.
//!
//! Both sides take their headers from a [`HeaderSource`] at the moment
//! they send or connect.
//!
//! [`HeaderSource`]: crate::headers::HeaderSource

mod http;
mod streaming;
mod ws;

pub use http::{HttpEngine, ReqwestEngine, StatelessTransport};
pub use streaming::{
    derive_streaming_url, ConnectParams, ConnectedHandler, Socket, SocketClient, SocketEngine,
    StreamingController, SubscriptionSink,
};
pub use ws::{WsConfig, WsEngine};
