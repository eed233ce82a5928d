//! Typed error system for the session client.
//!
//! Every failure surfaces as a [`ClientError`] carrying an [`ErrorCode`].
//! Errors are `Clone` so a single upstream failure can be fanned out to
//! every caller sharing that attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::operation::OperationKind;

/// Typed error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Network errors
    NetworkError,
    Timeout,
    ConnectionRefused,

    // Protocol errors
    HttpError,
    InvalidUrl,
    ProtocolError,

    // GraphQL errors
    ExecutionError,
    NoData,

    // Serialization errors
    SerializeError,
    DeserializeError,

    // Auth errors
    MissingAuthProvider,
    Unauthorized,
    Forbidden,

    // Client state errors
    UnsupportedCapability,
    Disposed,
    InvalidConfig,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::HttpError => "HTTP_ERROR",
            Self::InvalidUrl => "INVALID_URL",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::NoData => "NO_DATA",
            Self::SerializeError => "SERIALIZE_ERROR",
            Self::DeserializeError => "DESERIALIZE_ERROR",
            Self::MissingAuthProvider => "MISSING_AUTH_PROVIDER",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            Self::Disposed => "DISPOSED",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }

    /// Returns true if a later attempt with the same settings may succeed.
    /// Rejected credentials and bad configuration are not retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::Timeout
                | Self::ConnectionRefused
                | Self::HttpError
                | Self::ProtocolError
        )
    }

    /// Returns true for construction-time errors that no retry can fix.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingAuthProvider | Self::InvalidUrl | Self::InvalidConfig
        )
    }

    /// Returns true if the credential was rejected by the server.
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Forbidden)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by every fallible client operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct ClientError {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Extension data for debugging.
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl ClientError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extensions: None,
        }
    }

    /// Adds extension data.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let extensions = self.extensions.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            extensions.insert(key.into(), v);
        }
        self
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    /// Creates a timeout error.
    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "Request timed out")
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    /// Creates a deserialization error.
    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeserializeError, message)
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
    }

    /// Creates the error returned when no stage can carry an operation.
    pub fn unsupported(kind: OperationKind) -> Self {
        Self::new(
            ErrorCode::UnsupportedCapability,
            format!("{kind} operations are unsupported in this environment"),
        )
        .with_extension("operation_kind", kind)
    }

    /// Creates the error returned after the client has been disposed.
    pub fn disposed() -> Self {
        Self::new(ErrorCode::Disposed, "Client has been disposed")
    }

    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let code = match status {
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            _ => ErrorCode::HttpError,
        };
        let body = String::from_utf8_lossy(body);
        let preview: String = body.chars().take(200).collect();
        Self::new(code, format!("HTTP error: {status}"))
            .with_extension("status", status)
            .with_extension("body", preview)
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Returns true if this error is a construction-time failure.
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

impl Serialize for ClientError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ClientError", 3)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref ext) = self.extensions {
            state.serialize_field("extensions", ext)?;
        }
        state.end()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else if err.is_connect() {
            ErrorCode::ConnectionRefused
        } else if err.is_decode() {
            ErrorCode::DeserializeError
        } else {
            ErrorCode::NetworkError
        };
        Self::new(code, err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Url(e) => Self::new(ErrorCode::InvalidUrl, e.to_string()),
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let body = response.body().clone().unwrap_or_default();
                Self::from_status(status, &body)
            }
            WsError::Io(e) => Self::network(e.to_string()),
            other => Self::protocol(other.to_string()),
        }
    }
}

/// Type alias for client results.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Result extension for mapping foreign errors with context.
pub trait ResultExt<T> {
    /// Maps the error to a [`ClientError`] with the given code.
    fn map_client_err(self, code: ErrorCode) -> ClientResult<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn map_client_err(self, code: ErrorCode) -> ClientResult<T> {
        self.map_err(|e| ClientError::new(code, e.to_string()))
    }
}
