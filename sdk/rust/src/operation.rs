//! GraphQL operations and results as they travel through the pipeline.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rustc_hash::{FxHashSet, FxHasher};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::error::{ClientError, ClientResult, ErrorCode};
use crate::headers::HeaderSet;

/// The kind of GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How cached results are weighed against the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPolicy {
    /// Serve from cache when possible, otherwise fetch.
    CacheFirst,
    /// Never fetch; a miss yields an empty result.
    CacheOnly,
    /// Always fetch, still updating the cache.
    NetworkOnly,
    /// Serve the cached result marked stale, then revalidate over the network.
    #[default]
    CacheAndNetwork,
}

impl RequestPolicy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::CacheAndNetwork => "cache-and-network",
        }
    }
}

impl fmt::Display for RequestPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "cache-only" => Ok(Self::CacheOnly),
            "network-only" => Ok(Self::NetworkOnly),
            "cache-and-network" => Ok(Self::CacheAndNetwork),
            other => Err(ClientError::config(format!(
                "unknown request policy: {other}"
            ))),
        }
    }
}

/// Per-operation settings that never reach the wire body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationContext {
    /// Overrides the client's default request policy.
    pub request_policy: Option<RequestPolicy>,
    /// Extra headers for this operation only.
    pub headers: HeaderSet,
}

/// A GraphQL request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(skip)]
    pub kind: OperationKind,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub context: OperationContext,
}

impl Operation {
    pub fn new(kind: OperationKind, query: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            variables: None,
            operation_name: None,
            context: OperationContext::default(),
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self::new(OperationKind::Query, query)
    }

    pub fn mutation(query: impl Into<String>) -> Self {
        Self::new(OperationKind::Mutation, query)
    }

    pub fn subscription(query: impl Into<String>) -> Self {
        Self::new(OperationKind::Subscription, query)
    }

    /// Builds an operation from a [`TypedOperation`].
    pub fn typed<Op: TypedOperation>(variables: &Op::Variables) -> ClientResult<Self> {
        let variables = serde_json::to_value(variables)
            .map_err(|e| ClientError::new(ErrorCode::SerializeError, e.to_string()))?;
        Ok(Self::new(Op::KIND, Op::OPERATION)
            .variables(variables)
            .operation_name(Op::OPERATION_NAME))
    }

    pub fn variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn request_policy(mut self, policy: RequestPolicy) -> Self {
        self.context.request_policy = Some(policy);
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.context.headers.insert(name, value);
        self
    }

    /// Identity used for deduplication and caching.
    ///
    /// Variables are hashed through their JSON text; object keys serialize
    /// in sorted order, so equal variable maps hash equally.
    pub fn key(&self) -> OperationKey {
        let mut hasher = FxHasher::default();
        self.kind.hash(&mut hasher);
        self.query.hash(&mut hasher);
        self.operation_name.hash(&mut hasher);
        if let Some(variables) = &self.variables {
            variables.to_string().hash(&mut hasher);
        }
        OperationKey(hasher.finish())
    }
}

/// Stable identity of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey(u64);

/// A GraphQL error location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// A GraphQL error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A GraphQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
    /// Set on a cached result emitted while a fresher one is on its way.
    #[serde(skip)]
    pub stale: bool,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<GraphQLError>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<GraphQLError>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Response {
    pub fn from_data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            errors,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the data, or the first GraphQL error.
    pub fn into_result(self) -> ClientResult<serde_json::Value> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(ClientError::new(ErrorCode::ExecutionError, error.message)
                .with_extension("path", error.path));
        }
        self.data
            .ok_or_else(|| ClientError::new(ErrorCode::NoData, "No data in response"))
    }

    /// Deserializes the data into `T`.
    pub fn data_as<T: DeserializeOwned>(self) -> ClientResult<T> {
        let data = self.into_result()?;
        serde_json::from_value(data).map_err(|e| ClientError::deserialize(e.to_string()))
    }

    /// Every `__typename` found in the data.
    pub fn typenames(&self) -> FxHashSet<String> {
        let mut names = FxHashSet::default();
        if let Some(data) = &self.data {
            collect_typenames(data, &mut names);
        }
        names
    }
}

fn collect_typenames(value: &serde_json::Value, names: &mut FxHashSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if key == "__typename" {
                    if let Some(name) = value.as_str() {
                        names.insert(name.to_owned());
                    }
                } else {
                    collect_typenames(value, names);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_typenames(item, names);
            }
        }
        _ => {}
    }
}

/// A strongly typed GraphQL operation.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize)]
/// struct OnMessageVars { room: String }
///
/// #[derive(Deserialize)]
/// struct OnMessage { message: Message }
///
/// struct MessageAdded;
/// impl TypedOperation for MessageAdded {
///     type Variables = OnMessageVars;
///     type Response = OnMessage;
///     const OPERATION: &'static str =
///         "subscription OnMessage($room: ID!) { message(room: $room) { id body } }";
///     const OPERATION_NAME: &'static str = "OnMessage";
///     const KIND: OperationKind = OperationKind::Subscription;
/// }
/// ```
pub trait TypedOperation {
    /// The input variables type.
    type Variables: Serialize;

    /// The response data type.
    type Response: DeserializeOwned;

    /// The GraphQL operation string.
    const OPERATION: &'static str;

    /// The operation name (for multi-operation documents).
    const OPERATION_NAME: &'static str;

    /// The kind of operation.
    const KIND: OperationKind;
}

/// Marker type for operations without variables.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NoVariables;
