//! Header composition.
//!
//! Headers are composed from scratch every time a transport is about to
//! send a request or open a connection. Nothing here is cached, so a
//! rotated credential is visible to the very next send.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::credential::{Credential, CredentialAccessor};

/// Authorization header name.
pub const AUTHORIZATION: &str = "authorization";

/// Header naming the subscription sub-protocol.
pub const PROTOCOL_HEADER: &str = "sec-websocket-protocol";

/// Value of [`PROTOCOL_HEADER`].
pub const PROTOCOL_MARKER: &str = "graphql-ws";

/// Produces a freshly composed header set on every call.
pub type HeaderProvider = Arc<dyn Fn() -> HeaderSet + Send + Sync>;

/// Case-insensitive header mapping. Names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeaderSet {
    entries: IndexMap<String, String>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any value stored under the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.shift_remove(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every header of `other` into `self`; `other` wins on conflict.
    pub fn merge(&mut self, other: &HeaderSet) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.insert(name, value);
        }
        set
    }
}

/// Composes the outbound headers for one send or connect attempt.
///
/// `base` goes in first; the protocol marker and the authorization entry
/// are written last so they win over anything in `base`. Without a
/// credential no authorization entry is present at all, even if `base`
/// carried one.
pub fn compose(
    base: &HeaderSet,
    credential: Option<&Credential>,
    include_streaming_marker: bool,
) -> HeaderSet {
    let mut headers = base.clone();
    headers.remove(AUTHORIZATION);
    if include_streaming_marker {
        headers.insert(PROTOCOL_HEADER, PROTOCOL_MARKER);
    }
    if let Some(credential) = credential {
        headers.insert(AUTHORIZATION, credential.bearer());
    }
    headers
}

/// Base headers bound to a credential accessor.
#[derive(Clone, Debug)]
pub struct HeaderSource {
    base: HeaderSet,
    credentials: CredentialAccessor,
}

impl HeaderSource {
    pub fn new(base: HeaderSet, credentials: CredentialAccessor) -> Self {
        Self { base, credentials }
    }

    /// Composes headers with the credential as of this call.
    pub fn compose(&self) -> HeaderSet {
        compose(&self.base, self.credentials.current().as_ref(), true)
    }

    /// Composes headers with per-operation extras layered over the base.
    pub fn compose_with(&self, extra: &HeaderSet) -> HeaderSet {
        if extra.is_empty() {
            return self.compose();
        }
        let mut base = self.base.clone();
        base.merge(extra);
        compose(&base, self.credentials.current().as_ref(), true)
    }

    /// A provider closure for engines that reconnect on their own.
    pub fn provider(&self) -> HeaderProvider {
        let source = self.clone();
        Arc::new(move || source.compose())
    }
}
