//! Credential access on top of an external auth provider.
//!
//! The session never obtains or refreshes tokens. It reads the provider's
//! current access token at the moment a request or connection needs one,
//! and reacts when the provider reports that the token changed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::sync::Teardown;

/// Callback invoked after the provider's token changed.
pub type TokenChangedHandler = Arc<dyn Fn() + Send + Sync>;

/// Handle for a registered token-change listener. Dropping it unsubscribes.
pub type ListenerHandle = Teardown;

/// The authentication collaborator the session binds to.
pub trait AuthProvider: Send + Sync {
    /// The current access token, if signed in. Must not block.
    fn access_token(&self) -> Option<String>;

    /// Registers `handler` to run after every token change, including
    /// sign-in and sign-out. Delivery may be deferred; bursts of changes
    /// may collapse into one call.
    fn on_token_changed(&self, handler: TokenChangedHandler) -> ListenerHandle;

    /// The GraphQL endpoint served next to this provider, when it knows one.
    fn graphql_url(&self) -> Option<String> {
        None
    }
}

/// A bearer token snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token. Empty tokens count as signed out.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Synchronous view over an [`AuthProvider`].
#[derive(Clone)]
pub struct CredentialAccessor {
    provider: Arc<dyn AuthProvider>,
}

impl CredentialAccessor {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self { provider }
    }

    /// The credential as of now.
    pub fn current(&self) -> Option<Credential> {
        self.provider.access_token().and_then(Credential::new)
    }

    /// Subscribes to credential changes for as long as the handle lives.
    pub fn on_change(&self, handler: TokenChangedHandler) -> ListenerHandle {
        self.provider.on_token_changed(handler)
    }

    pub fn graphql_url(&self) -> Option<String> {
        self.provider.graphql_url()
    }
}

impl fmt::Debug for CredentialAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialAccessor")
            .field("signed_in", &self.current().is_some())
            .finish()
    }
}

/// In-memory [`AuthProvider`] backed by a `watch` channel.
///
/// Suitable for applications that obtain tokens themselves and push them
/// in, and for tests. Listeners run on a spawned task, so registering one
/// requires a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TokenStore {
    sender: Arc<watch::Sender<Option<String>>>,
    graphql_url: Option<String>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    /// Creates a signed-out store.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
            graphql_url: None,
        }
    }

    /// Creates a store holding `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(Some(token.into()));
        store
    }

    /// Sets the GraphQL endpoint reported by this provider.
    pub fn with_graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = Some(url.into());
        self
    }

    /// Replaces the token. Listeners are only notified on a distinct value.
    pub fn set(&self, token: Option<String>) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == token {
                false
            } else {
                *current = token;
                true
            }
        });
        trace!(changed, "token store updated");
    }

    /// Signs out.
    pub fn clear(&self) {
        self.set(None);
    }

    /// The number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl AuthProvider for TokenStore {
    fn access_token(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    fn on_token_changed(&self, handler: TokenChangedHandler) -> ListenerHandle {
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                handler();
            }
        });
        Teardown::new(move || task.abort())
    }

    fn graphql_url(&self) -> Option<String> {
        self.graphql_url.clone()
    }
}
