//! Small synchronization helpers shared across the client.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot cleanup action.
///
/// Runs when [`Teardown::run`] is called or when the value is dropped,
/// whichever comes first. Used for credential listeners and streaming
/// subscriptions alike.
pub struct Teardown {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Teardown {
    /// Wraps a cleanup action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A teardown that does nothing.
    pub fn noop() -> Self {
        Self { action: None }
    }

    /// Runs the action now.
    pub fn run(mut self) {
        self.fire();
    }

    /// Detaches the action so it never runs.
    pub fn forget(mut self) {
        self.action = None;
    }

    fn fire(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("armed", &self.action.is_some())
            .finish()
    }
}
