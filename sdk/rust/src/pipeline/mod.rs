//! The stage pipeline every operation flows through.
//!
//! A stage receives the operation and a [`Next`] handle for the rest of
//! the chain. It may pass the operation on unchanged, answer it itself
//! (a cache hit), or wrap the downstream result stream. The last stages
//! dispatch to a transport; an operation that falls off the end of the
//! chain fails with [`ErrorCode::UnsupportedCapability`].
//!
//! ```ignore
//! use sessionql_sdk::pipeline::{stage_fn, Next};
//!
//! let logging = stage_fn("logging", |operation, next: Next| {
//!     Box::pin(async move {
//!         tracing::info!(kind = %operation.kind, "dispatching");
//!         next.run(operation).await
//!     })
//! });
//! ```
//!
//! [`ErrorCode::UnsupportedCapability`]: crate::error::ErrorCode::UnsupportedCapability

mod cache;
mod dedup;
mod dispatch;
mod refocus;

pub use cache::CacheStage;
pub use dedup::DedupStage;
pub use dispatch::{FetchStage, SubscriptionStage};
pub use refocus::{FocusSignal, RefocusStage};

use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{ClientError, ClientResult};
use crate::operation::{Operation, Response};

/// Results of one operation. Queries and mutations usually yield one item;
/// cache-and-network yields a stale item first; subscriptions stay open.
pub type ResultStream = BoxStream<'static, ClientResult<Response>>;

/// What a stage hands back.
pub type StageFuture = BoxFuture<'static, ClientResult<ResultStream>>;

/// A request-processing stage.
pub trait Stage: Send + Sync + 'static {
    /// Name reported by [`Pipeline::stage_names`].
    fn name(&self) -> &str;

    /// Processes `operation`, calling `next` to continue down the chain.
    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture;
}

/// The remainder of the chain after the current stage.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn Stage>]>,
    index: usize,
}

impl Next {
    /// Runs the rest of the chain.
    pub fn run(self, operation: Arc<Operation>) -> StageFuture {
        match self.stages.get(self.index).cloned() {
            Some(stage) => {
                let next = Next {
                    stages: self.stages,
                    index: self.index + 1,
                };
                stage.run(operation, next)
            }
            None => {
                let error = ClientError::unsupported(operation.kind);
                Box::pin(future::ready(Err(error)))
            }
        }
    }
}

/// Closure-backed stage created by [`stage_fn`].
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> Stage for FnStage<F>
where
    F: Fn(Arc<Operation>, Next) -> StageFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        (self.f)(operation, next)
    }
}

/// Wraps a closure as a stage.
pub fn stage_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Stage>
where
    F: Fn(Arc<Operation>, Next) -> StageFuture + Send + Sync + 'static,
{
    Arc::new(FnStage {
        name: name.into(),
        f,
    })
}

/// A stream with a single item.
pub fn single(result: ClientResult<Response>) -> ResultStream {
    stream::once(future::ready(result)).boxed()
}

/// An ordered, immutable list of stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_owned()).collect()
    }

    /// Sends `operation` through every stage.
    pub fn execute(&self, operation: Arc<Operation>) -> StageFuture {
        Next {
            stages: Arc::clone(&self.stages),
            index: 0,
        }
        .run(operation)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
