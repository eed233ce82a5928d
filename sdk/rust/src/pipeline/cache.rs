//! Document cache keyed by operation identity.
//!
//! Successful query results are stored together with the `__typename`s
//! found in their data. A mutation result evicts every cached query that
//! shares one of its typenames.

use std::sync::{Arc, Mutex};

use futures::future;
use futures::stream::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use super::{single, Next, ResultStream, Stage, StageFuture};
use crate::operation::{Operation, OperationKey, OperationKind, RequestPolicy, Response};
use crate::sync::lock;

struct CachedResult {
    response: Response,
    typenames: FxHashSet<String>,
}

type Entries = Arc<Mutex<FxHashMap<OperationKey, CachedResult>>>;

/// Caching stage honouring [`RequestPolicy`].
pub struct CacheStage {
    default_policy: RequestPolicy,
    entries: Entries,
}

impl CacheStage {
    pub fn new(default_policy: RequestPolicy) -> Self {
        Self {
            default_policy,
            entries: Arc::default(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: OperationKey) -> Option<Response> {
        lock(&self.entries)
            .get(&key)
            .map(|entry| entry.response.clone())
    }
}

impl Stage for CacheStage {
    fn name(&self) -> &str {
        "cache"
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        match operation.kind {
            OperationKind::Subscription => next.run(operation),
            OperationKind::Mutation => {
                let entries = Arc::clone(&self.entries);
                Box::pin(async move {
                    let results = next.run(operation).await?;
                    Ok(results
                        .inspect(move |item| {
                            if let Ok(response) = item {
                                invalidate(&entries, response);
                            }
                        })
                        .boxed())
                })
            }
            OperationKind::Query => {
                let policy = operation
                    .context
                    .request_policy
                    .unwrap_or(self.default_policy);
                let key = operation.key();
                let cached = self.cached(key);
                trace!(?key, %policy, hit = cached.is_some(), "cache lookup");

                match (policy, cached) {
                    (RequestPolicy::CacheFirst | RequestPolicy::CacheOnly, Some(response)) => {
                        Box::pin(future::ready(Ok(single(Ok(response)))))
                    }
                    (RequestPolicy::CacheOnly, None) => {
                        Box::pin(future::ready(Ok(single(Ok(Response::default())))))
                    }
                    (RequestPolicy::CacheAndNetwork, Some(mut response)) => {
                        response.stale = true;
                        let entries = Arc::clone(&self.entries);
                        Box::pin(async move {
                            let fresh = match next.run(operation).await {
                                Ok(results) => store(entries, key, results),
                                Err(error) => single(Err(error)),
                            };
                            Ok(single(Ok(response)).chain(fresh).boxed())
                        })
                    }
                    _ => {
                        let entries = Arc::clone(&self.entries);
                        Box::pin(async move {
                            let results = next.run(operation).await?;
                            Ok(store(entries, key, results))
                        })
                    }
                }
            }
        }
    }
}

/// Stores every successful result of `results` as it passes by.
fn store(entries: Entries, key: OperationKey, results: ResultStream) -> ResultStream {
    results
        .inspect(move |item| {
            if let Ok(response) = item {
                if response.data.is_some() && !response.has_errors() {
                    let typenames = response.typenames();
                    let mut stored = response.clone();
                    stored.stale = false;
                    lock(&entries).insert(
                        key,
                        CachedResult {
                            response: stored,
                            typenames,
                        },
                    );
                }
            }
        })
        .boxed()
}

fn invalidate(entries: &Entries, mutation_result: &Response) {
    let touched = mutation_result.typenames();
    if touched.is_empty() {
        return;
    }
    let mut entries = lock(entries);
    let before = entries.len();
    entries.retain(|_, cached| cached.typenames.is_disjoint(&touched));
    let evicted = before - entries.len();
    if evicted > 0 {
        debug!(evicted, typenames = ?touched, "mutation invalidated cached queries");
    }
}
