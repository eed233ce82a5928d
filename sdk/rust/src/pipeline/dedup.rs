//! Collapses identical in-flight queries into one upstream attempt.
//!
//! A query stops being shared as soon as its attempt resolves, i.e. on the
//! first item that is not a stale cache copy. Callers already attached keep
//! following the upstream stream (refocus re-runs included), while a later
//! identical query starts an attempt of its own.

use std::sync::{Arc, Mutex};

use futures::future;
use futures::stream::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{single, Next, ResultStream, Stage, StageFuture};
use crate::error::ClientResult;
use crate::operation::{Operation, OperationKey, OperationKind, Response};
use crate::sync::lock;

type Follower = mpsc::UnboundedSender<ClientResult<Response>>;

/// An attempt that has not resolved yet. Late joiners replay the stale
/// items emitted so far.
#[derive(Default)]
struct Inflight {
    history: Vec<ClientResult<Response>>,
    followers: Vec<Follower>,
}

impl Inflight {
    fn join(&mut self) -> ResultStream {
        let (follower, receiver) = mpsc::unbounded_channel();
        for item in &self.history {
            let _ = follower.send(item.clone());
        }
        self.followers.push(follower);
        UnboundedReceiverStream::new(receiver).boxed()
    }
}

type InflightMap = Arc<Mutex<FxHashMap<OperationKey, Inflight>>>;

/// Deduplication stage. Only queries are shared; mutations and
/// subscriptions always pass through.
#[derive(Default)]
pub struct DedupStage {
    inflight: InflightMap,
}

impl DedupStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upstream attempts currently shared.
    pub fn inflight_count(&self) -> usize {
        lock(&self.inflight).len()
    }
}

impl Stage for DedupStage {
    fn name(&self) -> &str {
        "dedup"
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        if operation.kind != OperationKind::Query {
            return next.run(operation);
        }

        let key = operation.key();
        let stream = {
            let mut inflight = lock(&self.inflight);
            if let Some(entry) = inflight.get_mut(&key) {
                trace!(?key, "joining in-flight query");
                entry.join()
            } else {
                let mut entry = Inflight::default();
                let stream = entry.join();
                inflight.insert(key, entry);
                tokio::spawn(drive(Arc::clone(&self.inflight), key, operation, next));
                stream
            }
        };
        Box::pin(future::ready(Ok(stream)))
    }
}

fn resolves(item: &ClientResult<Response>) -> bool {
    item.as_ref().map_or(true, |response| !response.stale)
}

/// Sends `item` to every follower, dropping the ones that went away.
fn fan_out(followers: &mut Vec<Follower>, item: &ClientResult<Response>) {
    followers.retain(|follower| follower.send(item.clone()).is_ok());
}

/// Pulls the shared upstream stream and fans every item out.
async fn drive(inflight: InflightMap, key: OperationKey, operation: Arc<Operation>, next: Next) {
    let mut upstream = match next.run(operation).await {
        Ok(stream) => stream,
        Err(error) => single(Err(error)),
    };

    // Set once the attempt resolved and the entry left the map.
    let mut detached: Option<Vec<Follower>> = None;
    while let Some(item) = upstream.next().await {
        if let Some(followers) = detached.as_mut() {
            fan_out(followers, &item);
            if followers.is_empty() {
                debug!(?key, "every caller left; dropping query");
                return;
            }
            continue;
        }

        let mut map = lock(&inflight);
        let Some(entry) = map.get_mut(&key) else {
            return;
        };
        fan_out(&mut entry.followers, &item);
        if entry.followers.is_empty() {
            map.remove(&key);
            debug!(?key, "every caller left; dropping shared query");
            return;
        }
        if resolves(&item) {
            trace!(?key, "query resolved; no longer shared");
            detached = map.remove(&key).map(|entry| entry.followers);
        } else {
            entry.history.push(item);
        }
    }

    if detached.is_none() {
        lock(&inflight).remove(&key);
    }
}
