//! Re-executes live queries when the host application regains focus.

use std::sync::Arc;

use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{single, Next, ResultStream, Stage, StageFuture};
use crate::error::ClientResult;
use crate::operation::{Operation, OperationKind, RequestPolicy, Response};

const FOCUS_CAPACITY: usize = 16;
const RESULT_CAPACITY: usize = 16;

/// Host-supplied "application regained focus" events.
#[derive(Clone, Debug)]
pub struct FocusSignal {
    sender: broadcast::Sender<()>,
}

impl Default for FocusSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FOCUS_CAPACITY);
        Self { sender }
    }

    /// Reports a focus event. Returns how many live queries will refresh.
    pub fn notify(&self) -> usize {
        self.sender.send(()).unwrap_or(0)
    }

    fn listen(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

/// Refocus stage. Without a signal it is a pass-through.
pub struct RefocusStage {
    signal: Option<FocusSignal>,
}

impl RefocusStage {
    pub fn new(signal: Option<FocusSignal>) -> Self {
        Self { signal }
    }
}

impl Stage for RefocusStage {
    fn name(&self) -> &str {
        "refocus"
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        let Some(signal) = self.signal.as_ref() else {
            return next.run(operation);
        };
        if operation.kind != OperationKind::Query {
            return next.run(operation);
        }

        let mut focus = signal.listen();
        Box::pin(async move {
            let initial = next.clone().run(Arc::clone(&operation)).await?;
            let (sender, receiver) = mpsc::channel(RESULT_CAPACITY);

            tokio::spawn(async move {
                if !forward(initial, &sender).await {
                    return;
                }
                let refresh = Arc::new(
                    Operation::clone(&operation).request_policy(RequestPolicy::CacheAndNetwork),
                );
                loop {
                    tokio::select! {
                        () = sender.closed() => break,
                        event = focus.recv() => match event {
                            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                debug!(kind = %refresh.kind, "focus regained; re-executing query");
                                let results = match next.clone().run(Arc::clone(&refresh)).await {
                                    Ok(results) => results,
                                    Err(error) => single(Err(error)),
                                };
                                if !forward(results, &sender).await {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });

            Ok(ReceiverStream::new(receiver).boxed())
        })
    }
}

/// Copies `results` into `sender`. Returns false once the caller is gone.
async fn forward(mut results: ResultStream, sender: &mpsc::Sender<ClientResult<Response>>) -> bool {
    while let Some(item) = results.next().await {
        if sender.send(item).await.is_err() {
            return false;
        }
    }
    true
}
